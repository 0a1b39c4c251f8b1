//! Wire types shared by adaptors and the relay layer

mod audio;
mod rerank;
mod usage;

pub use audio::SpeechRequest;
pub use rerank::{RerankRequest, RerankResponse, RerankResult};
pub use usage::{ApiUsage, Usage};
