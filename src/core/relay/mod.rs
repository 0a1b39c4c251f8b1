//! Retry orchestration
//!
//! Drives one logical request across the cache, monitor, selector,
//! adaptor, rate limiter, and billing, with deadline-aware failover.

mod meta;
mod orchestrator;
mod sink;

pub use meta::RelayMeta;
pub use orchestrator::{RelayContext, RelayInputs, RelayResult, serve};
pub use sink::{ResponseSink, SinkEvent, SinkReceiver};
