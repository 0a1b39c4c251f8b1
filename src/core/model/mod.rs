//! Domain model
//!
//! Persistent entities as the core sees them: channels, model configs,
//! groups. The storage layer owns the row representations and converts
//! into these.

mod channel;
mod group;
mod model_config;

pub use channel::{Channel, ChannelStatus, ChannelType, DEFAULT_PRIORITY, DEFAULT_SET};
pub use group::{Group, GroupStatus};
pub use model_config::{ModelConfig, Price};
