//! Database entities

pub mod channel;
pub mod channel_test;
pub mod group;
pub mod model_config;
pub mod public_mcp;
pub mod request_log;
pub mod token;
