//! # modelgate
//!
//! A multi-tenant AI model gateway: accepts OpenAI-compatible requests from
//! groups authenticated by tokens, forwards each request to one of many
//! heterogeneous upstream channels, translating request/response shapes as
//! needed, enforcing quotas, and recording usage and cost.
//!
//! ## Features
//!
//! - **OpenAI Compatible**: chat, completions, embeddings, images, speech,
//!   transcription, rerank under `/v1/...`
//! - **Weighted channel selection**: priority / clamped-error-rate weighting
//!   over the enabled channel set, with health-aware auto-bans
//! - **Retry orchestration**: failover across channels on transient upstream
//!   failure, bounded by a deadline and a retry budget
//! - **Quota & billing**: pre-request balance check, streaming usage
//!   accounting, idempotent post-request debit, RPM/TPM counters
//!
//! ## Gateway Mode
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = modelgate::Config::load("config/gateway.yaml")?;
//!     modelgate::server::run_server(config).await?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod core;
pub mod server;
pub mod storage;
pub mod utils;

// Re-export main types
pub use config::Config;
pub use utils::error::{GatewayError, Result};
