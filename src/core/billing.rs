//! Balance & billing pipeline
//!
//! Pre-request balance check, post-request debit with an idempotent
//! consumer handle, and the per-mode amount computation. The production
//! billing backend is wired at startup behind [`GroupBalance`]; the
//! in-process backend here is the default.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::core::mode::Mode;
use crate::core::model::{Group, ModelConfig};
use crate::core::relay::RelayMeta;
use crate::core::types::Usage;
use crate::utils::error::{GatewayError, Result};

/// Billing backend: resolves a group's remaining balance and hands out a
/// consumer scoped to one request.
#[async_trait]
pub trait GroupBalance: Send + Sync {
    /// Returns the current remaining balance and the consumer to debit
    /// through once the request reaches a terminal state.
    ///
    /// Fails with `QuotaExhausted` when the balance is not positive, or
    /// with a retryable `Internal`/transport error when the backend is
    /// unavailable.
    async fn pre_check(&self, group: &Group) -> Result<(f64, Arc<dyn PostGroupConsumer>)>;
}

/// Debit handle scoped to one request. Implementations must be safe
/// against concurrent requests in the same group, and must treat a second
/// call on the same handle as a no-op.
#[async_trait]
pub trait PostGroupConsumer: Send + Sync + std::fmt::Debug {
    async fn post_consume(&self, token_name: &str, amount: f64) -> Result<f64>;
}

/// In-process billing backend over a shared balance table.
pub struct InProcessGroupBalance {
    balances: Arc<DashMap<String, f64>>,
    default_balance: f64,
}

impl InProcessGroupBalance {
    pub fn new(default_balance: f64) -> Self {
        Self {
            balances: Arc::new(DashMap::new()),
            default_balance,
        }
    }

    /// Seed or overwrite one group's balance.
    pub fn set_balance(&self, group: &str, balance: f64) {
        self.balances.insert(group.to_string(), balance);
    }

    pub fn balance_of(&self, group: &str) -> f64 {
        self.balances
            .get(group)
            .map(|b| *b)
            .unwrap_or(self.default_balance)
    }
}

#[async_trait]
impl GroupBalance for InProcessGroupBalance {
    async fn pre_check(&self, group: &Group) -> Result<(f64, Arc<dyn PostGroupConsumer>)> {
        let remaining = *self
            .balances
            .entry(group.id.clone())
            .or_insert(self.default_balance);

        if remaining <= 0.0 {
            return Err(GatewayError::QuotaExhausted(format!(
                "group {} balance is {remaining}",
                group.id
            )));
        }

        let consumer = Arc::new(InProcessConsumer {
            balances: self.balances.clone(),
            group: group.id.clone(),
            consumed: AtomicBool::new(false),
        });

        Ok((remaining, consumer))
    }
}

#[derive(Debug)]
struct InProcessConsumer {
    balances: Arc<DashMap<String, f64>>,
    group: String,
    consumed: AtomicBool,
}

#[async_trait]
impl PostGroupConsumer for InProcessConsumer {
    async fn post_consume(&self, token_name: &str, amount: f64) -> Result<f64> {
        // a retried terminal path must not debit twice
        if self.consumed.swap(true, Ordering::SeqCst) {
            warn!(
                group = %self.group,
                token_name,
                "duplicate post_consume ignored"
            );
            return Ok(self.balances.get(&self.group).map(|b| *b).unwrap_or(0.0));
        }

        let mut entry = self.balances.entry(self.group.clone()).or_insert(0.0);
        *entry -= amount;
        Ok(*entry)
    }
}

/// Amount owed for one completed request, from the observed usage and the
/// model's price structure.
pub fn amount_for(mode: Mode, usage: Usage, mc: &ModelConfig, meta: &RelayMeta) -> f64 {
    match mode {
        Mode::ChatCompletions | Mode::Completions => {
            usage.input_tokens as f64 * mc.price.input_per_token
                + usage.output_tokens as f64 * mc.price.output_per_token
        }
        Mode::Embeddings | Mode::Rerank => usage.input_tokens as f64 * mc.price.input_per_token,
        Mode::ImagesGenerations => {
            let size = meta.get_str("image_size").unwrap_or("1024x1024");
            let quality = meta.get_str("image_quality");
            let n = meta.get_u64("image_n").unwrap_or(1);
            mc.image_price(size, quality).unwrap_or(0.0) * n as f64
        }
        // character-based input tokens
        Mode::AudioSpeech => usage.input_tokens as f64 * mc.price.input_per_token,
        Mode::AudioTranscription | Mode::AudioTranslation => {
            usage.input_tokens as f64 * mc.price.input_per_token
                + usage.output_tokens as f64 * mc.price.output_per_token
        }
        Mode::Unknown | Mode::VideoGenerationsGetJobs | Mode::VideoGenerationsContent => 0.0,
    }
}
