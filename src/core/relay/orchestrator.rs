//! The retry orchestrator
//!
//! Drives one logical request: selection, dispatch, classification,
//! failover, and the terminal bookkeeping (monitor, rate limiter,
//! billing, request log). Selection happens against one cache snapshot
//! held for the whole request, so the candidate set cannot shift
//! mid-retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::core::adaptor::{AdaptorRegistry, RelayPayload, RelayStore, UsageLog};
use crate::core::billing::{GroupBalance, PostGroupConsumer, amount_for};
use crate::core::cache::{CacheHandle, ModelCaches};
use crate::core::limiter::RateLimiter;
use crate::core::mode::Mode;
use crate::core::model::{Channel, Group, GroupStatus, ModelConfig};
use crate::core::monitor::HealthMonitor;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::selector::{self, SelectError};
use crate::core::types::Usage;
use crate::utils::error::{GatewayError, Result};

/// Everything the orchestrator needs, injected once at startup.
#[derive(Clone)]
pub struct RelayContext {
    pub caches: CacheHandle,
    pub registry: Arc<AdaptorRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub billing: Arc<dyn GroupBalance>,
    pub store: Arc<dyn RelayStore>,
    pub client: reqwest::Client,
    pub config: RelayConfig,
}

/// One logical request as the HTTP layer hands it over.
pub struct RelayInputs {
    pub request_id: String,
    pub group: Arc<Group>,
    pub token_name: String,
    pub mode: Mode,
    pub model: String,
    pub payload: RelayPayload,
    /// Value of the channel-forcing header, if present
    pub designated_channel: Option<i32>,
    /// Job id for video job follow-ups
    pub job_id: Option<String>,
}

impl RelayInputs {
    pub fn new(group: Arc<Group>, token_name: &str, mode: Mode, model: &str, payload: RelayPayload) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            group,
            token_name: token_name.to_string(),
            mode,
            model: model.to_string(),
            payload,
            designated_channel: None,
            job_id: None,
        }
    }
}

/// Terminal summary, also written to the request log.
#[derive(Debug, Clone)]
pub struct RelayResult {
    pub channel_id: i32,
    pub usage: Usage,
    pub amount: f64,
    pub attempts: u32,
    pub code: u16,
}

/// The per-request working set carried across retries.
struct RetryState {
    candidates: Vec<Arc<Channel>>,
    ignore: HashSet<i32>,
    error_rates: std::collections::HashMap<i32, f64>,
    /// Last channel that at least had permission to attempt; the final
    /// fallback once the pool truly empties
    last_has_permission: Option<Arc<Channel>>,
    exhausted: bool,
}

/// Serve one logical request, writing the response (or an error
/// envelope) through `sink`. Returns the terminal summary.
pub async fn serve(
    ctx: &RelayContext,
    inputs: RelayInputs,
    sink: &mut ResponseSink,
) -> Result<RelayResult> {
    let snapshot = ctx.caches.load();

    match serve_inner(ctx, &inputs, &snapshot, sink).await {
        Ok(result) => Ok(result),
        Err(e) => {
            if !sink.committed() {
                sink.set_head(e.http_status(), "application/json");
                let _ = sink.write_json(&e.to_openai_json()).await;
            }
            Err(e)
        }
    }
}

async fn serve_inner(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    snapshot: &ModelCaches,
    sink: &mut ResponseSink,
) -> Result<RelayResult> {
    let group = &inputs.group;
    if group.status == GroupStatus::Disabled {
        return Err(GatewayError::Forbidden(format!(
            "group {} is disabled",
            group.id
        )));
    }

    let mc = snapshot
        .model_config(&inputs.model)
        .ok_or_else(|| GatewayError::ChannelsNotFound(inputs.model.clone()))?;

    enforce_rpm(ctx, group, &inputs.model, &mc)?;

    let (_remaining, consumer) = ctx.billing.pre_check(group).await?;

    let deadline = Instant::now() + Duration::from_secs(ctx.config.total_timeout_secs);
    let outcome = run_attempts(ctx, inputs, snapshot, &mc, deadline, sink).await;

    finalize(ctx, inputs, &mc, consumer, outcome, sink).await
}

/// Per-(group, model) RPM cap: group override or ratio-scaled model cap.
fn enforce_rpm(
    ctx: &RelayContext,
    group: &Group,
    model: &str,
    mc: &ModelConfig,
) -> Result<()> {
    let cap = group.adjusted_rpm(model, mc.rpm);
    if cap > 0 {
        let current = ctx.limiter.group_model_rpm(&group.id, model);
        if current >= cap as u64 {
            return Err(GatewayError::RateLimited(format!(
                "{model} is limited to {cap} requests per minute"
            )));
        }
    }
    Ok(())
}

struct AttemptOutcome {
    channel: Arc<Channel>,
    attempts: u32,
    /// Meta of the terminal attempt; carries adaptor state such as the
    /// image size/quality used for price-table billing
    meta: RelayMeta,
    result: Result<Usage>,
}

async fn run_attempts(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    snapshot: &ModelCaches,
    mc: &ModelConfig,
    deadline: Instant,
    sink: &mut ResponseSink,
) -> Result<AttemptOutcome> {
    let sets = inputs.group.effective_sets();

    // a designated channel bypasses selection and is attempted once
    if let Some(channel) = designated_channel(ctx, inputs, snapshot, &sets).await? {
        debug!(channel = channel.id, "designated channel");
        let (meta, result) = attempt(ctx, inputs, &channel, deadline, sink).await;
        record_outcome(ctx, &channel, &inputs.model, &result);
        return Ok(AttemptOutcome {
            channel,
            attempts: 1,
            meta,
            result,
        });
    }

    let banned = ctx.monitor.banned_channels(&inputs.model);
    let error_rates = ctx.monitor.error_rates(&inputs.model);
    debug!(model = %inputs.model, ?banned, "banned channels");

    let mut state = RetryState {
        candidates: snapshot.enabled_channels(&sets, &inputs.model),
        ignore: banned.into_iter().collect(),
        error_rates,
        last_has_permission: None,
        exhausted: false,
    };

    let mut channel = select_with_fallback(ctx, inputs.mode, &inputs.model, &state)?;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let (meta, result) = attempt(ctx, inputs, &channel, deadline, sink).await;
        record_outcome(ctx, &channel, &inputs.model, &result);

        let err = match result {
            Ok(usage) => {
                return Ok(AttemptOutcome {
                    channel,
                    attempts,
                    meta,
                    result: Ok(usage),
                });
            }
            Err(e) => e,
        };

        // once bytes have reached the client the request is committed to
        // this channel; transport errors are surfaced, not retried
        let out_of_budget =
            attempts >= ctx.config.retry_times || Instant::now() >= deadline;
        if !err.is_retryable() || sink.committed() || out_of_budget || state.exhausted {
            // a failed final fallback attempt surfaces as exhaustion
            let err = if state.exhausted && err.is_retryable() && !sink.committed() {
                GatewayError::ChannelsExhausted(inputs.model.clone())
            } else {
                err
            };
            return Ok(AttemptOutcome {
                channel,
                attempts,
                meta,
                result: Err(err),
            });
        }

        warn!(
            channel = channel.id,
            model = %inputs.model,
            attempts,
            "retrying after upstream failure: {err}"
        );
        state.ignore.insert(channel.id);
        state.last_has_permission = Some(channel.clone());

        channel = match next_channel(inputs.mode, &inputs.model, &mut state, ctx) {
            Ok(channel) => channel,
            Err(e) => {
                return Ok(AttemptOutcome {
                    channel,
                    attempts,
                    meta,
                    result: Err(e),
                });
            }
        };
    }
}

/// Resolve a forced channel: the channel header (internal groups only)
/// or the stored binding for video job follow-ups.
async fn designated_channel(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    snapshot: &ModelCaches,
    sets: &[String],
) -> Result<Option<Arc<Channel>>> {
    let id = match inputs.designated_channel {
        Some(id) => {
            if inputs.group.status != GroupStatus::Internal {
                return Err(GatewayError::BadRequest(
                    "channel header is not allowed in non-internal group".into(),
                ));
            }
            id
        }
        None if inputs.mode.requires_channel_binding() => {
            let job_id = inputs
                .job_id
                .as_deref()
                .ok_or_else(|| GatewayError::BadRequest("job id is required".into()))?;
            ctx.store
                .get_job_channel(job_id)
                .await
                .ok_or_else(|| GatewayError::BadRequest("channel id is required".into()))?
        }
        None => return Ok(None),
    };

    let channel = snapshot
        .find_channel(sets, &inputs.model, id)
        .ok_or_else(|| {
            GatewayError::ChannelsNotFound(format!(
                "channel {id} not found for model `{}`",
                inputs.model
            ))
        })?;

    if !ctx.registry.channel_supports(&channel, inputs.mode) {
        return Err(GatewayError::BadRequest(format!(
            "channel {id} does not support {}",
            inputs.mode
        )));
    }

    Ok(Some(channel))
}

/// Initial selection. When every candidate is banned, fall back to a
/// draw over the unfiltered pool so a fully-banned model still gets one
/// attempt against its least-bad channel.
fn select_with_fallback(
    ctx: &RelayContext,
    mode: Mode,
    model: &str,
    state: &RetryState,
) -> Result<Arc<Channel>> {
    let supports = |c: &Channel, m: Mode| ctx.registry.channel_supports(c, m);

    match selector::choose(&state.candidates, mode, &state.error_rates, &state.ignore, supports) {
        Ok(channel) => Ok(channel),
        Err(SelectError::ChannelsExhausted) => selector::choose(
            &state.candidates,
            mode,
            &state.error_rates,
            &HashSet::new(),
            supports,
        )
        .map_err(|e| select_error(e, model)),
        Err(e) => Err(select_error(e, model)),
    }
}

/// Re-selection between attempts. Once the pool empties, one final
/// attempt goes to the remembered last-has-permission channel.
fn next_channel(
    mode: Mode,
    model: &str,
    state: &mut RetryState,
    ctx: &RelayContext,
) -> Result<Arc<Channel>> {
    let supports = |c: &Channel, m: Mode| ctx.registry.channel_supports(c, m);

    match selector::choose(&state.candidates, mode, &state.error_rates, &state.ignore, supports) {
        Ok(channel) => Ok(channel),
        Err(SelectError::ChannelsExhausted) => match state.last_has_permission.take() {
            Some(channel) => {
                state.exhausted = true;
                Ok(channel)
            }
            None => Err(GatewayError::ChannelsExhausted(model.to_string())),
        },
        Err(e) => Err(select_error(e, model)),
    }
}

fn select_error(e: SelectError, model: &str) -> GatewayError {
    match e {
        SelectError::ChannelsNotFound => GatewayError::ChannelsNotFound(model.to_string()),
        SelectError::ChannelsExhausted => GatewayError::ChannelsExhausted(model.to_string()),
    }
}

/// One attempt against one channel: convert, sign, dispatch, respond.
/// The meta is returned even on failure so the terminal path can read
/// attempt-scoped state out of it.
async fn attempt(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    channel: &Arc<Channel>,
    deadline: Instant,
    sink: &mut ResponseSink,
) -> (RelayMeta, Result<Usage>) {
    let mut meta = RelayMeta::new(
        inputs.request_id.clone(),
        inputs.mode,
        inputs.group.id.clone(),
        inputs.token_name.clone(),
        inputs.model.clone(),
        channel.clone(),
    );
    let result = attempt_inner(ctx, inputs, &mut meta, deadline, sink).await;
    (meta, result)
}

async fn attempt_inner(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    meta: &mut RelayMeta,
    deadline: Instant,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let channel = meta.channel.clone();
    let adaptor = ctx
        .registry
        .adaptor(channel.channel_type)
        .ok_or_else(|| {
            GatewayError::Internal(format!("adaptor not found for channel {}", channel.id))
        })?;

    ctx.limiter.record_request(
        channel.id,
        &inputs.model,
        &inputs.group.id,
        &inputs.token_name,
    );

    let timeout = attempt_timeout(&ctx.config, inputs.mode, deadline)?;

    let mut converted = adaptor
        .convert_request(meta, ctx.store.as_ref(), &inputs.payload)
        .await?;
    adaptor
        .setup_headers(meta, &ctx.client, &mut converted.headers)
        .await?;
    let url = adaptor.request_url(meta)?;

    debug!(
        channel = channel.id,
        url = %url.url,
        model = %meta.actual_model,
        "dispatching attempt"
    );

    let resp = adaptor
        .do_request(meta, &ctx.client, url, converted, timeout)
        .await?;

    adaptor
        .do_response(meta, ctx.store.as_ref(), resp, sink)
        .await
}

fn attempt_timeout(config: &RelayConfig, mode: Mode, deadline: Instant) -> Result<Duration> {
    let per_mode = if mode.is_streaming_capable() {
        Duration::from_secs(config.stream_attempt_timeout_secs)
    } else {
        Duration::from_secs(config.attempt_timeout_secs)
    };
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| GatewayError::UpstreamTransient {
            status: 504,
            message: "request deadline exceeded".into(),
        })?;
    Ok(per_mode.min(remaining))
}

fn record_outcome(ctx: &RelayContext, channel: &Channel, model: &str, result: &Result<Usage>) {
    match result {
        Ok(_) => ctx.monitor.record_success(channel.id, model),
        // client disconnects say nothing about channel health
        Err(GatewayError::ClientClosed) => {}
        Err(_) => ctx.monitor.record_error(channel.id, model),
    }
}

/// Terminal state: token accounting, the debit, channel counters, and
/// the request log. Debit is attempted exactly once even on failures
/// where a partial response went out.
async fn finalize(
    ctx: &RelayContext,
    inputs: &RelayInputs,
    mc: &ModelConfig,
    consumer: Arc<dyn PostGroupConsumer>,
    outcome: Result<AttemptOutcome>,
    sink: &mut ResponseSink,
) -> Result<RelayResult> {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        // terminal without an attempt (selection failure): the debit
        // handle is still settled exactly once, at zero
        Err(e) => {
            let _ = consumer.post_consume(&inputs.token_name, 0.0).await;
            return Err(e);
        }
    };
    let (usage, code, relay_error) = match outcome.result {
        Ok(usage) => (usage, 200u16, None),
        // a committed stream that died mid-flight still bills what went out
        Err(e) => (
            outcome.meta.partial_usage().unwrap_or_default(),
            e.http_status(),
            Some(e),
        ),
    };

    let amount = if relay_error.is_none() || usage.total_tokens > 0 {
        amount_for(inputs.mode, usage, mc, &outcome.meta)
    } else {
        0.0
    };

    if usage.total_tokens > 0 {
        ctx.limiter.record_tokens(
            outcome.channel.id,
            &inputs.model,
            &inputs.group.id,
            &inputs.token_name,
            usage.total_tokens,
        );
    }

    match consumer.post_consume(&inputs.token_name, amount).await {
        Ok(remaining) => {
            debug!(group = %inputs.group.id, amount, remaining, "consumed")
        }
        Err(e) => error!(group = %inputs.group.id, amount, "post consume failed: {e}"),
    }

    ctx.store
        .add_channel_usage(
            outcome.channel.id,
            amount,
            1,
            i64::from(outcome.attempts.saturating_sub(1)),
        )
        .await;
    ctx.store
        .write_log(UsageLog {
            request_id: inputs.request_id.clone(),
            group: inputs.group.id.clone(),
            token_name: inputs.token_name.clone(),
            model: inputs.model.clone(),
            mode: inputs.mode,
            channel_id: outcome.channel.id,
            code,
            usage,
            amount,
            retry_times: outcome.attempts.saturating_sub(1),
        })
        .await;

    match relay_error {
        None => {
            info!(
                request_id = %inputs.request_id,
                channel = outcome.channel.id,
                model = %inputs.model,
                total_tokens = usage.total_tokens,
                attempts = outcome.attempts,
                "relay done"
            );
            Ok(RelayResult {
                channel_id: outcome.channel.id,
                usage,
                amount,
                attempts: outcome.attempts,
                code,
            })
        }
        Some(e) => {
            if !sink.committed() {
                sink.set_head(e.http_status(), "application/json");
                let _ = sink.write_json(&e.to_openai_json()).await;
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_timeout_is_capped_by_deadline() {
        let config = RelayConfig {
            retry_times: 3,
            attempt_timeout_secs: 120,
            stream_attempt_timeout_secs: 600,
            total_timeout_secs: 600,
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        let timeout = attempt_timeout(&config, Mode::Embeddings, deadline).unwrap();
        assert!(timeout <= Duration::from_secs(1));

        let past = Instant::now() - Duration::from_secs(1);
        assert!(attempt_timeout(&config, Mode::Embeddings, past).is_err());
    }
}
