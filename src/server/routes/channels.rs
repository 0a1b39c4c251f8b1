//! Channel admin CRUD, probes, and balance refresh
//!
//! Writes validate the key format through the adaptor's `KeyValidator`,
//! rebuild the cache snapshot, and clear the health monitor for the
//! touched channel.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, Result as ActixResult, web};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::adaptor::{NoopRelayStore, RelayPayload};
use crate::core::mode::Mode;
use crate::core::model::{Channel, ChannelStatus};
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::Usage;
use crate::server::{AppState, response};
use crate::storage::store::ChannelTestRecord;
use crate::utils::error::{GatewayError, Result};

pub async fn list(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    match state.store.list_channels().await {
        Ok(channels) => Ok(response::success(channels)),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

/// Adaptor catalog: one entry per registered channel type with its
/// feature list and static models.
pub async fn types(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    let mut types: Vec<serde_json::Value> = state
        .relay
        .registry
        .iter()
        .map(|(channel_type, entry)| {
            let metadata = entry.adaptor.metadata();
            serde_json::json!({
                "type": i32::from(*channel_type),
                "name": entry.adaptor.name(),
                "default_base_url": entry.adaptor.default_base_url(),
                "features": metadata.features,
                "models": metadata.models,
                "key_validated": entry.key_validator.is_some(),
                "balance_query": entry.balancer.is_some(),
            })
        })
        .collect();
    types.sort_by_key(|t| t["type"].as_i64());
    Ok(response::success(types))
}

pub async fn create(
    state: web::Data<AppState>,
    body: web::Json<Channel>,
) -> ActixResult<HttpResponse> {
    match state.store.create_channel(body.into_inner()).await {
        Ok(channel) => Ok(response::success(channel)),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

pub async fn update(
    state: web::Data<AppState>,
    id: web::Path<i32>,
    body: web::Json<Channel>,
) -> ActixResult<HttpResponse> {
    let mut channel = body.into_inner();
    channel.id = id.into_inner();
    match state.store.update_channel(channel).await {
        Ok(()) => Ok(response::success(())),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

pub async fn remove(state: web::Data<AppState>, id: web::Path<i32>) -> ActixResult<HttpResponse> {
    match state.store.delete_channel(id.into_inner()).await {
        Ok(()) => Ok(response::success(())),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: i32,
}

pub async fn set_status(
    state: web::Data<AppState>,
    id: web::Path<i32>,
    body: web::Json<StatusBody>,
) -> ActixResult<HttpResponse> {
    let status = match ChannelStatus::try_from(body.status) {
        Ok(status) => status,
        Err(e) => return Ok(response::api_error(StatusCode::BAD_REQUEST, &e)),
    };
    match state.store.update_channel_status(id.into_inner(), status).await {
        Ok(()) => Ok(response::success(())),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

/// Fetch the upstream balance through the adaptor's `Balancer` and store
/// it on the channel row.
pub async fn balance(state: web::Data<AppState>, id: web::Path<i32>) -> ActixResult<HttpResponse> {
    let id = id.into_inner();
    let result: Result<f64> = async {
        let channel = state.store.get_channel(id).await?;
        let balancer = state
            .relay
            .registry
            .get(channel.channel_type)
            .and_then(|entry| entry.balancer.clone())
            .ok_or_else(|| {
                GatewayError::BadRequest(format!(
                    "channel type {} does not support balance query",
                    channel.channel_type.as_str()
                ))
            })?;
        let balance = balancer.get_balance(&channel, &state.relay.client).await?;
        state.store.update_channel_balance(id, balance).await?;
        Ok(balance)
    }
    .await;

    match result {
        Ok(balance) => Ok(response::success(serde_json::json!({ "balance": balance }))),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

/// Run one minimal request through the channel and record the result.
pub async fn test(
    state: web::Data<AppState>,
    path: web::Path<(i32, String)>,
) -> ActixResult<HttpResponse> {
    let (id, model) = path.into_inner();

    let outcome: Result<ChannelTestRecord> = async {
        let channel = state.store.get_channel(id).await?;
        let mode = state
            .relay
            .caches
            .load()
            .model_config(&model)
            .map(|mc| mc.mode)
            .ok_or_else(|| GatewayError::BadRequest(format!("model {model} is not declared")))?;

        let payload = probe_payload(mode, &model)?;
        let started = Instant::now();
        let (actual_model, result) = probe(&state, Arc::new(channel.clone()), mode, &model, payload).await;
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;

        let record = ChannelTestRecord {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            channel_name: channel.name.clone(),
            model: model.clone(),
            actual_model,
            mode,
            test_at: Utc::now(),
            took_ms,
            success: result.is_ok(),
            response: match &result {
                Ok(_) => String::new(),
                Err(e) => e.to_string(),
            },
            code: match &result {
                Ok(_) => 200,
                Err(e) => i32::from(e.http_status()),
            },
        };
        state.store.record_channel_test(record.clone()).await?;
        Ok(record)
    }
    .await;

    match outcome {
        Ok(record) => Ok(response::success(serde_json::json!({
            "channel_id": record.channel_id,
            "channel_type": i32::from(record.channel_type),
            "channel_name": record.channel_name,
            "model": record.model,
            "actual_model": record.actual_model,
            "mode": record.mode,
            "test_at": record.test_at.timestamp(),
            "took_ms": record.took_ms,
            "success": record.success,
            "response": record.response,
            "code": record.code,
        }))),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

fn probe_payload(mode: Mode, model: &str) -> Result<RelayPayload> {
    let body = match mode {
        Mode::ChatCompletions => serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
        }),
        Mode::Completions => serde_json::json!({ "model": model, "prompt": "hi" }),
        Mode::Embeddings => serde_json::json!({ "model": model, "input": "hi" }),
        other => {
            return Err(GatewayError::BadRequest(format!(
                "mode {other} is not testable"
            )));
        }
    };
    Ok(RelayPayload::Json(body))
}

async fn probe(
    state: &AppState,
    channel: Arc<Channel>,
    mode: Mode,
    model: &str,
    payload: RelayPayload,
) -> (String, Result<Usage>) {
    let mut meta = RelayMeta::new(
        uuid::Uuid::new_v4().to_string(),
        mode,
        "channel-test".to_string(),
        String::new(),
        model.to_string(),
        channel.clone(),
    );
    let actual_model = meta.actual_model.clone();

    let result = async {
        let adaptor = state
            .relay
            .registry
            .adaptor(channel.channel_type)
            .filter(|a| a.supports(mode))
            .ok_or_else(|| {
                GatewayError::BadRequest(format!("channel {} cannot serve {mode}", channel.id))
            })?;

        let (mut sink, receiver) = ResponseSink::channel(1024);
        let mut converted = adaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await?;
        adaptor
            .setup_headers(&meta, &state.relay.client, &mut converted.headers)
            .await?;
        let url = adaptor.request_url(&meta)?;
        let resp = adaptor
            .do_request(
                &mut meta,
                &state.relay.client,
                url,
                converted,
                Duration::from_secs(30),
            )
            .await?;
        let usage = adaptor
            .do_response(&mut meta, &NoopRelayStore, resp, &mut sink)
            .await?;
        drop(sink);
        let _ = receiver.collect().await;
        Ok(usage)
    }
    .await;

    (actual_model, result)
}
