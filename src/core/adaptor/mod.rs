//! Provider adaptor abstraction
//!
//! Each upstream provider implements [`Adaptor`]: URL/method derivation,
//! header setup, request shape conversion, dispatch (including non-HTTP
//! transports), response parsing, usage extraction, and error
//! classification. Side capabilities ([`KeyValidator`], [`Balancer`]) are
//! advertised through the registry entry.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::core::mode::Mode;
use crate::core::model::Channel;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::Usage;
use crate::utils::error::Result;

pub mod ali;
pub mod baiduv2;
pub mod doubao_audio;
pub mod minimax;
pub mod moonshot;
pub mod openai;
mod registry;
pub mod siliconflow;

pub use registry::{AdaptorRegistry, RegisteredAdaptor, default_registry};

/// Concrete upstream endpoint for one attempt.
#[derive(Debug, Clone)]
pub struct RequestUrl {
    pub method: reqwest::Method,
    pub url: String,
}

impl RequestUrl {
    pub fn post(url: String) -> Self {
        Self {
            method: reqwest::Method::POST,
            url,
        }
    }
}

/// Static adaptor metadata for the admin layer.
#[derive(Debug, Clone)]
pub struct AdaptorMetadata {
    pub features: Vec<&'static str>,
    pub models: Vec<&'static str>,
}

/// One part of a multipart form, kept as bytes so the payload can be
/// replayed across retry attempts.
#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    /// Present for file parts
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Inbound request payload after the HTTP layer has read it. Cloneable:
/// each retry attempt converts the same payload again.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    Json(serde_json::Value),
    Form(Vec<FormPart>),
}

impl RelayPayload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            RelayPayload::Json(v) => Some(v),
            RelayPayload::Form(_) => None,
        }
    }
}

/// Converted request ready for dispatch.
#[derive(Debug, Default)]
pub struct ConvertedRequest {
    pub headers: HeaderMap,
    pub body: ConvertedBody,
}

#[derive(Debug, Default)]
pub enum ConvertedBody {
    #[default]
    Empty,
    Bytes(Bytes),
}

/// What dispatch produced. WebSocket adaptors return [`Handshake`] after
/// stashing the live socket in the meta; the body is consumed by
/// `do_response`.
pub enum UpstreamResponse {
    Http(reqwest::Response),
    Handshake,
}

/// Terminal record of one logical request, written by the orchestrator.
#[derive(Debug, Clone)]
pub struct UsageLog {
    pub request_id: String,
    pub group: String,
    pub token_name: String,
    pub model: String,
    pub mode: Mode,
    pub channel_id: i32,
    pub code: u16,
    pub usage: Usage,
    pub amount: f64,
    pub retry_times: u32,
}

/// Persistent-store surface exposed to the relay path: the request log,
/// channel counters, and the channel binding for video job follow-ups.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Channel that created the given video job, from the request log.
    async fn get_job_channel(&self, job_id: &str) -> Option<i32>;

    /// Append the request log entry. Best-effort.
    async fn write_log(&self, log: UsageLog);

    /// Bump a channel's used amount and request/retry counters.
    async fn add_channel_usage(&self, channel_id: i32, amount: f64, requests: i64, retries: i64);
}

/// Store that remembers nothing; used by tests and channel probes.
pub struct NoopRelayStore;

#[async_trait]
impl RelayStore for NoopRelayStore {
    async fn get_job_channel(&self, _job_id: &str) -> Option<i32> {
        None
    }

    async fn write_log(&self, _log: UsageLog) {}

    async fn add_channel_usage(
        &self,
        _channel_id: i32,
        _amount: f64,
        _requests: i64,
        _retries: i64,
    ) {
    }
}

/// The per-provider translation contract.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_base_url(&self) -> &'static str;

    /// Whether this adaptor can serve the requested mode.
    fn supports(&self, mode: Mode) -> bool;

    fn metadata(&self) -> AdaptorMetadata;

    /// Derive the concrete upstream endpoint from the channel's base URL
    /// and the mode. Fails with `BadRequest` on an unsupported mode.
    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl>;

    /// Attach authentication headers. May parse a compound credential or
    /// fetch-and-cache a bearer token.
    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()>;

    /// Translate the inbound OpenAI-shaped payload into the upstream's
    /// shape. May rewrite model names, inject mandatory fields, or
    /// repackage to a different transport.
    async fn convert_request(
        &self,
        meta: &mut RelayMeta,
        store: &dyn RelayStore,
        payload: &RelayPayload,
    ) -> Result<ConvertedRequest>;

    /// Dispatch the converted request. The default transport is HTTP.
    async fn do_request(
        &self,
        meta: &mut RelayMeta,
        client: &reqwest::Client,
        url: RequestUrl,
        converted: ConvertedRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        openai::http_dispatch(meta, client, url, converted, timeout).await
    }

    /// Parse and stream the upstream reply to the client in the OpenAI
    /// wire shape, extracting usage and classifying errors.
    async fn do_response(
        &self,
        meta: &mut RelayMeta,
        store: &dyn RelayStore,
        resp: UpstreamResponse,
        sink: &mut ResponseSink,
    ) -> Result<Usage>;
}

/// Validates the channel key format at channel-write time.
pub trait KeyValidator: Send + Sync {
    fn validate_key(&self, key: &str) -> Result<(), String>;
}

/// Fetches the upstream account balance for a channel.
#[async_trait]
pub trait Balancer: Send + Sync {
    async fn get_balance(&self, channel: &Channel, client: &reqwest::Client) -> Result<f64>;
}

/// Split a `left|right` compound key.
pub(crate) fn split_compound_key(key: &str) -> Result<(&str, &str), String> {
    let mut parts = key.splitn(2, '|');
    match (parts.next(), parts.next()) {
        (Some(left), Some(right)) if !left.is_empty() && !right.is_empty() => Ok((left, right)),
        _ => Err("invalid key format, expected `left|right`".to_string()),
    }
}
