//! Moonshot adaptor
//!
//! Fully OpenAI-compatible; additionally exposes the account balance
//! through `/users/me/balance`.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, Balancer, ConvertedRequest, RelayPayload, RelayStore, RequestUrl,
    UpstreamResponse, openai,
};
use crate::core::mode::Mode;
use crate::core::model::Channel;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::Usage;
use crate::utils::error::{GatewayError, Result};

pub const BASE_URL: &str = "https://api.moonshot.cn/v1";

pub struct MoonshotAdaptor;

#[async_trait]
impl Adaptor for MoonshotAdaptor {
    fn name(&self) -> &'static str {
        "moonshot"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions | Mode::Completions)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["OpenAI compatibility", "Balance query"],
            models: vec!["moonshot-v1-8k", "moonshot-v1-32k", "moonshot-v1-128k"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        openai::openai_request_url(meta, self.default_base_url())
    }

    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        _client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()> {
        openai::bearer_auth(&meta.channel.key, headers)
    }

    async fn convert_request(
        &self,
        meta: &mut RelayMeta,
        _store: &dyn RelayStore,
        payload: &RelayPayload,
    ) -> Result<ConvertedRequest> {
        openai::convert_openai_request(meta, payload, None)
    }

    async fn do_response(
        &self,
        meta: &mut RelayMeta,
        _store: &dyn RelayStore,
        resp: UpstreamResponse,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        let UpstreamResponse::Http(resp) = resp else {
            return Err(GatewayError::Internal(
                "moonshot adaptor got a non-HTTP response".into(),
            ));
        };
        openai::openai_do_response(meta, resp, sink).await
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    error: Option<BalanceError>,
    data: Option<BalanceData>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    available_balance: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl Balancer for MoonshotAdaptor {
    async fn get_balance(&self, channel: &Channel, client: &reqwest::Client) -> Result<f64> {
        let base = if channel.base_url.is_empty() {
            BASE_URL
        } else {
            &channel.base_url
        };

        let resp = client
            .get(openai::join_url(base, "/users/me/balance"))
            .bearer_auth(&channel.key)
            .send()
            .await?;

        let response: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("balance response: {e}")))?;

        if let Some(error) = response.error {
            return Err(GatewayError::UpstreamPermanent {
                status: 400,
                message: format!("type: {}, message: {}", error.error_type, error.message),
            });
        }

        response
            .data
            .map(|d| d.available_balance)
            .ok_or_else(|| GatewayError::Internal("balance response missing data".into()))
    }
}
