//! SiliconFlow adaptor
//!
//! OpenAI-compatible endpoints including rerank; the account balance is a
//! decimal string under `/user/info`.

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

pub const BASE_URL: &str = "https://api.siliconflow.cn/v1";

pub struct SiliconFlowAdaptor;

#[async_trait]
impl Adaptor for SiliconFlowAdaptor {
    fn name(&self) -> &'static str {
        "siliconflow"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports(&self, mode: Mode) -> bool {
        matches!(
            mode,
            Mode::ChatCompletions
                | Mode::Completions
                | Mode::Embeddings
                | Mode::Rerank
                | Mode::ImagesGenerations
        )
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["OpenAI compatibility", "Rerank", "Balance query"],
            models: vec![
                "deepseek-ai/DeepSeek-V3",
                "Qwen/Qwen2.5-72B-Instruct",
                "BAAI/bge-reranker-v2-m3",
            ],
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
                "siliconflow adaptor got a non-HTTP response".into(),
            ));
        };
        openai::openai_do_response(meta, resp, sink).await
    }
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    data: UserInfoData,
}

#[derive(Debug, Deserialize)]
struct UserInfoData {
    balance: String,
}

#[async_trait]
impl Balancer for SiliconFlowAdaptor {
    async fn get_balance(&self, channel: &Channel, client: &reqwest::Client) -> Result<f64> {
        let base = if channel.base_url.is_empty() {
            BASE_URL
        } else {
            &channel.base_url
        };

        let resp = client
            .get(openai::join_url(base, "/user/info"))
            .bearer_auth(&channel.key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(GatewayError::UpstreamTransient {
                status: resp.status().as_u16(),
                message: format!("status code: {}", resp.status()),
            });
        }

        let response: UserInfoResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("user info response: {e}")))?;

        response
            .data
            .balance
            .parse::<f64>()
            .map_err(|e| GatewayError::Internal(format!("balance parse: {e}")))
    }
}
