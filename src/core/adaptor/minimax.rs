//! MiniMax adaptor
//!
//! OpenAI-compatible endpoints; the channel key is the compound
//! `apikey|groupid`, with the group id carried as a query parameter.

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, ConvertedRequest, KeyValidator, RelayPayload, RelayStore,
    RequestUrl, UpstreamResponse, openai, split_compound_key,
};
use crate::core::mode::Mode;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::Usage;
use crate::utils::error::{GatewayError, Result};

pub const BASE_URL: &str = "https://api.minimax.chat/v1";

pub struct MinimaxAdaptor;

fn api_key_and_group(key: &str) -> Result<(&str, &str)> {
    split_compound_key(key).map_err(GatewayError::BadRequest)
}

#[async_trait]
impl Adaptor for MinimaxAdaptor {
    fn name(&self) -> &'static str {
        "minimax"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions | Mode::Embeddings)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["OpenAI-compatible chat", "Compound apikey|groupid credential"],
            models: vec!["abab6.5s-chat", "abab6.5g-chat", "embo-01"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        let (_, group_id) = api_key_and_group(&meta.channel.key)?;
        let base = meta.base_url(self.default_base_url());
        let path = match meta.mode {
            Mode::ChatCompletions => "/text/chatcompletion_v2",
            Mode::Embeddings => "/embeddings",
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "unsupported mode: {other}"
                )));
            }
        };
        Ok(RequestUrl::post(format!(
            "{}?GroupId={group_id}",
            openai::join_url(base, path)
        )))
    }

    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        _client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()> {
        let (api_key, _) = api_key_and_group(&meta.channel.key)?;
        openai::bearer_auth(api_key, headers)
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
                "minimax adaptor got a non-HTTP response".into(),
            ));
        };
        openai::openai_do_response(meta, resp, sink).await
    }
}

impl KeyValidator for MinimaxAdaptor {
    fn validate_key(&self, key: &str) -> Result<(), String> {
        split_compound_key(key).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_lands_in_the_query() {
        let mut meta = RelayMeta::for_tests(Mode::ChatCompletions);
        meta.channel = std::sync::Arc::new(crate::core::model::Channel {
            key: "sk-abc|grp-1".into(),
            ..(*meta.channel).clone()
        });
        let url = MinimaxAdaptor.request_url(&meta).unwrap();
        assert!(url.url.ends_with("/text/chatcompletion_v2?GroupId=grp-1"));
    }

    #[test]
    fn malformed_key_is_rejected_at_write_time() {
        assert!(MinimaxAdaptor.validate_key("apikey|groupid").is_ok());
        assert!(MinimaxAdaptor.validate_key("apikey").is_err());
    }
}
