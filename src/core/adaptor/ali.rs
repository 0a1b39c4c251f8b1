//! Alibaba DashScope adaptor
//!
//! OpenAI-compatible for chat/completions/embeddings through the
//! compatible-mode endpoints, native DashScope shapes for image
//! synthesis and rerank. Two model families need body patches: qwen3
//! must have `enable_thinking=false` on non-streaming calls, and qwq
//! only supports streaming.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, ConvertedBody, ConvertedRequest, RelayPayload, RelayStore,
    RequestUrl, UpstreamResponse, openai,
};
use crate::core::mode::Mode;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::{RerankRequest, RerankResponse, RerankResult, Usage};
use crate::utils::error::{GatewayError, Result};

pub const BASE_URL: &str = "https://dashscope.aliyuncs.com";

pub struct AliAdaptor;

// qwen3 rejects enable_thinking on non-streaming calls
fn patch_qwen3_enable_thinking(meta: &RelayMeta, body: &mut serde_json::Value) -> Result<()> {
    let streaming = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !streaming {
        body["enable_thinking"] = serde_json::Value::Bool(false);
    }
    let _ = meta;
    Ok(())
}

// qwq models only support stream mode
fn patch_qwq_only_stream(_meta: &RelayMeta, body: &mut serde_json::Value) -> Result<()> {
    body["stream"] = serde_json::Value::Bool(true);
    Ok(())
}

fn chat_patch_for(actual_model: &str) -> Option<openai::BodyPatch> {
    if actual_model.starts_with("qwen3-") {
        Some(patch_qwen3_enable_thinking)
    } else if actual_model.starts_with("qwq-") {
        Some(patch_qwq_only_stream)
    } else {
        None
    }
}

#[async_trait]
impl Adaptor for AliAdaptor {
    fn name(&self) -> &'static str {
        "ali"
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
                | Mode::ImagesGenerations
                | Mode::Rerank
        )
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec![
                "OpenAI compatibility through compatible-mode",
                "Native image synthesis",
                "Text rerank",
            ],
            models: vec!["qwen-max", "qwen3-32b", "qwq-32b", "text-embedding-v3", "gte-rerank"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        let base = meta.base_url(self.default_base_url());
        let path = match meta.mode {
            Mode::ChatCompletions => "/compatible-mode/v1/chat/completions",
            Mode::Completions => "/compatible-mode/v1/completions",
            Mode::Embeddings => "/compatible-mode/v1/embeddings",
            Mode::ImagesGenerations => "/api/v1/services/aigc/text2image/image-synthesis",
            Mode::Rerank => "/api/v1/services/rerank/text-rerank/text-rerank",
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "unsupported mode: {other}"
                )));
            }
        };
        Ok(RequestUrl::post(openai::join_url(base, path)))
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
        match meta.mode {
            Mode::Rerank => convert_rerank_request(meta, payload),
            Mode::ChatCompletions | Mode::Completions => {
                let patch = chat_patch_for(&meta.actual_model);
                openai::convert_openai_request(meta, payload, patch)
            }
            _ => openai::convert_openai_request(meta, payload, None),
        }
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
                "ali adaptor got a non-HTTP response".into(),
            ));
        };
        match meta.mode {
            Mode::Rerank => rerank_handler(meta, resp, sink).await,
            _ => openai::openai_do_response(meta, resp, sink).await,
        }
    }
}

/// OpenAI rerank shape -> DashScope text-rerank shape.
fn convert_rerank_request(
    meta: &mut RelayMeta,
    payload: &RelayPayload,
) -> Result<ConvertedRequest> {
    let value = payload
        .as_json()
        .ok_or_else(|| GatewayError::BadRequest("rerank expects a JSON body".into()))?;
    let request: RerankRequest = serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::BadRequest(format!("rerank request: {e}")))?;

    let mut text = request.query.clone();
    for document in &request.documents {
        text.push(' ');
        text.push_str(document);
    }
    meta.request_usage =
        Usage::input_only(crate::utils::tokens::estimate_text_tokens(&text));

    let body = serde_json::json!({
        "model": meta.actual_model,
        "input": {
            "query": request.query,
            "documents": request.documents,
        },
        "parameters": {
            "top_n": request.top_n,
            "return_documents": request.return_documents.unwrap_or(false),
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(ConvertedRequest {
        headers,
        body: ConvertedBody::Bytes(Bytes::from(serde_json::to_vec(&body)?)),
    })
}

/// DashScope rerank reply -> OpenAI-style rerank reply.
async fn rerank_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    if !resp.status().is_success() {
        return Err(openai::classify_error_response(resp).await);
    }

    let body = resp.bytes().await?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Internal(format!("upstream json: {e}")))?;

    let results: Vec<RerankResult> = value
        .pointer("/output/results")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(RerankResult {
                        index: item.get("index")?.as_u64()? as usize,
                        relevance_score: item.get("relevance_score")?.as_f64()?,
                        document: item
                            .pointer("/document/text")
                            .and_then(|t| t.as_str())
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = value
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .map(Usage::input_only)
        .unwrap_or(meta.request_usage);

    let response = RerankResponse {
        results,
        usage: Some(crate::core::types::ApiUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: 0,
            total_tokens: usage.total_tokens,
        }),
    };
    sink.write_json(&serde_json::to_value(&response)?).await?;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adaptor::NoopRelayStore;

    #[tokio::test]
    async fn qwen3_non_streaming_disables_thinking() {
        let mut meta = RelayMeta::for_tests(Mode::ChatCompletions);
        meta.actual_model = "qwen3-32b".into();
        let payload = RelayPayload::Json(serde_json::json!({
            "model": "qwen3-32b",
            "messages": [{"role": "user", "content": "hi"}],
        }));

        let converted = AliAdaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await
            .unwrap();
        let ConvertedBody::Bytes(body) = converted.body else {
            panic!("expected body bytes");
        };
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["enable_thinking"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn qwen3_streaming_is_left_alone() {
        let mut meta = RelayMeta::for_tests(Mode::ChatCompletions);
        meta.actual_model = "qwen3-32b".into();
        let payload = RelayPayload::Json(serde_json::json!({
            "model": "qwen3-32b",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }));

        let converted = AliAdaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await
            .unwrap();
        let ConvertedBody::Bytes(body) = converted.body else {
            panic!("expected body bytes");
        };
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body.get("enable_thinking").is_none());
    }

    #[tokio::test]
    async fn qwq_is_forced_to_stream() {
        let mut meta = RelayMeta::for_tests(Mode::ChatCompletions);
        meta.actual_model = "qwq-32b".into();
        let payload = RelayPayload::Json(serde_json::json!({
            "model": "qwq-32b",
            "messages": [{"role": "user", "content": "hi"}],
        }));

        let converted = AliAdaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await
            .unwrap();
        let ConvertedBody::Bytes(body) = converted.body else {
            panic!("expected body bytes");
        };
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["stream"], serde_json::json!(true));
    }

    #[test]
    fn rerank_url_is_native() {
        let mut meta = RelayMeta::for_tests(Mode::Rerank);
        meta.channel = std::sync::Arc::new(crate::core::model::Channel {
            base_url: "https://dashscope.example.com".into(),
            ..(*meta.channel).clone()
        });
        let url = AliAdaptor.request_url(&meta).unwrap();
        assert_eq!(
            url.url,
            "https://dashscope.example.com/api/v1/services/rerank/text-rerank/text-rerank"
        );
    }
}
