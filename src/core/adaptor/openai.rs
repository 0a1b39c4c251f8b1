//! OpenAI-compatible adaptor
//!
//! The reference upstream shape. Other OpenAI-compatible adaptors reuse
//! the helpers here: HTTP dispatch, error classification, SSE and JSON
//! response handling, and the multipart rebuild for speech-to-text.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, ConvertedBody, ConvertedRequest, FormPart, RelayPayload, RelayStore,
    RequestUrl, UpstreamResponse,
};
use crate::core::mode::Mode;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::{ApiUsage, SpeechRequest, Usage};
use crate::utils::error::{GatewayError, Result};
use crate::utils::tokens::{estimate_chat_prompt_tokens, estimate_text_tokens};

pub const BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIAdaptor;

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn name(&self) -> &'static str {
        "openai"
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
                | Mode::AudioSpeech
                | Mode::AudioTranscription
                | Mode::AudioTranslation
        )
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["OpenAI wire format", "SSE streaming", "Audio in and out"],
            models: vec!["gpt-4o", "gpt-4o-mini", "text-embedding-3-small", "dall-e-3"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        openai_request_url(meta, self.default_base_url())
    }

    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        _client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()> {
        bearer_auth(&meta.channel.key, headers)
    }

    async fn convert_request(
        &self,
        meta: &mut RelayMeta,
        _store: &dyn RelayStore,
        payload: &RelayPayload,
    ) -> Result<ConvertedRequest> {
        convert_openai_request(meta, payload, None)
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
                "openai adaptor got a non-HTTP response".into(),
            ));
        };
        openai_do_response(meta, resp, sink).await
    }
}

/// URL derivation shared by the OpenAI-compatible adaptors.
pub(crate) fn openai_request_url(meta: &RelayMeta, default_base: &str) -> Result<RequestUrl> {
    let base = meta.base_url(default_base);
    let path = match meta.mode {
        Mode::ChatCompletions => "/chat/completions",
        Mode::Completions => "/completions",
        Mode::Embeddings => "/embeddings",
        Mode::ImagesGenerations => "/images/generations",
        Mode::AudioSpeech => "/audio/speech",
        Mode::AudioTranscription => "/audio/transcriptions",
        Mode::AudioTranslation => "/audio/translations",
        Mode::Rerank => "/rerank",
        other => {
            return Err(GatewayError::BadRequest(format!(
                "unsupported mode: {other}"
            )));
        }
    };
    Ok(RequestUrl::post(join_url(base, path)))
}

pub(crate) fn bearer_auth(key: &str, headers: &mut HeaderMap) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {key}"))
        .map_err(|_| GatewayError::Internal("channel key is not a valid header value".into()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Patch hook applied to JSON bodies after the model rewrite; used by
/// adaptors that must inject mandatory fields.
pub(crate) type BodyPatch = fn(&RelayMeta, &mut serde_json::Value) -> Result<()>;

/// Convert an inbound OpenAI-shaped payload for an OpenAI-shaped
/// upstream: rewrite the model name, record attempt state in the meta,
/// estimate input usage, and apply the adaptor's patch if any.
pub(crate) fn convert_openai_request(
    meta: &mut RelayMeta,
    payload: &RelayPayload,
    patch: Option<BodyPatch>,
) -> Result<ConvertedRequest> {
    match payload {
        RelayPayload::Json(value) => {
            let mut body = value.clone();
            body["model"] = serde_json::Value::String(meta.actual_model.clone());

            match meta.mode {
                Mode::ChatCompletions | Mode::Completions => {
                    let stream = body
                        .get("stream")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    meta.set("stream", serde_json::json!(stream));
                    meta.request_usage = Usage::input_only(estimate_chat_prompt_tokens(&body));
                }
                Mode::Embeddings => {
                    let input_text = match body.get("input") {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Array(items)) => items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(" "),
                        _ => String::new(),
                    };
                    meta.request_usage = Usage::input_only(estimate_text_tokens(&input_text));
                }
                Mode::ImagesGenerations => {
                    if let Some(size) = body.get("size").and_then(|v| v.as_str()) {
                        meta.set("image_size", serde_json::json!(size));
                    }
                    if let Some(quality) = body.get("quality").and_then(|v| v.as_str()) {
                        meta.set("image_quality", serde_json::json!(quality));
                    }
                    let n = body.get("n").and_then(|v| v.as_u64()).unwrap_or(1);
                    meta.set("image_n", serde_json::json!(n));
                }
                Mode::AudioSpeech => {
                    let request: SpeechRequest = serde_json::from_value(value.clone())
                        .map_err(|e| GatewayError::BadRequest(format!("speech request: {e}")))?;
                    meta.set("stream_format", serde_json::json!(request.stream_format));
                    // character-based input tokens
                    meta.request_usage =
                        Usage::input_only(request.input.chars().count() as u64);
                }
                Mode::Rerank => {
                    let request: crate::core::types::RerankRequest =
                        serde_json::from_value(value.clone())
                            .map_err(|e| GatewayError::BadRequest(format!("rerank request: {e}")))?;
                    let mut text = request.query;
                    for document in &request.documents {
                        text.push(' ');
                        text.push_str(document);
                    }
                    meta.request_usage = Usage::input_only(estimate_text_tokens(&text));
                }
                _ => {}
            }

            if let Some(patch) = patch {
                patch(meta, &mut body)?;
            }

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(ConvertedRequest {
                headers,
                body: ConvertedBody::Bytes(Bytes::from(serde_json::to_vec(&body)?)),
            })
        }
        RelayPayload::Form(parts) => convert_multipart_request(meta, parts),
    }
}

/// Rebuild an inbound multipart form (speech-to-text) with the model
/// field rewritten. `response_format` is captured into the meta and not
/// forwarded; the upstream defaults to JSON which `do_response` reshapes.
pub(crate) fn convert_multipart_request(
    meta: &mut RelayMeta,
    parts: &[FormPart],
) -> Result<ConvertedRequest> {
    let boundary = format!("modelgate-{}", uuid::Uuid::new_v4().simple());
    let mut body = BytesMut::new();

    for part in parts {
        if part.name == "response_format" && part.filename.is_none() {
            let format = String::from_utf8_lossy(&part.data).to_string();
            meta.set("response_format", serde_json::json!(format));
            continue;
        }

        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match &part.filename {
            Some(filename) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                );
                if let Some(content_type) = &part.content_type {
                    body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
                }
            }
            None => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name)
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
        if part.name == "model" && part.filename.is_none() {
            body.extend_from_slice(meta.actual_model.as_bytes());
        } else {
            body.extend_from_slice(&part.data);
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
            .map_err(|_| GatewayError::Internal("invalid multipart boundary".into()))?,
    );
    Ok(ConvertedRequest {
        headers,
        body: ConvertedBody::Bytes(body.freeze()),
    })
}

/// Default HTTP dispatch used by every adaptor that does not own a
/// different transport.
pub(crate) async fn http_dispatch(
    _meta: &mut RelayMeta,
    client: &reqwest::Client,
    url: RequestUrl,
    converted: ConvertedRequest,
    timeout: Duration,
) -> Result<UpstreamResponse> {
    let mut request = client
        .request(url.method, &url.url)
        .headers(converted.headers)
        .timeout(timeout);
    if let ConvertedBody::Bytes(body) = converted.body {
        request = request.body(body);
    }
    let resp = request.send().await?;
    Ok(UpstreamResponse::Http(resp))
}

/// Map a non-2xx upstream reply into the error taxonomy. 429 and 5xx are
/// transient (another channel may do better); other 4xx are attributable
/// to the request shape and not retried.
pub(crate) async fn classify_error_response(resp: reqwest::Response) -> GatewayError {
    let status = resp.status().as_u16();
    let message = match resp.bytes().await {
        Ok(body) => serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned()),
        Err(e) => e.to_string(),
    };

    if status == 429 || status >= 500 {
        GatewayError::UpstreamTransient { status, message }
    } else {
        GatewayError::UpstreamPermanent { status, message }
    }
}

/// Dispatch to the mode-specific response handler.
pub(crate) async fn openai_do_response(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    if !resp.status().is_success() {
        return Err(classify_error_response(resp).await);
    }

    match meta.mode {
        Mode::ChatCompletions | Mode::Completions => {
            if meta.get_bool("stream") {
                sse_chat_handler(meta, resp, sink).await
            } else {
                json_chat_handler(meta, resp, sink).await
            }
        }
        Mode::Embeddings | Mode::Rerank => json_usage_handler(meta, resp, sink).await,
        Mode::ImagesGenerations => json_passthrough_handler(meta, resp, sink).await,
        Mode::AudioSpeech => audio_handler(meta, resp, sink).await,
        Mode::AudioTranscription | Mode::AudioTranslation => stt_handler(meta, resp, sink).await,
        other => Err(GatewayError::BadRequest(format!(
            "unsupported mode: {other}"
        ))),
    }
}

/// Streaming chat: forward SSE frames, rewriting the model name back to
/// what the client asked for and harvesting usage along the way.
pub(crate) async fn sse_chat_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let mut stream = resp.bytes_stream();
    let mut buffer = BytesMut::new();
    let mut usage: Option<ApiUsage> = None;
    let mut streamed_text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // already committed: this will be surfaced, not retried,
                // and the delivered tokens still get billed
                meta.record_partial_usage(Usage::new(
                    meta.request_usage.input_tokens,
                    estimate_text_tokens(&streamed_text),
                ));
                return Err(GatewayError::UpstreamTransient {
                    status: 502,
                    message: format!("stream read: {e}"),
                });
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = find_frame_end(&buffer) {
            let frame = buffer.split_to(pos + 2);
            let frame = std::str::from_utf8(&frame)
                .map_err(|_| GatewayError::Internal("non-utf8 sse frame".into()))?
                .trim_end();
            let Some(data) = frame.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }

            let mut value: serde_json::Value = match serde_json::from_str(data) {
                Ok(value) => value,
                // pass malformed frames through untouched
                Err(_) => {
                    sink.write_sse_raw(Bytes::from(format!("{frame}\n\n"))).await?;
                    continue;
                }
            };

            if let Some(u) = value.get("usage") {
                if !u.is_null() {
                    if let Ok(parsed) = serde_json::from_value::<ApiUsage>(u.clone()) {
                        usage = Some(parsed);
                    }
                }
            }
            for choice in value
                .get("choices")
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
            {
                if let Some(text) = choice.pointer("/delta/content").and_then(|t| t.as_str()) {
                    streamed_text.push_str(text);
                }
            }

            value["model"] = serde_json::Value::String(meta.origin_model.clone());
            sink.write_sse_json(&value).await?;
        }
    }

    sink.write_sse_done().await?;

    Ok(match usage {
        Some(u) => u.into(),
        None => Usage::new(
            meta.request_usage.input_tokens,
            estimate_text_tokens(&streamed_text),
        ),
    })
}

fn find_frame_end(buffer: &BytesMut) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Non-streaming chat: parse, rewrite the model, adopt or estimate usage.
pub(crate) async fn json_chat_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let body = resp.bytes().await?;
    let mut value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Internal(format!("upstream json: {e}")))?;

    let usage = match value.get("usage").filter(|u| !u.is_null()) {
        Some(u) => serde_json::from_value::<ApiUsage>(u.clone())
            .map(Usage::from)
            .unwrap_or_default(),
        None => {
            let text = value
                .pointer("/choices/0/message/content")
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            Usage::new(
                meta.request_usage.input_tokens,
                estimate_text_tokens(text),
            )
        }
    };

    value["model"] = serde_json::Value::String(meta.origin_model.clone());
    sink.write_json(&value).await?;
    Ok(usage)
}

/// JSON reply whose usage field is authoritative (embeddings, rerank).
pub(crate) async fn json_usage_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let body = resp.bytes().await?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Internal(format!("upstream json: {e}")))?;

    let usage = value
        .get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value::<ApiUsage>(u.clone()).ok())
        .map(Usage::from)
        .unwrap_or(meta.request_usage);

    sink.write_json(&value).await?;
    Ok(usage)
}

/// JSON reply with no usage semantics (image generations).
pub(crate) async fn json_passthrough_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let body = resp.bytes().await?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Internal(format!("upstream json: {e}")))?;
    sink.write_json(&value).await?;
    Ok(meta.request_usage)
}

/// Text-to-speech: raw audio bytes, or base64 frames over SSE when the
/// client asked for `stream_format: "sse"`.
pub(crate) async fn audio_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let sse = meta.get_str("stream_format") == Some("sse");
    let usage = meta.request_usage;
    let mut stream = resp.bytes_stream();

    if !sse {
        sink.set_head(200, "application/octet-stream");
    }

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                meta.record_partial_usage(usage);
                return Err(GatewayError::UpstreamTransient {
                    status: 502,
                    message: format!("stream read: {e}"),
                });
            }
        };
        if sse {
            write_audio_delta(sink, &chunk).await?;
        } else {
            sink.write(chunk).await?;
        }
    }

    if sse {
        write_audio_done(sink, usage).await?;
    }
    Ok(usage)
}

pub(crate) async fn write_audio_delta(sink: &mut ResponseSink, audio: &[u8]) -> Result<()> {
    use base64::Engine;
    sink.write_sse_json(&serde_json::json!({
        "type": "speech.audio.delta",
        "audio": base64::engine::general_purpose::STANDARD.encode(audio),
    }))
    .await
}

pub(crate) async fn write_audio_done(sink: &mut ResponseSink, usage: Usage) -> Result<()> {
    sink.write_sse_json(&serde_json::json!({
        "type": "speech.audio.done",
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        }
    }))
    .await?;
    sink.write_sse_done().await
}

/// Speech-to-text: the upstream replies JSON; reshape for the client's
/// requested response format and estimate usage from the transcript.
pub(crate) async fn stt_handler(
    meta: &mut RelayMeta,
    resp: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let body = resp.bytes().await?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Internal(format!("upstream json: {e}")))?;
    let text = value
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let usage = Usage::new(meta.request_usage.input_tokens, estimate_text_tokens(&text));

    match meta.get_str("response_format") {
        Some("text") => {
            sink.set_head(200, "text/plain; charset=utf-8");
            sink.write(Bytes::from(text)).await?;
        }
        _ => {
            sink.write_json(&serde_json::json!({ "text": text })).await?;
        }
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adaptor::NoopRelayStore;

    #[tokio::test]
    async fn convert_rewrites_model_and_estimates_usage() {
        let mut meta = RelayMeta::for_tests(Mode::ChatCompletions);
        meta.actual_model = "upstream-model".into();
        let payload = RelayPayload::Json(serde_json::json!({
            "model": "client-model",
            "messages": [{"role": "user", "content": "abcdefgh"}],
            "stream": true,
        }));

        let converted = OpenAIAdaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await
            .unwrap();

        let ConvertedBody::Bytes(body) = converted.body else {
            panic!("expected body bytes");
        };
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["model"], "upstream-model");
        assert!(meta.get_bool("stream"));
        assert_eq!(meta.request_usage.input_tokens, 2);
    }

    #[test]
    fn url_derivation_rejects_unknown_modes() {
        let meta = RelayMeta::for_tests(Mode::ChatCompletions);
        let url = openai_request_url(&meta, BASE_URL).unwrap();
        assert_eq!(url.url, "https://api.openai.com/v1/chat/completions");

        let meta = RelayMeta::for_tests(Mode::VideoGenerationsGetJobs);
        assert!(matches!(
            openai_request_url(&meta, BASE_URL),
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn multipart_rebuild_rewrites_model_and_captures_format() {
        let mut meta = RelayMeta::for_tests(Mode::AudioTranscription);
        meta.actual_model = "whisper-upstream".into();
        let parts = vec![
            FormPart {
                name: "model".into(),
                filename: None,
                content_type: None,
                data: Bytes::from_static(b"whisper-client"),
            },
            FormPart {
                name: "response_format".into(),
                filename: None,
                content_type: None,
                data: Bytes::from_static(b"text"),
            },
            FormPart {
                name: "file".into(),
                filename: Some("audio.mp3".into()),
                content_type: Some("audio/mpeg".into()),
                data: Bytes::from_static(b"\x00\x01"),
            },
        ];

        let converted = convert_multipart_request(&mut meta, &parts).unwrap();
        assert_eq!(meta.get_str("response_format"), Some("text"));

        let ConvertedBody::Bytes(body) = converted.body else {
            panic!("expected body bytes");
        };
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("whisper-upstream"));
        assert!(!body.contains("whisper-client"));
        assert!(!body.contains("response_format"));
        assert!(body.contains("filename=\"audio.mp3\""));
    }
}
