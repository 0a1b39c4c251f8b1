//! Doubao speech adaptor
//!
//! Text-to-speech over a binary WebSocket protocol: the request is a
//! gzip-compressed JSON document behind a 4-byte version/type/compression
//! header, the reply is a sequence of audio frames. The adaptor owns the
//! socket from dispatch onward; the synthetic handshake response only
//! marks that the connection is up.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use std::io::{Read, Write};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, ConvertedBody, ConvertedRequest, KeyValidator, RelayPayload,
    RelayStore, RequestUrl, UpstreamResponse, openai, split_compound_key,
};
use crate::core::mode::Mode;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::{SpeechRequest, Usage};
use crate::utils::error::{GatewayError, Result};

pub const BASE_URL: &str = "wss://openspeech.bytedance.com";

const TTS_PATH: &str = "/api/v1/tts/ws_binary";

// version: b0001, header size: b0001 (x4 bytes), message type: b0001
// (full client request), flags: b0000, serialization: b0001 (JSON),
// compression: b0001 (gzip), reserved: 0x00
const DEFAULT_HEADER: [u8; 4] = [0x11, 0x10, 0x11, 0x00];

pub struct DoubaoAudioAdaptor;

fn app_id_and_token(key: &str) -> Result<(&str, &str)> {
    split_compound_key(key).map_err(GatewayError::BadRequest)
}

#[async_trait]
impl Adaptor for DoubaoAudioAdaptor {
    fn name(&self) -> &'static str {
        "doubaoaudio"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports(&self, mode: Mode) -> bool {
        matches!(mode, Mode::AudioSpeech)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["WebSocket TTS with binary framing", "Voice cloning clusters"],
            models: vec!["doubao-tts", "doubao-tts-mega"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        match meta.mode {
            Mode::AudioSpeech => {
                let base = meta.base_url(self.default_base_url());
                Ok(RequestUrl::post(ws_url(&openai::join_url(base, TTS_PATH))))
            }
            other => Err(GatewayError::BadRequest(format!(
                "unsupported mode: {other}"
            ))),
        }
    }

    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        _client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()> {
        let (_, token) = app_id_and_token(&meta.channel.key)?;
        openai::bearer_auth(token, headers)
    }

    async fn convert_request(
        &self,
        meta: &mut RelayMeta,
        _store: &dyn RelayStore,
        payload: &RelayPayload,
    ) -> Result<ConvertedRequest> {
        let value = payload
            .as_json()
            .ok_or_else(|| GatewayError::BadRequest("speech expects a JSON body".into()))?;
        let request: SpeechRequest = serde_json::from_value(value.clone())
            .map_err(|e| GatewayError::BadRequest(format!("speech request: {e}")))?;

        meta.set("stream_format", serde_json::json!(request.stream_format));
        meta.request_usage = Usage::input_only(request.input.chars().count() as u64);

        let (app_id, token) = app_id_and_token(&meta.channel.key)?;

        let voice = if request.voice.is_empty() {
            "zh_female_cancan_mars_bigtts".to_string()
        } else {
            request.voice.clone()
        };
        // voice-cloned speakers live on the mega cluster and take plain text
        let (cluster, text_type) = if voice.starts_with("S_") {
            ("volcano_mega", "plain")
        } else {
            ("volcano_tts", "ssml")
        };
        let encoding = if request.response_format.is_empty() {
            "pcm".to_string()
        } else {
            request.response_format.clone()
        };

        let mut audio = serde_json::json!({
            "voice_type": voice,
            "encoding": encoding,
        });
        if request.speed > 0.0 {
            audio["speed_ratio"] = serde_json::json!(request.speed);
        }
        if let Some(volume) = value.get("volume_ratio").and_then(|v| v.as_f64()) {
            audio["volume_ratio"] = serde_json::json!(volume);
        }
        if let Some(pitch) = value.get("pitch_ratio").and_then(|v| v.as_f64()) {
            audio["pitch_ratio"] = serde_json::json!(pitch);
        }

        let doubao_request = serde_json::json!({
            "app": {
                "appid": app_id,
                "token": token,
                "cluster": cluster,
            },
            "user": { "uid": meta.request_id },
            "audio": audio,
            "request": {
                "reqid": uuid::Uuid::new_v4().to_string(),
                "text": request.input,
                "text_type": text_type,
                "operation": "submit",
            }
        });

        let compressed = gzip_compress(&serde_json::to_vec(&doubao_request)?)?;
        let mut frame = Vec::with_capacity(8 + compressed.len());
        frame.extend_from_slice(&DEFAULT_HEADER);
        frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&compressed);

        Ok(ConvertedRequest {
            headers: HeaderMap::new(),
            body: ConvertedBody::Bytes(Bytes::from(frame)),
        })
    }

    async fn do_request(
        &self,
        meta: &mut RelayMeta,
        _client: &reqwest::Client,
        url: RequestUrl,
        converted: ConvertedRequest,
        _timeout: Duration,
    ) -> Result<UpstreamResponse> {
        let mut ws_request = url
            .url
            .clone()
            .into_client_request()
            .map_err(|e| GatewayError::Internal(format!("ws request: {e}")))?;
        for (name, value) in converted.headers.iter() {
            ws_request.headers_mut().insert(name.clone(), value.clone());
        }
        if let Ok((_, token)) = app_id_and_token(&meta.channel.key) {
            if let Ok(value) = format!("Bearer {token}").parse() {
                ws_request.headers_mut().insert("Authorization", value);
            }
        }

        let (mut conn, _) =
            connect_async(ws_request)
                .await
                .map_err(|e| GatewayError::UpstreamTransient {
                    status: 502,
                    message: format!("ws connect: {e}"),
                })?;

        let ConvertedBody::Bytes(frame) = converted.body else {
            return Err(GatewayError::Internal("missing tts frame".into()));
        };
        conn.send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| GatewayError::UpstreamTransient {
                status: 502,
                message: format!("ws write: {e}"),
            })?;

        meta.ws_conn = Some(conn);
        Ok(UpstreamResponse::Handshake)
    }

    async fn do_response(
        &self,
        meta: &mut RelayMeta,
        _store: &dyn RelayStore,
        resp: UpstreamResponse,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        let UpstreamResponse::Handshake = resp else {
            return Err(GatewayError::Internal(
                "doubao audio expects a websocket handshake".into(),
            ));
        };
        let mut conn = meta
            .ws_conn
            .take()
            .ok_or_else(|| GatewayError::Internal("ws connection missing from meta".into()))?;

        let sse = meta.get_str("stream_format") == Some("sse");
        let usage = meta.request_usage;

        if !sse {
            sink.set_head(200, "application/octet-stream");
        }

        loop {
            let message = match conn.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    meta.record_partial_usage(usage);
                    return Err(GatewayError::UpstreamTransient {
                        status: 502,
                        message: format!("ws read: {e}"),
                    });
                }
                None => {
                    meta.record_partial_usage(usage);
                    return Err(GatewayError::UpstreamTransient {
                        status: 502,
                        message: "ws closed before final frame".into(),
                    });
                }
            };

            let data = match message {
                Message::Binary(data) => data,
                Message::Close(_) => {
                    meta.record_partial_usage(usage);
                    return Err(GatewayError::UpstreamTransient {
                        status: 502,
                        message: "ws closed before final frame".into(),
                    });
                }
                _ => continue,
            };

            let frame = match parse_frame(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    meta.record_partial_usage(usage);
                    return Err(e);
                }
            };
            if !frame.audio.is_empty() {
                if sse {
                    openai::write_audio_delta(sink, &frame.audio).await?;
                } else {
                    sink.write(Bytes::from(frame.audio)).await?;
                }
            }
            if frame.is_last {
                break;
            }
        }

        if sse {
            openai::write_audio_done(sink, usage).await?;
        }
        let _ = conn.close(None).await;
        Ok(usage)
    }
}

impl KeyValidator for DoubaoAudioAdaptor {
    fn validate_key(&self, key: &str) -> Result<(), String> {
        split_compound_key(key).map(|_| ())
    }
}

fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[derive(Debug)]
struct AudioFrame {
    audio: Vec<u8>,
    is_last: bool,
}

/// Decode one server frame. Audio-only frames are message type 0xb with
/// a signed sequence number (negative means final); 0xc is a frontend
/// event with nothing to forward; 0xf is an error payload,
/// gzip-compressed when the compression nibble says so.
fn parse_frame(data: &[u8]) -> Result<AudioFrame> {
    if data.len() < 4 {
        return Err(GatewayError::Internal("tts frame too short".into()));
    }

    let header_size = (data[0] & 0x0f) as usize * 4;
    let message_type = data[1] >> 4;
    let flags = data[1] & 0x0f;
    let compression = data[2] & 0x0f;
    if data.len() < header_size {
        return Err(GatewayError::Internal("tts frame header truncated".into()));
    }
    let payload = &data[header_size..];

    match message_type {
        0xb => {
            // no sequence number means a bare ACK
            if flags == 0 {
                return Ok(AudioFrame {
                    audio: Vec::new(),
                    is_last: false,
                });
            }
            if payload.len() < 8 {
                return Err(GatewayError::Internal("tts audio frame truncated".into()));
            }
            let sequence = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(AudioFrame {
                audio: payload[8..].to_vec(),
                is_last: sequence < 0,
            })
        }
        // frontend event, carries no audio; the read loop continues
        0xc => Ok(AudioFrame {
            audio: Vec::new(),
            is_last: false,
        }),
        0xf => {
            if payload.len() < 8 {
                return Err(GatewayError::Internal("tts error frame truncated".into()));
            }
            let mut message = payload[8..].to_vec();
            if compression == 1 {
                message = gzip_decompress(&message)?;
            }
            Err(GatewayError::UpstreamTransient {
                status: 502,
                message: String::from_utf8_lossy(&message).into_owned(),
            })
        }
        other => Err(GatewayError::Internal(format!(
            "unexpected tts message type: {other:#x}"
        ))),
    }
}

fn gzip_compress(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(input)
        .and_then(|_| encoder.finish())
        .map_err(|e| GatewayError::Internal(format!("gzip: {e}")))
}

fn gzip_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(input);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| GatewayError::Internal(format!("gunzip: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adaptor::NoopRelayStore;

    #[test]
    fn scheme_upgrade() {
        assert_eq!(ws_url("https://host/path"), "wss://host/path");
        assert_eq!(ws_url("http://host/path"), "ws://host/path");
        assert_eq!(ws_url("wss://host/path"), "wss://host/path");
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"hello tts";
        let packed = gzip_compress(data).unwrap();
        assert_eq!(gzip_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn audio_frame_parsing() {
        // header: 1 word, type 0xb, flags 1, payload: seq=-1, size, audio
        let mut frame = vec![0x11, 0xb1, 0x11, 0x00];
        frame.extend_from_slice(&(-1i32).to_be_bytes());
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(b"pcm");

        let parsed = parse_frame(&frame).unwrap();
        assert!(parsed.is_last);
        assert_eq!(parsed.audio, b"pcm");

        // positive sequence: not last
        let mut frame = vec![0x11, 0xb1, 0x11, 0x00];
        frame.extend_from_slice(&(2i32).to_be_bytes());
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(b"pcm");
        assert!(!parse_frame(&frame).unwrap().is_last);
    }

    #[test]
    fn frontend_event_frame_is_skipped() {
        let mut frame = vec![0x11, 0xc0, 0x11, 0x00];
        frame.extend_from_slice(&4u32.to_be_bytes());

        let parsed = parse_frame(&frame).unwrap();
        assert!(parsed.audio.is_empty());
        assert!(!parsed.is_last);
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let frame = vec![0x11, 0xa0, 0x11, 0x00];
        let err = parse_frame(&frame).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn error_frame_surfaces_message() {
        let mut frame = vec![0x11, 0xf0, 0x10, 0x00];
        frame.extend_from_slice(&55u32.to_be_bytes());
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(b"boom");

        let err = parse_frame(&frame).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTransient { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn convert_builds_a_framed_gzip_payload() {
        let mut meta = RelayMeta::for_tests(Mode::AudioSpeech);
        meta.channel = std::sync::Arc::new(crate::core::model::Channel {
            key: "app-1|tok-1".into(),
            ..(*meta.channel).clone()
        });
        let payload = RelayPayload::Json(serde_json::json!({
            "model": "doubao-tts",
            "input": "你好世界",
            "voice": "S_custom",
        }));

        let converted = DoubaoAudioAdaptor
            .convert_request(&mut meta, &NoopRelayStore, &payload)
            .await
            .unwrap();
        assert_eq!(meta.request_usage.input_tokens, 4);

        let ConvertedBody::Bytes(frame) = converted.body else {
            panic!("expected frame bytes");
        };
        assert_eq!(&frame[..4], &DEFAULT_HEADER);
        let size = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(frame.len(), 8 + size);

        let body: serde_json::Value =
            serde_json::from_slice(&gzip_decompress(&frame[8..]).unwrap()).unwrap();
        assert_eq!(body["app"]["appid"], "app-1");
        assert_eq!(body["app"]["cluster"], "volcano_mega");
        assert_eq!(body["request"]["text_type"], "plain");
        assert_eq!(body["request"]["operation"], "submit");
    }
}
