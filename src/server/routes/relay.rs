//! OpenAI-compatible relay routes
//!
//! Each handler parses the inbound payload, spawns the orchestrator
//! against a response sink, and streams whatever the sink carries back
//! to the client. The response head arrives before the handler returns,
//! so error mapping stays with the orchestrator.

use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, Result as ActixResult, web};
use bytes::BytesMut;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::core::adaptor::{FormPart, RelayPayload};
use crate::core::mode::Mode;
use crate::core::relay::{self, RelayInputs, ResponseSink, SinkEvent};
use crate::server::{AppState, middleware, response};
use crate::utils::error::GatewayError;

pub async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::ChatCompletions, body.into_inner()).await
}

pub async fn completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::Completions, body.into_inner()).await
}

pub async fn embeddings(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::Embeddings, body.into_inner()).await
}

pub async fn images_generations(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::ImagesGenerations, body.into_inner()).await
}

pub async fn audio_speech(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::AudioSpeech, body.into_inner()).await
}

pub async fn rerank(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> ActixResult<HttpResponse> {
    relay_json(state, req, Mode::Rerank, body.into_inner()).await
}

pub async fn audio_transcriptions(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: Multipart,
) -> ActixResult<HttpResponse> {
    relay_form(state, req, Mode::AudioTranscription, payload).await
}

pub async fn audio_translations(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: Multipart,
) -> ActixResult<HttpResponse> {
    relay_form(state, req, Mode::AudioTranslation, payload).await
}

async fn relay_json(
    state: web::Data<AppState>,
    req: HttpRequest,
    mode: Mode,
    body: serde_json::Value,
) -> ActixResult<HttpResponse> {
    let model = match body.get("model").and_then(|m| m.as_str()) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => {
            return Ok(response::openai_error(&GatewayError::BadRequest(
                "model is required".into(),
            )));
        }
    };
    dispatch(state, req, mode, model, RelayPayload::Json(body)).await
}

async fn relay_form(
    state: web::Data<AppState>,
    req: HttpRequest,
    mode: Mode,
    mut payload: Multipart,
) -> ActixResult<HttpResponse> {
    let mut parts = Vec::new();
    while let Some(field) = payload.next().await {
        let mut field = match field {
            Ok(field) => field,
            Err(e) => {
                return Ok(response::openai_error(&GatewayError::BadRequest(format!(
                    "multipart: {e}"
                ))));
            }
        };

        let (name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(String::from),
            ),
            None => (String::new(), None),
        };
        let content_type = field.content_type().map(|m| m.to_string());

        let mut data = BytesMut::new();
        while let Some(chunk) = field.next().await {
            match chunk {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    return Ok(response::openai_error(&GatewayError::BadRequest(format!(
                        "multipart read: {e}"
                    ))));
                }
            }
        }

        parts.push(FormPart {
            name,
            filename,
            content_type,
            data: data.freeze(),
        });
    }

    let model = parts
        .iter()
        .find(|p| p.name == "model" && p.filename.is_none())
        .map(|p| String::from_utf8_lossy(&p.data).into_owned());
    let Some(model) = model.filter(|m| !m.is_empty()) else {
        return Ok(response::openai_error(&GatewayError::BadRequest(
            "model is required".into(),
        )));
    };

    dispatch(state, req, mode, model, RelayPayload::Form(parts)).await
}

/// Authenticate, hand the request to the orchestrator on a background
/// task, and return a response streaming the sink.
async fn dispatch(
    state: web::Data<AppState>,
    req: HttpRequest,
    mode: Mode,
    model: String,
    payload: RelayPayload,
) -> ActixResult<HttpResponse> {
    let (group, token_name) = match middleware::authenticate(&state, &req).await {
        Ok(auth) => auth,
        Err(e) => return Ok(response::openai_error(&e)),
    };
    let designated = match middleware::designated_channel(&req) {
        Ok(designated) => designated,
        Err(e) => return Ok(response::openai_error(&e)),
    };

    let mut inputs = RelayInputs::new(group, &token_name, mode, &model, payload);
    inputs.designated_channel = designated;

    let (mut sink, mut receiver) = ResponseSink::channel(32);
    let ctx = state.relay.clone();
    tokio::spawn(async move {
        if let Err(e) = relay::serve(&ctx, inputs, &mut sink).await {
            warn!(model, "relay failed: {e}");
        }
    });

    match receiver.rx.recv().await {
        Some(SinkEvent::Head {
            status,
            content_type,
        }) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = ReceiverStream::new(receiver.rx).map(|event| match event {
                SinkEvent::Data(data) => Ok::<_, actix_web::Error>(data),
                // a second head is a bug; drop it from the body
                SinkEvent::Head { .. } => Ok(bytes::Bytes::new()),
            });
            Ok(HttpResponse::build(status)
                .content_type(content_type)
                .streaming(body))
        }
        // the relay task died before sending a head
        None => Ok(response::openai_error(&GatewayError::Internal(
            "relay task ended without a response".into(),
        ))),
        // Head is sent exactly once, before any data; this violates that invariant
        Some(SinkEvent::Data(_)) => Ok(response::openai_error(&GatewayError::Internal(
            "relay task sent data before a response head".into(),
        ))),
    }
}
