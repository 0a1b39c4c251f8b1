//! Response envelopes
//!
//! Admin and dashboard routes reply with the `APIResponse` envelope;
//! relay routes reply with OpenAI-shaped bodies (errors included).

use actix_web::HttpResponse;
use actix_web::http::StatusCode;
use serde::Serialize;

use crate::utils::error::GatewayError;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn success<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse {
        success: true,
        message: String::new(),
        data: Some(data),
    })
}

pub fn api_error(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ApiResponse::<()> {
        success: false,
        message: message.to_string(),
        data: None,
    })
}

/// Envelope mapping for admin routes.
pub fn from_gateway_error(e: &GatewayError) -> HttpResponse {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    api_error(status, &e.to_string())
}

/// OpenAI-shaped error for relay routes.
pub fn openai_error(e: &GatewayError) -> HttpResponse {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(e.to_openai_json())
}
