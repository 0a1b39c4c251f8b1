//! Request authentication helpers
//!
//! Auth itself lives outside the core: tokens are opaque keys resolved
//! against the token table, yielding the group the relay path consumes.

use actix_web::HttpRequest;
use std::sync::Arc;

use crate::core::model::Group;
use crate::server::AppState;
use crate::utils::error::{GatewayError, Result};

/// Header forcing channel selection; honoured only for internal groups.
pub const CHANNEL_HEADER: &str = "Aiproxy-Channel";

/// Resolve `Authorization: Bearer <token>` to (group, token name).
pub async fn authenticate(state: &AppState, req: &HttpRequest) -> Result<(Arc<Group>, String)> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".into()))?;

    state
        .store
        .find_token(token)
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("invalid token".into()))
}

/// Parse the channel-forcing header if present. Permission is checked by
/// the orchestrator, which knows the group status.
pub fn designated_channel(req: &HttpRequest) -> Result<Option<i32>> {
    match req.headers().get(CHANNEL_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .map(Some)
            .ok_or_else(|| GatewayError::BadRequest("invalid channel header".into())),
    }
}
