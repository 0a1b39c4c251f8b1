//! Public MCP registry CRUD
//!
//! Admin data only; the relay hot path never touches these rows.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, Result as ActixResult, web};
use chrono::Utc;
use serde::Deserialize;

use crate::server::{AppState, response};
use crate::storage::entities::public_mcp::{self, McpStatus, McpType};

#[derive(Debug, Deserialize)]
pub struct PublicMcpBody {
    pub id: String,
    pub name: String,
    pub status: McpStatus,
    #[serde(rename = "type")]
    pub mcp_type: McpType,
    pub endpoint: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

pub async fn list(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    match state.store.list_public_mcps().await {
        Ok(rows) => Ok(response::success(rows)),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

pub async fn upsert(
    state: web::Data<AppState>,
    body: web::Json<PublicMcpBody>,
) -> ActixResult<HttpResponse> {
    let body = body.into_inner();
    if body.id.is_empty() {
        return Ok(response::api_error(StatusCode::BAD_REQUEST, "id is required"));
    }

    let row = public_mcp::Model {
        id: body.id,
        name: body.name,
        status: body.status.into(),
        mcp_type: body.mcp_type.as_str().to_string(),
        endpoint: body.endpoint,
        config: body.config.map(|c| c.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    match state.store.upsert_public_mcp(row).await {
        Ok(()) => Ok(response::success(())),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}

pub async fn remove(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> ActixResult<HttpResponse> {
    match state.store.delete_public_mcp(&id.into_inner()).await {
        Ok(()) => Ok(response::success(())),
        Err(e) => Ok(response::from_gateway_error(&e)),
    }
}
