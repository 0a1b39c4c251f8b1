//! Public MCP server registration; admin data only, never on the hot path

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status wire values: 1 enabled, 2 disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpStatus {
    Enabled,
    Disabled,
}

impl From<McpStatus> for i32 {
    fn from(s: McpStatus) -> i32 {
        match s {
            McpStatus::Enabled => 1,
            McpStatus::Disabled => 2,
        }
    }
}

impl TryFrom<i32> for McpStatus {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(McpStatus::Enabled),
            2 => Ok(McpStatus::Disabled),
            other => Err(format!("invalid mcp status: {other}")),
        }
    }
}

/// How the MCP endpoint is surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpType {
    Docs,
    ProxySse,
    ProxyStreamable,
    Openapi,
    Embed,
}

impl McpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpType::Docs => "docs",
            McpType::ProxySse => "proxy_sse",
            McpType::ProxyStreamable => "proxy_streamable",
            McpType::Openapi => "openapi",
            McpType::Embed => "embed",
        }
    }

    pub fn parse(s: &str) -> Option<McpType> {
        match s {
            "docs" => Some(McpType::Docs),
            "proxy_sse" => Some(McpType::ProxySse),
            "proxy_streamable" => Some(McpType::ProxyStreamable),
            "openapi" => Some(McpType::Openapi),
            "embed" => Some(McpType::Embed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "public_mcps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub status: i32,
    pub mcp_type: String,
    pub endpoint: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub config: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
