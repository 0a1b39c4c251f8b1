//! Gateway error taxonomy
//!
//! Every failure on the relay path is classified into one of these kinds.
//! Adaptors classify; the orchestrator decides retry vs surface; the HTTP
//! layer maps to status codes and response envelopes.

use serde_json::json;

/// Result alias used across the gateway
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed client input, unknown mode, missing required params
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Token could not be resolved to a group
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Group is disabled, or a privileged header was used outside an
    /// internal group
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No channel supports the requested model
    #[error("channels not found for model `{0}`")]
    ChannelsNotFound(String),

    /// All supporting channels are banned or already failed this request
    #[error("channels exhausted for model `{0}`")]
    ChannelsExhausted(String),

    /// Per-(group, model) RPM cap exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Group balance is not enough, or the debit was rejected
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Upstream 5xx, timeout, or network failure; worth another channel
    #[error("upstream error ({status}): {message}")]
    UpstreamTransient { status: u16, message: String },

    /// Upstream 4xx attributable to the request shape; the same shape
    /// would fail on any channel
    #[error("upstream rejected request ({status}): {message}")]
    UpstreamPermanent { status: u16, message: String },

    /// Client went away while we were still writing the response
    #[error("client closed connection")]
    ClientClosed,

    /// Unexpected parse/serialize/cache/storage failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the orchestrator may retry this failure on another channel.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamTransient { .. })
    }

    /// HTTP status surfaced to the client.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::ChannelsNotFound(_) => 404,
            GatewayError::ChannelsExhausted(_) => 503,
            GatewayError::RateLimited(_) => 429,
            GatewayError::QuotaExhausted(_) => 403,
            GatewayError::UpstreamTransient { .. } => 502,
            GatewayError::UpstreamPermanent { status, .. } => *status,
            GatewayError::ClientClosed => 499,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code, used as the OpenAI `type` field.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::ChannelsNotFound(_) => "channels_not_found",
            GatewayError::ChannelsExhausted(_) => "channels_exhausted",
            GatewayError::RateLimited(_) => "rate_limit_exceeded",
            GatewayError::QuotaExhausted(_) => "insufficient_quota",
            GatewayError::UpstreamTransient { .. } => "upstream_error",
            GatewayError::UpstreamPermanent { .. } => "upstream_error",
            GatewayError::ClientClosed => "client_closed",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// OpenAI-shaped error body for relay routes.
    pub fn to_openai_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.code(),
                "code": self.http_status(),
            }
        })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            GatewayError::UpstreamTransient {
                status: 502,
                message: e.to_string(),
            }
        } else {
            GatewayError::Internal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("json: {e}"))
    }
}

impl From<sea_orm::DbErr> for GatewayError {
    fn from(e: sea_orm::DbErr) -> Self {
        GatewayError::Internal(format!("database: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_upstream_errors_are_retryable() {
        assert!(
            GatewayError::UpstreamTransient {
                status: 502,
                message: "bad gateway".into()
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::UpstreamPermanent {
                status: 400,
                message: "bad shape".into()
            }
            .is_retryable()
        );
        assert!(!GatewayError::QuotaExhausted("empty".into()).is_retryable());
        assert!(!GatewayError::BadRequest("nope".into()).is_retryable());
        assert!(!GatewayError::ChannelsExhausted("m".into()).is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::ChannelsNotFound("m".into()).http_status(), 404);
        assert_eq!(GatewayError::ChannelsExhausted("m".into()).http_status(), 503);
        assert_eq!(GatewayError::RateLimited("rpm".into()).http_status(), 429);
        assert_eq!(
            GatewayError::UpstreamPermanent {
                status: 422,
                message: String::new()
            }
            .http_status(),
            422
        );
    }
}
