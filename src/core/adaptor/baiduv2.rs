//! Baidu Qianfan v2 adaptor
//!
//! OpenAI-compatible chat endpoint, but authentication requires signing
//! an HMAC-SHA256 request against the channel's `ak|sk` credential to
//! obtain a short-lived bearer token. Tokens are cached per compound key
//! with singleflight loading: concurrent requests on the same key share
//! one signing round trip.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use moka::future::Cache;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::core::adaptor::{
    Adaptor, AdaptorMetadata, ConvertedRequest, KeyValidator, RelayPayload, RelayStore,
    RequestUrl, UpstreamResponse, openai, split_compound_key,
};
use crate::core::mode::Mode;
use crate::core::relay::{RelayMeta, ResponseSink};
use crate::core::types::Usage;
use crate::utils::error::{GatewayError, Result};

pub const BASE_URL: &str = "https://qianfan.baidubce.com";

/// IAM endpoint issuing bearer tokens; overridable per channel through
/// the `token_endpoint` spec key (used by channel probes and tests).
pub const TOKEN_ENDPOINT: &str = "https://iam.bj.baidubce.com";

const TOKEN_URI: &str = "/v1/BCE-BEARER/token";
const TOKEN_QUERY: &str = "expireInSeconds=86400";

pub struct BaiduV2Adaptor;

#[async_trait]
impl Adaptor for BaiduV2Adaptor {
    fn name(&self) -> &'static str {
        "baiduv2"
    }

    fn default_base_url(&self) -> &'static str {
        BASE_URL
    }

    fn supports(&self, mode: Mode) -> bool {
        matches!(mode, Mode::ChatCompletions)
    }

    fn metadata(&self) -> AdaptorMetadata {
        AdaptorMetadata {
            features: vec!["OpenAI-compatible chat", "IAM bearer-token signing"],
            models: vec!["ernie-4.0-8k", "ernie-speed-128k", "deepseek-v3"],
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<RequestUrl> {
        match meta.mode {
            Mode::ChatCompletions => Ok(RequestUrl::post(openai::join_url(
                meta.base_url(self.default_base_url()),
                "/v2/chat/completions",
            ))),
            other => Err(GatewayError::BadRequest(format!(
                "unsupported mode: {other}"
            ))),
        }
    }

    async fn setup_headers(
        &self,
        meta: &RelayMeta,
        client: &reqwest::Client,
        headers: &mut HeaderMap,
    ) -> Result<()> {
        let endpoint = meta
            .channel
            .config
            .as_ref()
            .and_then(|c| c.get("token_endpoint"))
            .and_then(|v| v.as_str())
            .unwrap_or(TOKEN_ENDPOINT)
            .to_string();
        let token = get_bearer_token(client, &endpoint, &meta.channel.key).await?;
        openai::bearer_auth(&token, headers)
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
                "baiduv2 adaptor got a non-HTTP response".into(),
            ));
        };
        openai::openai_do_response(meta, resp, sink).await
    }
}

impl KeyValidator for BaiduV2Adaptor {
    fn validate_key(&self, key: &str) -> Result<(), String> {
        split_compound_key(key).map(|_| ())
    }
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "expireTime")]
    expire_time: DateTime<Utc>,
    token: String,
}

static TOKEN_CACHE: Lazy<Cache<String, Arc<CachedToken>>> = Lazy::new(|| {
    Cache::builder()
        .time_to_live(Duration::from_secs(23 * 3600))
        .build()
});

/// Resolve a bearer token for an `ak|sk` credential, hitting the cache
/// first. Concurrent callers on the same key coalesce into one signing
/// round trip.
pub async fn get_bearer_token(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
) -> Result<String> {
    split_compound_key(api_key).map_err(GatewayError::BadRequest)?;

    if let Some(cached) = TOKEN_CACHE.get(api_key).await {
        if cached.expires_at > Utc::now() {
            return Ok(cached.token.clone());
        }
        TOKEN_CACHE.invalidate(api_key).await;
    }

    let cached = TOKEN_CACHE
        .try_get_with(api_key.to_string(), fetch_token(client, endpoint, api_key))
        .await
        .map_err(|e: Arc<GatewayError>| {
            error!("get baiduv2 access token failed: {e}");
            GatewayError::UpstreamTransient {
                status: 502,
                message: format!("get baiduv2 access token failed: {e}"),
            }
        })?;

    Ok(cached.token.clone())
}

async fn fetch_token(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
) -> Result<Arc<CachedToken>> {
    let (ak, sk) = split_compound_key(api_key).map_err(GatewayError::BadRequest)?;
    let host = url::Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .ok_or_else(|| GatewayError::Internal(format!("invalid token endpoint: {endpoint}")))?;

    let authorization = sign_authorization(ak, sk, &host, Utc::now());

    let resp = client
        .get(format!(
            "{}{}?{}",
            endpoint.trim_end_matches('/'),
            TOKEN_URI,
            TOKEN_QUERY
        ))
        .header("Authorization", authorization)
        .send()
        .await?;

    if resp.status().as_u16() != 201 {
        return Err(GatewayError::UpstreamTransient {
            status: resp.status().as_u16(),
            message: format!("get token failed, status code: {}", resp.status()),
        });
    }

    let token: TokenResponse = resp.json().await.map_err(|e| {
        GatewayError::Internal(format!("token response: {e}"))
    })?;

    // TTL = min(server-reported expiry, 23h) minus a 10-minute margin
    let cap = Utc::now() + ChronoDuration::hours(23);
    let expires_at = token.expire_time.min(cap) - ChronoDuration::minutes(10);

    Ok(Arc::new(CachedToken {
        token: token.token,
        expires_at,
    }))
}

/// BCE v1 request signature:
/// canonical request `METHOD\nURI\nQUERY\nhost:HOST`, auth prefix
/// `bce-auth-v1/{ak}/{iso8601-utc}/{1800}`, signing key `HMAC(sk,
/// prefix)`, signature `HMAC(signing_key, canonical_request)`, and the
/// final header value `{prefix}/host/{signature}`.
pub fn sign_authorization(ak: &str, sk: &str, host: &str, now: DateTime<Utc>) -> String {
    let canonical_request = format!("GET\n{TOKEN_URI}\n{TOKEN_QUERY}\nhost:{host}");
    let timestamp = now.format("%Y-%m-%dT%H:%M:%SZ");
    let auth_string_prefix = format!("bce-auth-v1/{ak}/{timestamp}/1800");

    let signing_key = hmac_sha256_hex(sk, &auth_string_prefix);
    let signature = hmac_sha256_hex(&signing_key, &canonical_request);

    format!("{auth_string_prefix}/host/{signature}")
}

fn hmac_sha256_hex(key: &str, data: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_must_be_compound() {
        assert!(BaiduV2Adaptor.validate_key("ak|sk").is_ok());
        assert!(BaiduV2Adaptor.validate_key("just-a-key").is_err());
    }

    #[test]
    fn authorization_shape_is_stable() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let auth = sign_authorization("my-ak", "my-sk", "iam.bj.baidubce.com", now);

        let parts: Vec<&str> = auth.split('/').collect();
        assert_eq!(parts[0], "bce-auth-v1");
        assert_eq!(parts[1], "my-ak");
        assert_eq!(parts[2], "2024-05-01T12:00:00Z");
        assert_eq!(parts[3], "1800");
        assert_eq!(parts[4], "host");
        // 32-byte hmac, hex encoded
        assert_eq!(parts[5].len(), 64);

        // deterministic given the same inputs
        assert_eq!(
            auth,
            sign_authorization("my-ak", "my-sk", "iam.bj.baidubce.com", now)
        );
    }
}
