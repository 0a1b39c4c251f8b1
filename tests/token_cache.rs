//! Bearer-token cache behavior against a stubbed IAM endpoint

use chrono::{Duration, Utc};
use modelgate::core::adaptor::baiduv2;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn token_body(token: &str) -> serde_json::Value {
    json!({
        "token": token,
        "expireTime": (Utc::now() + Duration::hours(24)).to_rfc3339(),
    })
}

/// S6: two concurrent requests on the same `ak|sk` share one signing
/// round trip and observe the same token.
#[tokio::test]
async fn concurrent_requests_share_one_signing_roundtrip() {
    let iam = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/BCE-BEARER/token"))
        .and(query_param("expireInSeconds", "86400"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(token_body("tok-shared"))
                // keep the request in flight long enough for both
                // callers to pile onto the same load
                .set_delay(std::time::Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&iam)
        .await;

    let client = reqwest::Client::new();
    let endpoint = iam.uri();
    let key = "ak-s6|sk-s6";

    let (a, b) = tokio::join!(
        baiduv2::get_bearer_token(&client, &endpoint, key),
        baiduv2::get_bearer_token(&client, &endpoint, key),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a, "tok-shared");
    assert_eq!(a, b);
}

/// A second call after the first completes is served from the cache.
#[tokio::test]
async fn cached_token_skips_the_endpoint() {
    let iam = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/BCE-BEARER/token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(token_body("tok-cached")))
        .expect(1)
        .mount(&iam)
        .await;

    let client = reqwest::Client::new();
    let endpoint = iam.uri();
    let key = "ak-cache|sk-cache";

    assert_eq!(
        baiduv2::get_bearer_token(&client, &endpoint, key)
            .await
            .unwrap(),
        "tok-cached"
    );
    assert_eq!(
        baiduv2::get_bearer_token(&client, &endpoint, key)
            .await
            .unwrap(),
        "tok-cached"
    );
}

/// Malformed compound keys never reach the endpoint.
#[tokio::test]
async fn malformed_key_is_rejected_locally() {
    let client = reqwest::Client::new();
    let err = baiduv2::get_bearer_token(&client, "http://127.0.0.1:1", "not-compound")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        modelgate::utils::error::GatewayError::BadRequest(_)
    ));
}

/// A non-201 reply is a transient upstream failure.
#[tokio::test]
async fn non_created_status_is_transient() {
    let iam = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/BCE-BEARER/token"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&iam)
        .await;

    let client = reqwest::Client::new();
    let err = baiduv2::get_bearer_token(&client, &iam.uri(), "ak-err|sk-err")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        modelgate::utils::error::GatewayError::UpstreamTransient { .. }
    ));
}
