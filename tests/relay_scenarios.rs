//! End-to-end relay orchestration scenarios over stubbed upstreams

mod common;

use common::{MODEL, TestHarness, channel, chat_payload, group, harness};
use modelgate::core::mode::Mode;
use modelgate::core::model::GroupStatus;
use modelgate::core::relay::{self, RelayInputs, ResponseSink};
use modelgate::utils::error::GatewayError;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_ok_body() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hi from upstream"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
    })
}

async fn mock_chat_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_ok_body()))
        .mount(server)
        .await;
}

async fn mock_chat_502(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(502)
                .set_body_json(json!({"error": {"message": "bad gateway"}})),
        )
        .mount(server)
        .await;
}

/// S1: one enabled channel, a funded group, one chat request.
#[tokio::test]
async fn happy_path_bills_and_records() {
    let upstream = MockServer::start().await;
    mock_chat_ok(&upstream).await;

    let TestHarness {
        ctx,
        billing,
        monitor,
        limiter,
    } = harness(vec![channel(1, &upstream.uri(), 0)], 10.0);

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );

    let (mut sink, receiver) = ResponseSink::channel(64);
    let result = relay::serve(&ctx, inputs, &mut sink).await.unwrap();
    drop(sink);

    assert_eq!(result.code, 200);
    assert_eq!(result.channel_id, 1);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.usage.input_tokens, 3);
    assert_eq!(result.usage.output_tokens, 5);
    assert_eq!(result.usage.total_tokens, 8);

    // debit = 3 * input_price + 5 * output_price
    let expected = 3.0 * 0.001 + 5.0 * 0.002;
    assert!((result.amount - expected).abs() < 1e-12);
    assert!((billing.balance_of("acme") - (10.0 - expected)).abs() < 1e-12);

    // monitor saw one success, TPM advanced by the token total
    let rates = monitor.error_rates(MODEL);
    assert_eq!(rates.get(&1), Some(&0.0));
    assert_eq!(limiter.channel_tpm("1", MODEL), 8);
    assert_eq!(limiter.group_tpm("acme", MODEL, "tok"), 8);
    assert_eq!(limiter.channel_rpm("*", MODEL), 1);

    // and the client got a well-formed body with the original model name
    let (head, body) = receiver.collect().await;
    assert_eq!(head.unwrap().0, 200);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["model"], MODEL);
    assert_eq!(body["choices"][0]["message"]["content"], "hi from upstream");
}

/// S2: the first channel 502s, the second succeeds; the client sees 200.
#[tokio::test]
async fn failover_retries_on_transient_upstream_error() {
    let bad = MockServer::start().await;
    mock_chat_502(&bad).await;
    let good = MockServer::start().await;
    mock_chat_ok(&good).await;

    // an extreme priority skew makes the failing channel all but certain
    // to be drawn first
    let TestHarness { ctx, monitor, .. } = harness(
        vec![
            channel(1, &bad.uri(), 1_000_000),
            channel(2, &good.uri(), 1),
        ],
        10.0,
    );

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );

    let (mut sink, receiver) = ResponseSink::channel(64);
    let result = relay::serve(&ctx, inputs, &mut sink).await.unwrap();
    drop(sink);

    assert_eq!(result.code, 200);
    assert_eq!(result.channel_id, 2);
    assert_eq!(result.attempts, 2);

    let rates = monitor.error_rates(MODEL);
    assert_eq!(rates.get(&1), Some(&1.0));
    assert_eq!(rates.get(&2), Some(&0.0));

    let (head, _) = receiver.collect().await;
    assert_eq!(head.unwrap().0, 200);
}

/// S3: every candidate is banned; the fallback draw still gets one
/// attempt through, and its answer reaches the client.
#[tokio::test]
async fn exhaustion_fallback_attempts_once() {
    let upstream = MockServer::start().await;
    mock_chat_ok(&upstream).await;

    let TestHarness { ctx, monitor, .. } = harness(
        vec![
            channel(1, &upstream.uri(), 0),
            channel(2, &upstream.uri(), 0),
        ],
        10.0,
    );

    // ban both pairs up front
    for id in [1, 2] {
        for _ in 0..4 {
            monitor.record_error(id, MODEL);
        }
    }
    assert_eq!(monitor.banned_channels(MODEL).len(), 2);

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );

    let (mut sink, _receiver) = ResponseSink::channel(64);
    let result = relay::serve(&ctx, inputs, &mut sink).await.unwrap();
    assert_eq!(result.code, 200);
    assert_eq!(result.attempts, 1);
}

/// A single channel that keeps failing: the remembered last-permission
/// channel gets exactly one extra attempt, then the request surfaces
/// exhaustion.
#[tokio::test]
async fn exhausted_pool_falls_back_once_then_503() {
    let bad = MockServer::start().await;
    mock_chat_502(&bad).await;

    let TestHarness { ctx, .. } = harness(vec![channel(1, &bad.uri(), 0)], 10.0);

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );

    let (mut sink, receiver) = ResponseSink::channel(64);
    let err = relay::serve(&ctx, inputs, &mut sink).await.unwrap_err();
    drop(sink);

    assert!(matches!(err, GatewayError::ChannelsExhausted(_)));
    // first attempt plus the single fallback attempt
    assert_eq!(bad.received_requests().await.unwrap().len(), 2);

    let (head, body) = receiver.collect().await;
    assert_eq!(head.unwrap().0, 503);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["type"], "channels_exhausted");
}

/// S4: an internal group with the channel header set hits exactly that
/// channel, no selector involved.
#[tokio::test]
async fn internal_group_designates_channel() {
    let seven = MockServer::start().await;
    mock_chat_ok(&seven).await;
    let other = MockServer::start().await;
    mock_chat_ok(&other).await;

    let TestHarness { ctx, .. } = harness(
        vec![channel(7, &seven.uri(), 0), channel(8, &other.uri(), 0)],
        10.0,
    );

    let mut inputs = RelayInputs::new(
        group("ops", GroupStatus::Internal),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );
    inputs.designated_channel = Some(7);

    let (mut sink, _receiver) = ResponseSink::channel(64);
    let result = relay::serve(&ctx, inputs, &mut sink).await.unwrap();

    assert_eq!(result.channel_id, 7);
    assert_eq!(result.attempts, 1);
    assert_eq!(seven.received_requests().await.unwrap().len(), 1);
    assert_eq!(other.received_requests().await.unwrap().len(), 0);
}

/// The channel header outside an internal group is rejected outright.
#[tokio::test]
async fn designation_is_internal_only() {
    let upstream = MockServer::start().await;
    mock_chat_ok(&upstream).await;

    let TestHarness { ctx, .. } = harness(vec![channel(7, &upstream.uri(), 0)], 10.0);

    let mut inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );
    inputs.designated_channel = Some(7);

    let (mut sink, _receiver) = ResponseSink::channel(64);
    let err = relay::serve(&ctx, inputs, &mut sink).await.unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));
    assert_eq!(upstream.received_requests().await.unwrap().len(), 0);
}

/// Unknown models terminate with 404 before any balance or upstream work.
#[tokio::test]
async fn unknown_model_is_404() {
    let TestHarness { ctx, .. } = harness(vec![], 10.0);

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        "no-such-model",
        chat_payload(),
    );

    let (mut sink, receiver) = ResponseSink::channel(64);
    let err = relay::serve(&ctx, inputs, &mut sink).await.unwrap_err();
    drop(sink);

    assert!(matches!(err, GatewayError::ChannelsNotFound(_)));
    let (head, _) = receiver.collect().await;
    assert_eq!(head.unwrap().0, 404);
}

/// A group with no balance is refused before dispatch.
#[tokio::test]
async fn empty_balance_is_quota_exhausted() {
    let upstream = MockServer::start().await;
    mock_chat_ok(&upstream).await;

    let TestHarness { ctx, .. } = harness(vec![channel(1, &upstream.uri(), 0)], 0.0);

    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        chat_payload(),
    );

    let (mut sink, _receiver) = ResponseSink::channel(64);
    let err = relay::serve(&ctx, inputs, &mut sink).await.unwrap_err();
    assert!(matches!(err, GatewayError::QuotaExhausted(_)));
    assert_eq!(upstream.received_requests().await.unwrap().len(), 0);
}

/// The per-(group, model) RPM cap is enforced before dispatch.
#[tokio::test]
async fn rpm_cap_returns_429() {
    let upstream = MockServer::start().await;
    mock_chat_ok(&upstream).await;

    let TestHarness { ctx, .. } = harness(vec![channel(1, &upstream.uri(), 0)], 10.0);

    let capped = std::sync::Arc::new(modelgate::core::model::Group {
        id: "capped".to_string(),
        status: GroupStatus::Enabled,
        available_sets: Vec::new(),
        rpm_ratio: 0.0,
        tpm_ratio: 0.0,
        rpm_overrides: [(MODEL.to_string(), 1i64)].into(),
        tpm_overrides: Default::default(),
    });

    let (mut sink, _r) = ResponseSink::channel(64);
    relay::serve(
        &ctx,
        RelayInputs::new(capped.clone(), "tok", Mode::ChatCompletions, MODEL, chat_payload()),
        &mut sink,
    )
    .await
    .unwrap();

    let (mut sink, receiver) = ResponseSink::channel(64);
    let err = relay::serve(
        &ctx,
        RelayInputs::new(capped, "tok", Mode::ChatCompletions, MODEL, chat_payload()),
        &mut sink,
    )
    .await
    .unwrap_err();
    drop(sink);

    assert!(matches!(err, GatewayError::RateLimited(_)));
    let (head, _) = receiver.collect().await;
    assert_eq!(head.unwrap().0, 429);
    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

/// Streaming: SSE frames pass through with the model rewritten and the
/// terminal usage frame adopted for billing.
#[tokio::test]
async fn streaming_chat_passthrough() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"id\":\"c1\",\"model\":\"upstream-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"upstream-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"upstream-model\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let TestHarness { ctx, .. } = harness(vec![channel(1, &upstream.uri(), 0)], 10.0);

    let payload = modelgate::core::adaptor::RelayPayload::Json(json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hello world"}],
        "stream": true,
    }));
    let inputs = RelayInputs::new(
        group("acme", GroupStatus::Enabled),
        "tok",
        Mode::ChatCompletions,
        MODEL,
        payload,
    );

    let (mut sink, receiver) = ResponseSink::channel(64);
    let result = relay::serve(&ctx, inputs, &mut sink).await.unwrap();
    drop(sink);

    assert_eq!(result.usage.total_tokens, 8);

    let (head, body) = receiver.collect().await;
    let (status, content_type) = head.unwrap();
    assert_eq!(status, 200);
    assert_eq!(content_type, "text/event-stream");

    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"hel\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
    // frames carry the client's model name, not the upstream's
    assert!(text.contains(&format!("\"model\":\"{MODEL}\"")));
    assert!(!text.contains("upstream-model"));
}
