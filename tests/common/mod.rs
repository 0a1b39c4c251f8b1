#![allow(dead_code)]

//! Shared fixtures for the relay scenario tests

use std::collections::HashMap;
use std::sync::Arc;

use modelgate::config::{MonitorConfig, RelayConfig};
use modelgate::core::adaptor::{NoopRelayStore, default_registry};
use modelgate::core::billing::InProcessGroupBalance;
use modelgate::core::cache::{CacheHandle, ModelCaches};
use modelgate::core::limiter::RateLimiter;
use modelgate::core::mode::Mode;
use modelgate::core::model::{
    Channel, ChannelStatus, ChannelType, Group, GroupStatus, ModelConfig, Price,
};
use modelgate::core::monitor::HealthMonitor;
use modelgate::core::relay::RelayContext;

pub const MODEL: &str = "gpt-like-model";

pub fn chat_model_config() -> ModelConfig {
    ModelConfig {
        model: MODEL.to_string(),
        mode: Mode::ChatCompletions,
        owner: "openai".to_string(),
        price: Price {
            input_per_token: 0.001,
            output_per_token: 0.002,
        },
        ..Default::default()
    }
}

pub fn channel(id: i32, base_url: &str, priority: i32) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        channel_type: ChannelType::OpenAI,
        base_url: base_url.to_string(),
        key: format!("sk-{id}"),
        models: vec![MODEL.to_string()],
        model_mapping: HashMap::new(),
        priority,
        status: ChannelStatus::Enabled,
        sets: Vec::new(),
        config: None,
        used_amount: 0.0,
        request_count: 0,
        retry_count: 0,
        balance: 0.0,
        balance_updated_at: None,
        last_test_error_at: None,
    }
}

pub fn group(id: &str, status: GroupStatus) -> Arc<Group> {
    Arc::new(Group {
        id: id.to_string(),
        status,
        available_sets: Vec::new(),
        rpm_ratio: 0.0,
        tpm_ratio: 0.0,
        rpm_overrides: HashMap::new(),
        tpm_overrides: HashMap::new(),
    })
}

pub struct TestHarness {
    pub ctx: RelayContext,
    pub billing: Arc<InProcessGroupBalance>,
    pub monitor: Arc<HealthMonitor>,
    pub limiter: Arc<RateLimiter>,
}

pub fn harness(channels: Vec<Channel>, balance: f64) -> TestHarness {
    let monitor = Arc::new(HealthMonitor::new(MonitorConfig {
        window_secs: 300,
        max_samples: 64,
        min_samples: 4,
        ban_threshold: 0.5,
        ban_duration_secs: 60,
        record_ttl_secs: 3600,
    }));
    let limiter = Arc::new(RateLimiter::new());
    let billing = Arc::new(InProcessGroupBalance::new(balance));

    let caches = CacheHandle::new(ModelCaches::build(
        channels,
        vec![chat_model_config()],
        vec![],
    ));

    let ctx = RelayContext {
        caches,
        registry: Arc::new(default_registry()),
        monitor: monitor.clone(),
        limiter: limiter.clone(),
        billing: billing.clone(),
        store: Arc::new(NoopRelayStore),
        client: reqwest::Client::new(),
        config: RelayConfig {
            retry_times: 5,
            attempt_timeout_secs: 10,
            stream_attempt_timeout_secs: 10,
            total_timeout_secs: 30,
        },
    };

    TestHarness {
        ctx,
        billing,
        monitor,
        limiter,
    }
}

pub fn chat_payload() -> modelgate::core::adaptor::RelayPayload {
    modelgate::core::adaptor::RelayPayload::Json(serde_json::json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hello world"}],
    }))
}
