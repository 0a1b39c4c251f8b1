//! Per-request relay metadata
//!
//! One [`RelayMeta`] lives for one attempt against one channel. Adaptors
//! stash attempt-scoped state in it: stream flags, image parameters, and
//! for WebSocket transports the live connection itself.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::core::mode::Mode;
use crate::core::model::{Channel, ChannelStatus, ChannelType};
use crate::core::types::Usage;

/// WebSocket connection to an upstream, owned by the request task.
pub type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayMeta {
    pub request_id: String,
    pub mode: Mode,
    pub group_id: String,
    pub token_name: String,
    /// Model name the client asked for
    pub origin_model: String,
    /// Model name sent upstream, after per-channel remapping
    pub actual_model: String,
    pub channel: Arc<Channel>,
    /// Input-side usage estimated at convert time; the billing fallback
    /// when the upstream reports nothing
    pub request_usage: Usage,
    /// Upstream socket for WebSocket transports, set by `do_request`
    pub ws_conn: Option<WsConn>,
    values: HashMap<String, serde_json::Value>,
    partial_usage: Option<Usage>,
}

impl RelayMeta {
    pub fn new(
        request_id: String,
        mode: Mode,
        group_id: String,
        token_name: String,
        origin_model: String,
        channel: Arc<Channel>,
    ) -> Self {
        let actual_model = channel.map_model(&origin_model).to_string();
        Self {
            request_id,
            mode,
            group_id,
            token_name,
            origin_model,
            actual_model,
            channel,
            request_usage: Usage::default(),
            ws_conn: None,
            values: HashMap::new(),
            partial_usage: None,
        }
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(|v| v.as_u64())
    }

    /// Usage already delivered when a committed stream fails mid-flight;
    /// the terminal path bills it even though the attempt errored.
    pub fn record_partial_usage(&mut self, usage: Usage) {
        self.partial_usage = Some(usage);
    }

    pub fn partial_usage(&self) -> Option<Usage> {
        self.partial_usage
    }

    /// Base URL for the attempt: the channel's, or the adaptor default.
    pub fn base_url<'a>(&'a self, default: &'a str) -> &'a str {
        if self.channel.base_url.is_empty() {
            default
        } else {
            &self.channel.base_url
        }
    }

    /// Bare meta over a synthetic channel, for unit tests.
    pub fn for_tests(mode: Mode) -> Self {
        let channel = Arc::new(Channel {
            id: 0,
            name: "test".into(),
            channel_type: ChannelType::OpenAI,
            base_url: String::new(),
            key: "sk-test".into(),
            models: vec![],
            model_mapping: HashMap::new(),
            priority: 0,
            status: ChannelStatus::Enabled,
            sets: vec![],
            config: None,
            used_amount: 0.0,
            request_count: 0,
            retry_count: 0,
            balance: 0.0,
            balance_updated_at: None,
            last_test_error_at: None,
        });
        Self::new(
            "test-request".into(),
            mode,
            "test-group".into(),
            "test-token".into(),
            "test-model".into(),
            channel,
        )
    }
}
