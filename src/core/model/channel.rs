//! Channel: one credential-bearing endpoint of one upstream provider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Set every channel belongs to when none is configured
pub const DEFAULT_SET: &str = "default";

/// Priority used for weighting when the configured priority is zero
pub const DEFAULT_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ChannelStatus {
    Unknown,
    Enabled,
    Disabled,
}

impl From<ChannelStatus> for i32 {
    fn from(s: ChannelStatus) -> i32 {
        match s {
            ChannelStatus::Unknown => 0,
            ChannelStatus::Enabled => 1,
            ChannelStatus::Disabled => 2,
        }
    }
}

impl TryFrom<i32> for ChannelStatus {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ChannelStatus::Unknown),
            1 => Ok(ChannelStatus::Enabled),
            2 => Ok(ChannelStatus::Disabled),
            other => Err(format!("invalid channel status: {other}")),
        }
    }
}

/// Selects the adaptor implementation for a channel.
///
/// A closed enum with an integer wire form; unknown tags make the channel
/// invisible to the selector (fail closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ChannelType {
    Unknown,
    OpenAI,
    Ali,
    BaiduV2,
    Minimax,
    DoubaoAudio,
    Moonshot,
    SiliconFlow,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Unknown => "unknown",
            ChannelType::OpenAI => "openai",
            ChannelType::Ali => "ali",
            ChannelType::BaiduV2 => "baiduv2",
            ChannelType::Minimax => "minimax",
            ChannelType::DoubaoAudio => "doubaoaudio",
            ChannelType::Moonshot => "moonshot",
            ChannelType::SiliconFlow => "siliconflow",
        }
    }
}

impl From<ChannelType> for i32 {
    fn from(t: ChannelType) -> i32 {
        match t {
            ChannelType::Unknown => 0,
            ChannelType::OpenAI => 1,
            ChannelType::Ali => 2,
            ChannelType::BaiduV2 => 3,
            ChannelType::Minimax => 4,
            ChannelType::DoubaoAudio => 5,
            ChannelType::Moonshot => 6,
            ChannelType::SiliconFlow => 7,
        }
    }
}

impl TryFrom<i32> for ChannelType {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ChannelType::Unknown),
            1 => Ok(ChannelType::OpenAI),
            2 => Ok(ChannelType::Ali),
            3 => Ok(ChannelType::BaiduV2),
            4 => Ok(ChannelType::Minimax),
            5 => Ok(ChannelType::DoubaoAudio),
            6 => Ok(ChannelType::Moonshot),
            7 => Ok(ChannelType::SiliconFlow),
            other => Err(format!("invalid channel type: {other}")),
        }
    }
}

/// An upstream endpoint credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub base_url: String,
    /// Opaque credential; format is adaptor-specific and may be compound
    /// (`appid|token`, `ak|sk`, `apikey|groupid`)
    pub key: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// 0 means "use the default"
    #[serde(default)]
    pub priority: i32,
    pub status: ChannelStatus,
    #[serde(default)]
    pub sets: Vec<String>,
    /// Free-form spec blob interpreted by the adaptor
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub used_amount: f64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub balance_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_test_error_at: Option<DateTime<Utc>>,
}

impl Channel {
    /// Priority used for weighting: `max(1, configured)`, 0 meaning default.
    pub fn effective_priority(&self) -> i32 {
        if self.priority == 0 {
            DEFAULT_PRIORITY
        } else {
            self.priority.max(1)
        }
    }

    /// Sets this channel belongs to; empty configuration means the
    /// default set.
    pub fn effective_sets(&self) -> Vec<String> {
        if self.sets.is_empty() {
            vec![DEFAULT_SET.to_string()]
        } else {
            self.sets.clone()
        }
    }

    /// Apply the per-channel model-name remapping.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(priority: i32) -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            channel_type: ChannelType::OpenAI,
            base_url: String::new(),
            key: "sk-x".into(),
            models: vec!["m".into()],
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

    #[test]
    fn zero_priority_means_default() {
        assert_eq!(channel(0).effective_priority(), DEFAULT_PRIORITY);
        assert_eq!(channel(3).effective_priority(), 3);
        assert_eq!(channel(-5).effective_priority(), 1);
    }

    #[test]
    fn empty_sets_means_default_set() {
        assert_eq!(channel(0).effective_sets(), vec![DEFAULT_SET.to_string()]);
    }

    #[test]
    fn model_mapping_rewrites() {
        let mut c = channel(0);
        c.model_mapping
            .insert("gpt-alias".into(), "gpt-real".into());
        assert_eq!(c.map_model("gpt-alias"), "gpt-real");
        assert_eq!(c.map_model("other"), "other");
    }
}
