//! Declared models and their price structure

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::mode::Mode;

/// Per-token prices. Images are priced through the per-image tables
/// instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    #[serde(default)]
    pub input_per_token: f64,
    #[serde(default)]
    pub output_per_token: f64,
}

/// A declared model: name, mode, owner, prices, caps, and free-form
/// capability config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub price: Price,
    /// map[size] -> price per image
    #[serde(default)]
    pub image_prices: HashMap<String, f64>,
    /// map[size] -> map[quality] -> price per image
    #[serde(default)]
    pub image_quality_prices: HashMap<String, HashMap<String, f64>>,
    /// Requests per rolling minute, 0 = uncapped
    #[serde(default)]
    pub rpm: i64,
    /// Tokens per rolling minute, 0 = uncapped
    #[serde(default)]
    pub tpm: i64,
    /// Vision, tool choice, max context/input/output tokens, voices,
    /// formats; interpreted by adaptors and the dashboard only
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Plugin config map, keyed by plugin name
    #[serde(default)]
    pub plugin: HashMap<String, serde_json::Value>,
}

impl ModelConfig {
    /// Price of one generated image for the requested size and quality.
    /// Quality tables win over plain size tables when both match.
    pub fn image_price(&self, size: &str, quality: Option<&str>) -> Option<f64> {
        if let Some(quality) = quality {
            if let Some(by_quality) = self.image_quality_prices.get(size) {
                if let Some(price) = by_quality.get(quality) {
                    return Some(*price);
                }
            }
        }
        self.image_prices.get(size).copied()
    }

    /// Plugins whose config carries `"enable": true`.
    pub fn enabled_plugins(&self) -> Vec<&str> {
        self.plugin
            .iter()
            .filter(|(_, cfg)| {
                cfg.get("enable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quality_table_wins_over_size_table() {
        let mut mc = ModelConfig {
            model: "img".into(),
            mode: Mode::ImagesGenerations,
            ..Default::default()
        };
        mc.image_prices.insert("1024x1024".into(), 0.04);
        mc.image_quality_prices.insert(
            "1024x1024".into(),
            HashMap::from([("hd".to_string(), 0.08)]),
        );

        assert_eq!(mc.image_price("1024x1024", Some("hd")), Some(0.08));
        assert_eq!(mc.image_price("1024x1024", Some("standard")), Some(0.04));
        assert_eq!(mc.image_price("1024x1024", None), Some(0.04));
        assert_eq!(mc.image_price("512x512", None), None);
    }

    #[test]
    fn enabled_plugins_filters_on_enable_flag() {
        let mc = ModelConfig {
            model: "m".into(),
            plugin: HashMap::from([
                ("web-search".to_string(), json!({"enable": true})),
                ("cache".to_string(), json!({"enable": false})),
                ("broken".to_string(), json!({})),
            ]),
            ..Default::default()
        };
        let enabled = mc.enabled_plugins();
        assert_eq!(enabled, vec!["web-search"]);
    }
}
