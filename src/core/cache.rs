//! Model/channel cache snapshot
//!
//! Single writer, many readers. The CRUD path rebuilds the whole snapshot
//! and publishes it with an atomic pointer swap; a request clones the Arc
//! once and keeps the same candidate set for its entire retry loop.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::model::{Channel, ChannelStatus, Group, ModelConfig};

type ChannelsBySetModel = HashMap<String, HashMap<String, Vec<Arc<Channel>>>>;

/// One immutable snapshot of the channel/model/group tables.
#[derive(Debug, Default)]
pub struct ModelCaches {
    /// set -> model -> enabled channels declaring that model
    pub enabled_model_channels_by_set: ChannelsBySetModel,
    /// set -> model -> disabled channels (still addressable by id)
    pub disabled_model_channels_by_set: ChannelsBySetModel,
    pub model_configs: HashMap<String, Arc<ModelConfig>>,
    pub groups: HashMap<String, Arc<Group>>,
}

impl ModelCaches {
    pub fn build(
        channels: Vec<Channel>,
        model_configs: Vec<ModelConfig>,
        groups: Vec<Group>,
    ) -> Self {
        let mut enabled: ChannelsBySetModel = HashMap::new();
        let mut disabled: ChannelsBySetModel = HashMap::new();

        for channel in channels {
            let index = match channel.status {
                ChannelStatus::Enabled => &mut enabled,
                _ => &mut disabled,
            };
            let channel = Arc::new(channel);
            for set in channel.effective_sets() {
                let by_model = index.entry(set).or_default();
                for model in &channel.models {
                    by_model
                        .entry(model.clone())
                        .or_default()
                        .push(channel.clone());
                }
            }
        }

        Self {
            enabled_model_channels_by_set: enabled,
            disabled_model_channels_by_set: disabled,
            model_configs: model_configs
                .into_iter()
                .map(|mc| (mc.model.clone(), Arc::new(mc)))
                .collect(),
            groups: groups
                .into_iter()
                .map(|g| (g.id.clone(), Arc::new(g)))
                .collect(),
        }
    }

    /// Enabled channels for `model` across the given sets, deduplicated
    /// by channel id. Empty `sets` means all sets.
    pub fn enabled_channels(&self, sets: &[String], model: &str) -> Vec<Arc<Channel>> {
        let mut by_id: HashMap<i32, Arc<Channel>> = HashMap::new();

        if sets.is_empty() {
            for by_model in self.enabled_model_channels_by_set.values() {
                if let Some(channels) = by_model.get(model) {
                    for channel in channels {
                        by_id.insert(channel.id, channel.clone());
                    }
                }
            }
        } else {
            for set in sets {
                if let Some(channels) = self
                    .enabled_model_channels_by_set
                    .get(set)
                    .and_then(|by_model| by_model.get(model))
                {
                    for channel in channels {
                        by_id.insert(channel.id, channel.clone());
                    }
                }
            }
        }

        let mut channels: Vec<_> = by_id.into_values().collect();
        // iteration order of the id map is arbitrary; keep selection
        // deterministic given the same RNG state
        channels.sort_by_key(|c| c.id);
        channels
    }

    /// Find a channel by id for `model` in the given sets, searching the
    /// enabled index first and then the disabled one.
    pub fn find_channel(&self, sets: &[String], model: &str, id: i32) -> Option<Arc<Channel>> {
        for index in [
            &self.enabled_model_channels_by_set,
            &self.disabled_model_channels_by_set,
        ] {
            for set in sets {
                if let Some(channel) = index
                    .get(set)
                    .and_then(|by_model| by_model.get(model))
                    .and_then(|channels| channels.iter().find(|c| c.id == id))
                {
                    return Some(channel.clone());
                }
            }
        }
        None
    }

    pub fn model_config(&self, model: &str) -> Option<Arc<ModelConfig>> {
        self.model_configs.get(model).cloned()
    }

    pub fn group(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.get(id).cloned()
    }
}

/// Shared handle to the current snapshot.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<ArcSwap<ModelCaches>>,
}

impl CacheHandle {
    pub fn new(caches: ModelCaches) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(caches)),
        }
    }

    /// Current snapshot. The returned Arc stays valid across concurrent
    /// rebuilds; hold it for the life of a request.
    pub fn load(&self) -> Arc<ModelCaches> {
        self.inner.load_full()
    }

    /// Publish a new snapshot.
    pub fn store(&self, caches: ModelCaches) {
        self.inner.store(Arc::new(caches));
    }
}

impl Default for CacheHandle {
    fn default() -> Self {
        Self::new(ModelCaches::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ChannelType;
    use std::collections::HashMap as Map;

    fn channel(id: i32, status: ChannelStatus, sets: Vec<String>, models: Vec<&str>) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            channel_type: ChannelType::OpenAI,
            base_url: String::new(),
            key: "sk".into(),
            models: models.into_iter().map(String::from).collect(),
            model_mapping: Map::new(),
            priority: 0,
            status,
            sets,
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
    fn enabled_channels_only_in_enabled_index() {
        let caches = ModelCaches::build(
            vec![
                channel(1, ChannelStatus::Enabled, vec![], vec!["m"]),
                channel(2, ChannelStatus::Disabled, vec![], vec!["m"]),
            ],
            vec![],
            vec![],
        );
        let enabled = caches.enabled_channels(&["default".to_string()], "m");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, 1);
        // the disabled channel remains addressable by id
        assert!(
            caches
                .find_channel(&["default".to_string()], "m", 2)
                .is_some()
        );
    }

    #[test]
    fn set_membership_scopes_lookups() {
        let caches = ModelCaches::build(
            vec![
                channel(1, ChannelStatus::Enabled, vec!["vip".into()], vec!["m"]),
                channel(2, ChannelStatus::Enabled, vec![], vec!["m"]),
            ],
            vec![],
            vec![],
        );
        let vip = caches.enabled_channels(&["vip".to_string()], "m");
        assert_eq!(vip.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1]);

        let all = caches.enabled_channels(&[], "m");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn snapshot_is_isolated_from_rebuild() {
        let handle = CacheHandle::new(ModelCaches::build(
            vec![channel(1, ChannelStatus::Enabled, vec![], vec!["m"])],
            vec![],
            vec![],
        ));

        let held = handle.load();
        handle.store(ModelCaches::build(vec![], vec![], vec![]));

        // the held snapshot still sees the old candidate set
        assert_eq!(held.enabled_channels(&[], "m").len(), 1);
        assert_eq!(handle.load().enabled_channels(&[], "m").len(), 0);
    }
}
