//! Adaptor registry
//!
//! Process-wide map from channel-type tag to adaptor instance, populated
//! at startup. Unknown types fail closed: the channel is invisible to
//! the selector.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::adaptor::{
    Adaptor, Balancer, KeyValidator, ali::AliAdaptor, baiduv2::BaiduV2Adaptor,
    doubao_audio::DoubaoAudioAdaptor, minimax::MinimaxAdaptor, moonshot::MoonshotAdaptor,
    openai::OpenAIAdaptor, siliconflow::SiliconFlowAdaptor,
};
use crate::core::mode::Mode;
use crate::core::model::{Channel, ChannelType};

/// One registered adaptor plus its optional side capabilities.
#[derive(Clone)]
pub struct RegisteredAdaptor {
    pub adaptor: Arc<dyn Adaptor>,
    pub key_validator: Option<Arc<dyn KeyValidator>>,
    pub balancer: Option<Arc<dyn Balancer>>,
}

impl RegisteredAdaptor {
    fn new(adaptor: Arc<dyn Adaptor>) -> Self {
        Self {
            adaptor,
            key_validator: None,
            balancer: None,
        }
    }

    fn with_key_validator(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.key_validator = Some(validator);
        self
    }

    fn with_balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }
}

#[derive(Default)]
pub struct AdaptorRegistry {
    entries: HashMap<ChannelType, RegisteredAdaptor>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel_type: ChannelType, entry: RegisteredAdaptor) {
        self.entries.insert(channel_type, entry);
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<&RegisteredAdaptor> {
        self.entries.get(&channel_type)
    }

    pub fn adaptor(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.entries.get(&channel_type).map(|e| e.adaptor.clone())
    }

    /// Whether `channel` can serve `mode`: its type must be registered
    /// and the adaptor must opt in.
    pub fn channel_supports(&self, channel: &Channel, mode: Mode) -> bool {
        self.adaptor(channel.channel_type)
            .map(|a| a.supports(mode))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelType, &RegisteredAdaptor)> {
        self.entries.iter()
    }
}

/// The registry with every built-in adaptor.
pub fn default_registry() -> AdaptorRegistry {
    let mut registry = AdaptorRegistry::new();
    registry.register(
        ChannelType::OpenAI,
        RegisteredAdaptor::new(Arc::new(OpenAIAdaptor)),
    );
    registry.register(
        ChannelType::Ali,
        RegisteredAdaptor::new(Arc::new(AliAdaptor)),
    );
    registry.register(
        ChannelType::BaiduV2,
        RegisteredAdaptor::new(Arc::new(BaiduV2Adaptor))
            .with_key_validator(Arc::new(BaiduV2Adaptor)),
    );
    registry.register(
        ChannelType::Minimax,
        RegisteredAdaptor::new(Arc::new(MinimaxAdaptor))
            .with_key_validator(Arc::new(MinimaxAdaptor)),
    );
    registry.register(
        ChannelType::DoubaoAudio,
        RegisteredAdaptor::new(Arc::new(DoubaoAudioAdaptor))
            .with_key_validator(Arc::new(DoubaoAudioAdaptor)),
    );
    registry.register(
        ChannelType::Moonshot,
        RegisteredAdaptor::new(Arc::new(MoonshotAdaptor))
            .with_balancer(Arc::new(MoonshotAdaptor)),
    );
    registry.register(
        ChannelType::SiliconFlow,
        RegisteredAdaptor::new(Arc::new(SiliconFlowAdaptor))
            .with_balancer(Arc::new(SiliconFlowAdaptor)),
    );
    registry
}
