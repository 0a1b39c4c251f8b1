//! Application state shared across HTTP handlers

use std::sync::Arc;

use crate::config::Config;
use crate::core::relay::RelayContext;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub relay: RelayContext,
}
