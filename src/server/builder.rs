//! Server assembly: wire the singletons, start the sweeper, serve

use actix_web::{App, HttpServer, web};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::config::Config;
use crate::core::adaptor::{RelayStore, default_registry};
use crate::core::billing::InProcessGroupBalance;
use crate::core::cache::CacheHandle;
use crate::core::limiter::RateLimiter;
use crate::core::monitor::HealthMonitor;
use crate::core::relay::RelayContext;
use crate::server::{AppState, routes};
use crate::storage::Store;
use crate::utils::error::{GatewayError, Result};

pub async fn run_server(config: Config) -> Result<()> {
    let registry = Arc::new(default_registry());
    let monitor = Arc::new(HealthMonitor::new(config.monitor.clone()));
    let limiter = Arc::new(RateLimiter::new());
    let caches = CacheHandle::default();

    let store = Arc::new(
        Store::connect(
            &config.database,
            caches.clone(),
            monitor.clone(),
            registry.clone(),
        )
        .await?,
    );
    store.ensure_schema().await?;
    store.rebuild_caches().await?;

    let billing = Arc::new(InProcessGroupBalance::new(
        config.balance.default_group_balance,
    ));

    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;

    let relay = RelayContext {
        caches,
        registry,
        monitor: monitor.clone(),
        limiter,
        billing,
        store: store.clone() as Arc<dyn RelayStore>,
        client,
        config: config.relay.clone(),
    };

    // TTL eviction for idle health records
    {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                monitor.sweep();
            }
        });
    }

    let bind = (config.server.host.clone(), config.server.port);
    let state = AppState {
        config: Arc::new(config),
        store,
        relay,
    };

    info!("gateway listening on {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(bind)
    .map_err(|e| GatewayError::Internal(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| GatewayError::Internal(format!("server: {e}")))
}
