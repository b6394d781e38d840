//! Process entry point: wires repositories, the engine, providers, the event
//! bus, and the HTTP surface together and runs until shutdown (§5, §6).

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use openspc::alerts::AlertManager;
use openspc::api::auth::RepositoryAuthVerifier;
use openspc::api::server::{ApiConfig, ApiServer};
use openspc::api::state::{AppState, RateLimiterState, ServerConfig};
use openspc::buffer::BufferManager;
use openspc::config::AppConfig;
use openspc::crypto::CredentialCipher;
use openspc::db::pool::build_pool;
use openspc::db::repositories::{
    PgApiKeyRepository, PgBrokerRepository, PgCharacteristicRepository, PgDataSourceRepository,
    PgHierarchyRepository, PgOpcUaServerRepository, PgRetentionRepository, PgSampleRepository,
    PgViolationRepository, PgWindowRepository,
};
use openspc::engine::SpcEngine;
use openspc::events::broadcaster::LiveBroadcaster;
use openspc::events::bus::EventBus;
use openspc::events::outbound::OutboundPublisher;
use openspc::providers::manual::ManualProvider;
use openspc::providers::mqtt::MqttTagProvider;
use openspc::providers::opcua::OpcUaProvider;
use openspc::retention::PurgeEngine;
use openspc::telemetry::{init_tracing, Metrics};
use openspc::window::manager::WindowManager;
use openspc::Result;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let cipher = CredentialCipher::from_key_file(&config.credential_encryption_key_path)?;
    let metrics = Arc::new(Metrics::new().expect("registering prometheus metrics never fails on a fresh registry"));

    let pool = Arc::new(build_pool(&config.database_url)?);

    let characteristics = Arc::new(PgCharacteristicRepository::new(pool.clone()));
    let samples = Arc::new(PgSampleRepository::new(pool.clone()));
    let violations = Arc::new(PgViolationRepository::new(pool.clone()));
    let hierarchy = Arc::new(PgHierarchyRepository::new(pool.clone()));
    let data_sources = Arc::new(PgDataSourceRepository::new(pool.clone()));
    let brokers = Arc::new(PgBrokerRepository::new(pool.clone()));
    let opcua_servers = Arc::new(PgOpcUaServerRepository::new(pool.clone()));
    let retention = Arc::new(PgRetentionRepository::new(pool.clone()));
    let api_keys = Arc::new(PgApiKeyRepository::new(pool.clone()));

    let window_repo = Arc::new(PgWindowRepository::new(samples.clone(), characteristics.clone()));
    let window_manager = Arc::new(WindowManager::new(config.lru_cache_size, config.window_size, window_repo));

    let event_bus = Arc::new(EventBus::new());
    let alert_manager = Arc::new(AlertManager::new(violations.clone()));

    let broadcaster = Arc::new(LiveBroadcaster::new(config.live_subscriber_ping_timeout()));
    event_bus.subscribe_sample_processed(broadcaster.clone()).await;
    event_bus.subscribe_control_limits_updated(broadcaster.clone()).await;
    alert_manager.register_notifier(broadcaster.clone()).await;

    let outbound = Arc::new(OutboundPublisher::new(
        brokers.clone(),
        hierarchy.clone(),
        cipher.clone(),
        config.outbound_topic_prefix.clone(),
    ));
    event_bus.subscribe_sample_processed(outbound.clone()).await;
    event_bus.subscribe_control_limits_updated(outbound.clone()).await;
    alert_manager.register_notifier(outbound.clone()).await;

    let engine = Arc::new(
        SpcEngine::new(
            characteristics.clone(),
            samples.clone(),
            window_manager.clone(),
            alert_manager.clone(),
            event_bus.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let manual = Arc::new(ManualProvider::new(characteristics.clone(), data_sources.clone()));

    let mqtt_buffers = Arc::new(BufferManager::new());
    let mqtt_provider = Arc::new(MqttTagProvider::new(
        data_sources.clone(),
        brokers.clone(),
        cipher.clone(),
        mqtt_buffers,
        engine.clone(),
    ));

    let opcua_buffers = Arc::new(BufferManager::new());
    let opcua_provider = Arc::new(OpcUaProvider::new(
        data_sources.clone(),
        opcua_servers.clone(),
        cipher.clone(),
        opcua_buffers,
        engine.clone(),
    ));

    let purge_engine = Arc::new(PurgeEngine::new(
        characteristics.clone(),
        hierarchy.clone(),
        retention.clone(),
        samples.clone(),
        violations.clone(),
        Duration::from_secs_f64(config.purge_interval_hours * 3600.0),
    ));

    let auth = Arc::new(RepositoryAuthVerifier::new(api_keys));

    let rate_limiter = Arc::new(RateLimiterState::new(600, Duration::from_secs(60)));
    let server_config = Arc::new(ServerConfig {
        rate_limit_rpm: 600,
        ..ServerConfig::default()
    });

    let state = AppState {
        engine: engine.clone(),
        alerts: alert_manager.clone(),
        manual,
        broadcaster: broadcaster.clone(),
        auth,
        config: server_config,
        rate_limiter,
        metrics: metrics.clone(),
    };

    if let Err(error) = outbound.start().await {
        tracing::error!(%error, "outbound_publisher_start_failed");
    }
    if let Err(error) = mqtt_provider.start(config.buffer_timeout()).await {
        tracing::error!(%error, "mqtt_provider_start_failed");
    }
    if let Err(error) = opcua_provider.start(config.buffer_timeout()).await {
        tracing::error!(%error, "opcua_provider_start_failed");
    }

    let mut background = Vec::new();

    background.push(tokio::spawn({
        let broadcaster = broadcaster.clone();
        async move { broadcaster.run_heartbeat(Duration::from_secs(30)).await }
    }));

    background.push(tokio::spawn({
        let outbound = outbound.clone();
        let interval = config.outbound_rate_limit_prune_interval();
        async move { outbound.run_rate_limit_pruner(interval).await }
    }));

    background.push(tokio::spawn({
        let purge_engine = purge_engine.clone();
        async move { purge_engine.run_loop().await }
    }));

    background.push(tokio::spawn({
        let mqtt_provider = mqtt_provider.clone();
        let interval = config.buffer_sweep_interval();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                mqtt_provider.sweep_timeouts().await;
            }
        }
    }));

    background.push(tokio::spawn({
        let opcua_provider = opcua_provider.clone();
        let interval = config.buffer_sweep_interval();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                opcua_provider.sweep_timeouts().await;
            }
        }
    }));

    let api_config = ApiConfig::from_listen_addr(&config.listen_addr)?;
    let api_server = ApiServer::new(api_config, state);

    api_server.run_until(shutdown_signal()).await?;

    for task in background {
        task.abort();
    }

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, whichever comes first (§5 "Shutdown
/// cancels all background tasks").
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
