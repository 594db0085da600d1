//! Bridge Worker Service
//!
//! Serves the `player` resource over the RPC bridge.
//!
//! ## Architecture
//!
//! ```text
//! Redis Streams (player-get-all, player-insert, ...)
//!   ↓ (Consumer Group: bridge_workers)
//! Subscription per queue → DeliveryHandler
//!   ↓ (idempotency claim, result cache)
//! PlayerOperation → PlayerService<InMemoryPlayerRepository>
//!   ↓
//! Redis Stream (bridge.results:result)
//! ```

use axum::Router;
use core_config::{Environment, FromEnv, redis::RedisConfig};
use domain_players::{InMemoryPlayerRepository, PlayerOperation, PlayerService};
use eyre::{Result, WrapErr};
use rpc_bridge::{
    Bootstrap, BridgeContext, BridgeSettings, HealthState, ReaderConnections, RedisCache,
    RedisStreamBroker, connect_with_retry, default_connect_policy, health_router, init_metrics,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start the health and admin HTTP server
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the bridge worker
///
/// 1. Sets up structured logging and Prometheus metrics
/// 2. Loads bridge and Redis settings from the environment
/// 3. Connects to Redis with retry: one manager for broker commands, one for
///    the cache, and a reader per queue for blocking reads
/// 4. Starts one subscription per queue, in waves
/// 5. Drains on SIGINT/SIGTERM
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(name = APP_NAME, version = APP_VERSION, "Starting bridge worker");
    info!("Environment: {:?}", environment);

    let settings = BridgeSettings::from_env().wrap_err("Failed to load bridge configuration")?;
    info!(
        consumer_group = %settings.consumer_group,
        consumer_id = %settings.consumer_id,
        resources = ?settings.resources,
        read_concurrency = settings.read_concurrency,
        write_concurrency = settings.write_concurrency,
        "Bridge configuration loaded"
    );

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let commands = connect_with_retry(&redis_config, &default_connect_policy())
        .await
        .wrap_err("Failed to connect to Redis")?;
    let cache = connect_with_retry(&redis_config, &default_connect_policy())
        .await
        .wrap_err("Failed to connect the cache to Redis")?;
    let readers = ReaderConnections::new(&redis_config, settings.read_response_timeout)
        .wrap_err("Failed to configure Redis readers")?;

    let broker = Arc::new(RedisStreamBroker::new(
        commands,
        readers,
        &settings.consumer_group,
        &settings.consumer_id,
    ));
    let store = Arc::new(RedisCache::new(cache));
    let context = BridgeContext::new(broker.clone(), store.clone(), &settings);

    let repository = InMemoryPlayerRepository::new(settings.backend_pool_size);
    let players = Arc::new(PlayerOperation::new(PlayerService::new(repository)));

    let running = Bootstrap::new(context, settings.clone())
        .with_operation(players)
        .start()
        .await
        .wrap_err("Failed to start subscriptions")?;
    info!(subscriptions = running.len(), "Bridge started");

    let health_state = HealthState::new(broker, store, APP_NAME, APP_VERSION)
        .with_subscriptions(running.status_receivers());
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    shutdown_signal().await;

    let summary = running.shutdown().await;
    if summary.failed > 0 || summary.aborted > 0 {
        warn!(
            failed = summary.failed,
            aborted = summary.aborted,
            "Bridge stopped with unhealthy subscriptions"
        );
    }
    info!(stopped = summary.stopped, "Bridge worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
///
/// A handler that fails to install never fires; the other one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
