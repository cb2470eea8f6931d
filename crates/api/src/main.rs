//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::Config;
use messaging::{AmqpConnector, ConnectionManager, ReliablePublisher, TopologyManager};
use saga::{PostgresSagaStore, SagaCoordinator};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Connect to PostgreSQL and apply migrations
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to PostgreSQL");
    let store = PostgresSagaStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");

    // 4. Declare the broker topology; the connection itself is best effort
    let connector = AmqpConnector::new(config.broker.clone());
    let connections = ConnectionManager::new(Arc::new(connector));
    let topology = TopologyManager::new(connections.clone(), config.topology.clone())
        .ensure_topology()
        .await
        .expect("failed to declare broker topology");
    if let Err(err) = connections.init().await {
        tracing::warn!(error = %err, "broker connection not ready, will retry on first use");
    }

    // 5. Build the saga and the application state
    let publisher =
        ReliablePublisher::new(connections.clone(), &topology, config.publisher.clone());
    let coordinator =
        SagaCoordinator::new(store, publisher.clone(), &topology, config.saga.clone());
    let state = Arc::new(AppState::new(
        coordinator,
        connections.clone(),
        config.service_name.clone(),
    ));

    // 6. Start consumers and the expiry sweep
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers =
        api::workers::spawn_workers(&state, &config, &topology, publisher, &shutdown_rx)
            .expect("failed to start consumers");

    // 7. Serve until a shutdown signal arrives
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 8. Stop consumers, then close the broker connection
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "worker task failed");
        }
    }
    connections.close().await;

    tracing::info!("server shut down gracefully");
}
