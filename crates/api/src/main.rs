use std::net::SocketAddr;
use std::sync::Arc;

use genorch_comfyui::pool::ServerPool;
use genorch_db::{InMemoryJobStore, JobStore, PgJobStore};
use genorch_pipeline::monitor::QueueMonitor;
use genorch_pipeline::service::JobService;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genorch_api::config::ServerConfig;
use genorch_api::router::build_app_router;
use genorch_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "genorch_api=debug,genorch_pipeline=debug,genorch_comfyui=info,tower_http=info"
                    .into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().unwrap_or_else(|e| panic!("Invalid configuration: {e}"));
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Job store ---
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            let pool = genorch_db::create_pool(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            genorch_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            genorch_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            Arc::new(PgJobStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(InMemoryJobStore::new())
        }
    };

    // --- Backends ---
    let orchestrator = &config.orchestrator;
    let pool = ServerPool::new(orchestrator.descriptors(), orchestrator.pool_settings())
        .expect("Invalid backend configuration");
    if pool.is_empty() {
        tracing::warn!("No ComfyUI backends configured, jobs will stay pending");
    }
    for backend in pool.descriptors() {
        tracing::info!(
            backend_id = %backend.id,
            url = %backend.base_url,
            priority = backend.priority,
            "Registered backend",
        );
    }
    let pool = Arc::new(pool);
    pool.check_health().await;

    // --- Queue monitor ---
    let monitor = Arc::new(QueueMonitor::new(
        Arc::clone(&store),
        pool,
        orchestrator.monitor_settings(),
    ));
    monitor.start().await;

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        service: JobService::new(store, Arc::clone(&monitor)),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping queue monitor");
    monitor.stop().await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
