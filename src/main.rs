//! Paigeant monitor - workflow status API
//!
//! Serves a read-only HTTP view over the configured workflow repository so
//! operators can watch workflows progress through their routing slips.
//!
//! ## Endpoints
//!
//! - `GET /healthz` - health check
//! - `GET /workflows` - list persisted workflows
//! - `GET /workflows/:correlation_id` - one workflow with step history

use axum::{routing::get, Router};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paigeant::config::Config;
use paigeant::handlers::{
    get_workflow_handler, health_handler, list_workflows_handler, MonitorState,
};
use paigeant::persistence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paigeant=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let bind_addr = config.bind_addr();

    info!("Starting paigeant monitor");
    info!(
        "Database: {}",
        config.database_url.as_deref().unwrap_or("in-memory")
    );
    info!("Binding to: {}", bind_addr);

    let repository = persistence::connect(config.database_url.as_deref()).await?;
    let state = MonitorState { repository };

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/workflows", get(list_workflows_handler))
        .route("/workflows/:correlation_id", get(get_workflow_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Monitor listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Paigeant monitor shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
