mod routes;
mod state;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post, put},
    Router,
};
use server_manager::{JarDownloader, Settings, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => {
            let secs = raw
                .parse::<u64>()
                .with_context(|| format!("Invalid {}", key))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

fn settings_from_env() -> Result<Settings> {
    let mut settings = Settings::new(env_or("SERVERS_DIR", "./servers"));
    settings.java_path = env_or("JAVA_PATH", "java").into();
    settings.manager_url = env_or("MANAGER_URL", &settings.manager_url);
    if let Some(delay) = env_secs("LOCK_CLEANUP_DELAY_SECS")? {
        settings.lock_cleanup_delay = delay;
    }
    if let Some(delay) = env_secs("PROXY_RESTART_DELAY_SECS")? {
        settings.proxy_restart_delay = delay;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,server_manager=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let api_host = env_or("API_HOST", "127.0.0.1");
    let api_port = env_or("API_PORT", "3000")
        .parse::<u16>()
        .context("Invalid API_PORT")?;

    let settings = settings_from_env()?;
    let provider = Arc::new(JarDownloader::new(settings.jars_dir()));
    let supervisor = Supervisor::start(settings, provider)
        .await
        .context("Failed to start supervisor")?;

    let state = Arc::new(AppState::new(supervisor.clone()));

    let app = Router::new()
        // Servers
        .route(
            "/api/servers",
            get(routes::servers::list_servers).post(routes::servers::create_server),
        )
        .route(
            "/api/servers/:id",
            get(routes::servers::get_server).delete(routes::servers::delete_server),
        )
        .route("/api/servers/:id/start", post(routes::servers::start_server))
        .route("/api/servers/:id/stop", post(routes::servers::stop_server))
        .route("/api/servers/:id/command", post(routes::servers::send_command))
        .route("/api/servers/:id/logs", get(routes::servers::get_logs))
        .route(
            "/api/servers/:id/properties",
            get(routes::servers::get_properties).put(routes::servers::update_properties),
        )
        .route("/api/servers/:id/memory", put(routes::servers::update_memory))
        .route("/api/servers/:id/positions", post(routes::servers::update_positions))
        .route("/api/metrics", post(routes::servers::report_metrics))
        .route("/api/jars", get(routes::servers::list_jars))
        .route("/api/jars/:type/:version/status", get(routes::servers::build_status))
        // Backups
        .route(
            "/api/servers/:id/backup-config",
            get(routes::backups::get_backup_config).put(routes::backups::update_backup_config),
        )
        .route(
            "/api/servers/:id/backups",
            get(routes::backups::list_backups).post(routes::backups::create_backup),
        )
        .route(
            "/api/servers/:id/backups/:backup_id",
            axum::routing::delete(routes::backups::delete_backup),
        )
        // Portals
        .route(
            "/api/portals",
            get(routes::portals::list_portals).post(routes::portals::create_portal),
        )
        .route(
            "/api/portals/:id",
            put(routes::portals::update_portal).delete(routes::portals::delete_portal),
        )
        // Proxy
        .route(
            "/api/bungeecord/port",
            get(routes::proxy::get_port).put(routes::proxy::update_port),
        )
        // Push channel
        .route("/api/events", get(routes::events::events_handler))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state);

    let addr = format!("{}:{}", api_host, api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down servers");
    supervisor.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
