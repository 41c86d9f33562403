mod hostinfo;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rc_action::ActionGateway;
use rc_config::AppConfig;
use rc_probe::ProbeRunner;
use rc_schemas::ProbeDefinition;
use rc_scheduler::Scheduler;
use rc_store::Store;
use state::AppState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::from_filename(".env.local").ok();
    init_tracing();

    let config = Arc::new(AppConfig::from_env().context("loading configuration")?);
    let store = Arc::new(Store::open(&config.db_path).await.context("opening store")?);
    let runner = Arc::new(ProbeRunner::new());

    let desired: Vec<ProbeDefinition> = config
        .document
        .scheduled_probes
        .iter()
        .cloned()
        .map(ProbeDefinition::from)
        .collect();
    store
        .sync_probe_definitions(&desired)
        .await
        .context("syncing probe definitions from config")?;

    let scheduler = Scheduler::new(store.clone(), runner.clone(), config.probe_tick_seconds);
    let (scheduler_handle, scheduler_token) = scheduler.spawn();

    let gateway = ActionGateway::via_helper(config.helper_socket_path.clone());
    let app_state = Arc::new(AppState::new(config.clone(), store.clone(), runner.clone(), gateway));

    let app = routes::build_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_localhost_only());

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("parsing bind address {}", config.bind_addr()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(%addr, "rc-daemon listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    rc_scheduler::shutdown(scheduler_token, scheduler_handle).await;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cors_localhost_only() -> CorsLayer {
    CorsLayer::new()
        .allow_origin([
            "http://127.0.0.1".parse().unwrap(),
            "http://localhost".parse().unwrap(),
        ])
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    tracing::info!("shutdown signal received");
}
