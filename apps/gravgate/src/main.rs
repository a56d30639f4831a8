//! Process entry point: loads configuration, wires the Credential Pool,
//! Request Adapter, Usage Store and upstream client into a
//! [`RequestOrchestrator`], and serves the `/v1*` and panel surfaces behind
//! it (spec §6). The HTTP framing layer itself — routing table, static
//! files, the admin web UI — is peripheral (spec §1 Non-goals); this binary
//! only wires the minimum axum glue the core needs to be reachable.

mod cli;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gravgate_common::Config;
use gravgate_core::{PanelSessionStore, RequestOrchestrator};
use gravgate_credential::{CredentialPool, CredentialStore, OAuthClient};
use gravgate_storage::LogStore;
use gravgate_transform::RequestAdapter;
use gravgate_transform::image::LocalFileImageSink;

use crate::cli::Cli;
use crate::state::{AppState, PendingOAuth};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "fatal: missing or invalid configuration");
            std::process::exit(1);
        }
    };
    Cli::parse().apply_overrides(&mut config);

    if let Err(err) = run(config).await {
        tracing::error!(%err, "gateway exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let data_dir = std::path::PathBuf::from(&config.data_dir);

    let logs = Arc::new(
        LogStore::load(
            data_dir.join("logs.json"),
            config.max_log_items,
            config.log_retention_days.max(0) as u32,
        )
        .await?,
    );

    let credential_store = CredentialStore::new(data_dir.join("credentials.json"));
    let oauth_http = reqwest::Client::builder().user_agent("gravgate/0.2").build()?;
    let oauth = OAuthClient::new(oauth_http);
    let pool = Arc::new(CredentialPool::initialize(credential_store, oauth, logs.clone(), config.hourly_limit).await?);

    let adapter = Arc::new(RequestAdapter::new());
    let upstream = Arc::new(gravgate_core::UpstreamClient::new(
        Duration::from_secs(config.upstream_timeout_secs),
        config.retry_status_codes.clone(),
    )?);
    let images = Arc::new(LocalFileImageSink::new(&data_dir));

    let orchestrator = Arc::new(RequestOrchestrator::new(
        pool.clone(),
        adapter,
        logs.clone(),
        upstream,
        images,
        config.retry_max_attempts,
    ));

    let state = AppState {
        orchestrator,
        pool,
        logs,
        panel_sessions: Arc::new(PanelSessionStore::new()),
        pending_oauth: PendingOAuth::default(),
        api_key: config.api_key.clone(),
        panel_user: config.panel_user.clone(),
        panel_password: config.panel_password.clone(),
    };

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .merge(routes::gateway::router(state.clone()))
        .merge(routes::admin::router(state.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "gravgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Waits for `SIGINT`/`SIGTERM`; `axum::serve`'s graceful shutdown then stops
/// accepting new connections and waits for in-flight ones to finish, which
/// covers the spec's "stop accepting, drain, then exit" sequence short of
/// the hard 5s force-exit (`axum::serve` has no built-in deadline, so the
/// signal handler itself races a timer and forces the process down).
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
    tracing::info!("shutdown signal received, draining in-flight requests");

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracing::warn!("graceful shutdown exceeded 5s, forcing exit");
        std::process::exit(0);
    });
}
