//! Azure provider extension.
//!
//! Runs the infrastructure, worker, bastion, backup, DNS and control plane
//! controllers, and serves health endpoints for the kubelet probes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use azure_controller::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use azure_controller::runner;
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "azure-extension", version, about = "Gardener provider extension for Azure")]
struct Args {
    /// Controller configuration file.
    #[arg(long, env = "CONTROLLER_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Only watch namespaced resources in this namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Overrides the health port of the configuration.
    #[arg(long, env = "HEALTH_PORT")]
    health_port: Option<u16>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    info!(
        "Starting Azure provider extension v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_controller_config(&args.config);
    if let Some(port) = args.health_port {
        config.health.port = port;
    }
    config.validate().context("invalid controller configuration")?;
    let port = config.health.port;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let controllers = tokio::spawn(runner::run(
        client,
        config,
        args.namespace,
        shutdown.clone(),
    ));

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health port {port}"))?;
    info!(port, "Health server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    match controllers.await {
        Ok(Ok(())) => info!("Azure provider extension stopped"),
        Ok(Err(err)) => {
            error!(error = %err, "Controllers failed");
            return Err(err.into());
        }
        Err(err) => {
            error!(error = %err, "Controller task panicked");
            return Err(err.into());
        }
    }
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(
    State(shutdown): State<CancellationToken>,
) -> Result<Json<Value>, StatusCode> {
    if shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({ "status": "ready" })))
}

fn load_controller_config(path: &std::path::Path) -> ControllerConfig {
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        return ControllerConfig::default();
    }
    match ControllerConfig::from_mounted_file(&path.to_string_lossy()) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded controller configuration");
            config
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to load configuration, using defaults");
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
