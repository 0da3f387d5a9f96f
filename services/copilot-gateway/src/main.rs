//! Copilot gateway
//!
//! Single-binary service that:
//! 1. Resolves a pool of GitHub credentials (inline list, file, single token,
//!    or device-flow login)
//! 2. Exchanges the active credential for a Copilot session token and keeps
//!    it refreshed
//! 3. Serves OpenAI-style chat completions, embeddings and model listing,
//!    translating to and from the Copilot backend
//! 4. Rotates to the next credential when the backend answers 429

mod admin;
mod approval;
mod config;
mod error;
mod gateway;
mod metrics;
mod pipeline;
mod rate_limit;
mod service;
mod state;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::approval::{Approver, StdinApprover};
use crate::config::Config;
use crate::error::GatewayError;
use crate::pipeline::Pipeline;
use crate::service::{ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event};

/// Largest caller body accepted; image parts arrive inline as data URLs.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

impl AppState {
    /// Count, time and render one handler outcome.
    fn finish(
        &self,
        endpoint: &str,
        request_id: &str,
        started: Instant,
        result: Result<Response, GatewayError>,
    ) -> Response {
        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::record_upstream_error(e.metric_label());
                warn!(request_id, endpoint, error = %e, "request failed");
                e.into_response()
            }
        };
        let status = response.status();
        self.metrics
            .record(status.is_client_error() || status.is_server_error());
        metrics::record_request(status.as_u16(), endpoint, started.elapsed().as_secs_f64());
        if let Ok(v) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert("x-request-id", v);
        }
        response
    }
}

/// Build the axum router with all routes and shared state.
///
/// Every API route is served both unprefixed and under `/v1`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .route("/embeddings", post(embeddings_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        .route("/models", get(models_handler))
        .route("/v1/models", get(models_handler))
        .route("/usage", get(usage_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting copilot-gateway");

    // CLI: `--config <path>` and `--login`
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let login_only = args.iter().any(|a| a == "--login");

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if login_only {
        gateway::login(&config)
            .await
            .context("device-flow login failed")?;
        return Ok(());
    }

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // --- State: Initializing ---
    let approver: Option<Arc<dyn Approver>> = if config.copilot.manual_approval {
        Some(Arc::new(StdinApprover::new()))
    } else {
        None
    };
    let handle = gateway::initialize(&config, approver)
        .await
        .context("gateway initialization failed")?;

    let (mut state, action) = handle_event(
        ServiceState::Initializing,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
        },
    );
    info!(?action, "state: Authenticating");

    // Authenticate with retry per the state machine
    let listen_addr = loop {
        let event = match handle.authenticate().await {
            Ok(()) => ServiceEvent::Authenticated,
            Err(e) => ServiceEvent::AuthFailed {
                transient: e.is_transient(),
                error: e.to_string(),
            },
        };
        let (new_state, action) = handle_event(state, event);
        state = new_state;
        match action {
            ServiceAction::StartListener { addr } => break addr,
            ServiceAction::ScheduleRetry { delay } => {
                warn!(
                    ?state,
                    retry_in_secs = delay.as_secs(),
                    "session exchange failed, retrying"
                );
                tokio::time::sleep(delay).await;
                let (new_state, _) = handle_event(state, ServiceEvent::RetryTimer);
                state = new_state;
            }
            ServiceAction::Shutdown { exit_code } => {
                error!(?state, "session exchange failed, giving up");
                gateway::shutdown(&handle).await;
                std::process::exit(exit_code);
            }
            other => anyhow::bail!("unexpected action while authenticating: {other:?}"),
        }
    };
    info!("state: Starting");

    let app_state = AppState {
        pipeline: handle.pipeline.clone(),
        metrics: ServiceMetrics::new(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state.clone(), config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let admin_task = match config.server.admin_addr {
        Some(admin_addr) => {
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
            let admin_app =
                admin::build_admin_router(admin::AdminState::new(handle.pipeline.pool.clone()));
            info!(addr = %admin_addr, "admin API listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, admin_app).await {
                    error!(error = %e, "admin server error");
                }
            }))
        }
        None => None,
    };

    // Transition: Starting -> Running
    let (new_state, _) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let drain_timeout = match action {
        ServiceAction::Drain { timeout } => timeout,
        _ => service::DRAIN_TIMEOUT,
    };
    let _ = shutdown_tx.send(());

    let drain_event = match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };
    let (_state, _action) = handle_event(state, drain_event);

    if let Some(task) = admin_task {
        task.abort();
    }
    gateway::shutdown(&handle).await;

    info!(
        requests = app_state.metrics.requests_total.load(Ordering::Relaxed),
        "shutdown complete"
    );
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn parse_json(body: &Bytes) -> Result<serde_json::Value, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("request body is not valid JSON: {e}")))
}

async fn chat_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let result = match parse_json(&body) {
        Ok(body) => state.pipeline.chat_completions(body, &request_id).await,
        Err(e) => Err(e),
    };
    state.finish("chat_completions", &request_id, started, result)
}

async fn embeddings_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let result = match parse_json(&body) {
        Ok(body) => state.pipeline.embeddings(body, &request_id).await,
        Err(e) => Err(e),
    };
    state.finish("embeddings", &request_id, started, result)
}

async fn models_handler(State(state): State<AppState>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let result = state.pipeline.models(&request_id).await;
    state.finish("models", &request_id, started, result)
}

async fn usage_handler(State(state): State<AppState>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let result = state.pipeline.usage().await;
    state.finish("usage", &request_id, started, result)
}

/// Health: 200 while a session token is held, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pipeline = &state.pipeline;
    let session = pipeline.sessions.current().await;
    let pool = pipeline.pool.status_snapshot().await;
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let (status_code, status) = match &session {
        Some(_) => (StatusCode::OK, "healthy"),
        None => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };
    let body = serde_json::json!({
        "status": status,
        "session_token": session.is_some(),
        "session_account": session.as_ref().map(|s| s.label.clone()),
        "account_type": pipeline.process.modes.account_type,
        "pool": pool,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
