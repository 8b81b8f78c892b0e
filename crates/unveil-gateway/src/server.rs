//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

use unveil_core::config::UnveilConfig;
use unveil_scheduler::DispatchEngine;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    /// Secret the timer must present. Empty rejects every protected call.
    pub cron_secret: String,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        let cron_secret = engine.config().gateway.cron_secret.clone();
        Self {
            engine,
            cron_secret,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Pull the presented secret from `x-cron-secret` or a bearer token.
fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("x-cron-secret").and_then(|v| v.to_str().ok()) {
        return Some(v.trim());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare digests rather than the raw strings.
fn secret_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Shared-secret auth middleware for the timer and admin routes.
async fn require_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let authorized = !state.cron_secret.is_empty()
        && presented_secret(req.headers()).is_some_and(|s| secret_matches(s, &state.cron_secret));

    if authorized {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected {} {}: missing or invalid secret", req.method(), req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    // Protected routes — require the shared secret
    let protected = Router::new()
        .route("/api/v1/dispatch/run", post(super::routes::dispatch_run))
        .route("/api/v1/dispatch/sweep", post(super::routes::dispatch_sweep))
        .route("/api/v1/messages/send", post(super::routes::send_message))
        .route(
            "/api/v1/messages/{id}/deliveries",
            get(super::routes::message_deliveries),
        )
        .route(
            "/api/v1/jobs",
            get(super::routes::list_jobs).post(super::routes::create_job),
        )
        .route("/api/v1/jobs/{id}", get(super::routes::get_job))
        .route("/api/v1/jobs/{id}/cancel", post(super::routes::cancel_job))
        .route(
            "/api/v1/jobs/{id}/reschedule",
            post(super::routes::reschedule_job),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_secret,
        ));

    // Public routes — no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: UnveilConfig) -> anyhow::Result<()> {
    if config.gateway.cron_secret.is_empty() {
        tracing::warn!("⚠️ gateway.cron_secret is empty; all protected routes will return 401");
    }
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let engine = DispatchEngine::from_config(config)?;
    tracing::info!(
        "💾 Dispatch database: {}",
        engine.config().database_path().display()
    );
    let app = build_router(AppState::new(Arc::new(engine)));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
