use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    routing::on,
};
use serde_json::Value;

use crate::config::WebhookRoute;
use crate::errors::{ConfigError, WebhookError};
use crate::resolver::{Resolver, detect_project};
use crate::sync::ProjectSync;
use crate::verify::WebhookVerifier;

/// Largest accepted webhook body; anything bigger is answered with 413.
pub const MAX_BODY_BYTES: usize = 1_000_000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub resolver: Resolver,
    pub sync: Arc<dyn ProjectSync>,
    pub verifier: Arc<dyn WebhookVerifier>,
}

pub type SharedState = Arc<AppState>;

/// Address the listener binds to.
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Mount the single webhook route. Unknown paths fall through to axum's
/// default 404; a known path with the wrong method gets 405. Paths axum
/// would treat as captures are refused so the route stays literal.
pub fn build_router(route: &WebhookRoute, state: SharedState) -> Result<Router, ConfigError> {
    route.check_path()?;
    let filter = route.method_filter()?;
    Ok(Router::new()
        .route(&route.path, on(filter, handle_webhook))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state))
}

/// Accept a delivery, answer immediately, and process it in the background.
async fn handle_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, WebhookError> {
    state
        .verifier
        .verify(&headers, &body)
        .map_err(|reason| {
            tracing::warn!(%reason, "webhook rejected");
            WebhookError::Unauthorized(reason)
        })?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("malformed webhook body: {}", e);
        WebhookError::MalformedJson(e)
    })?;

    tracing::info!(bytes = body.len(), "webhook accepted");
    tokio::spawn(async move {
        dispatch(&state, &payload);
    });
    Ok("ok")
}

/// Resolve the payload's repository and start a sync for every matching
/// project. Returns how many syncs were started.
pub fn dispatch(state: &AppState, payload: &Value) -> usize {
    let Some(full_name) = detect_project(payload) else {
        tracing::warn!("webhook payload has no repository.full_name");
        return 0;
    };

    let projects = state.resolver.find_projects(&full_name);
    if projects.is_empty() {
        tracing::info!(repo = %full_name, "project not found");
        return 0;
    }

    let count = projects.len();
    for project in projects {
        let sync = state.sync.clone();
        tokio::spawn(async move {
            sync.sync(project).await;
        });
    }
    count
}

/// Bind and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig, app: Router) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("hookci listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
