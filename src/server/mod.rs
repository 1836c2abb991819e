//! HTTP server module
//!
//! Provides the Axum-based status server: health, status counters and a
//! pull endpoint draining the dimensional metrics store.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use axum::{routing::get, Router};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::context::CollectorContext;
use crate::runner::HarvestSummary;
use crate::transformer::PayloadFormatter;

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    /// Collector context the harvest loop writes into
    pub ctx: Arc<CollectorContext>,
    /// Formatter for JSON responses
    pub formatter: PayloadFormatter,
    /// Summary of the most recent harvest cycle
    pub last_harvest: Arc<RwLock<Option<HarvestSummary>>>,
}

impl AppState {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self {
            ctx,
            formatter: PayloadFormatter::new(),
            last_harvest: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_formatter(mut self, formatter: PayloadFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Record the outcome of a harvest cycle
    pub fn set_last_harvest(&self, summary: HarvestSummary) {
        *self
            .last_harvest
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(summary);
    }

    pub fn last_harvest(&self) -> Option<HarvestSummary> {
        self.last_harvest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server
///
/// # Arguments
/// * `state` - Shared state, usually also handed to the harvest loop
/// * `port` - Server port to bind to
///
/// # Errors
/// Returns an error if the server fails to start
pub async fn run(state: AppState, port: u16) -> Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(address = %addr, "Server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_serves_health() {
        let app = router(AppState::new(Arc::new(CollectorContext::new())));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        let resp = reqwest::get(format!("http://{}/missing", addr)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
