//! HTTP Server configuration and startup.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use gateway_types::GatewayStore;

use super::handlers::{self, AppState};
use crate::PaymentEngine;

/// HTTP Server for the payments API.
pub struct HttpServer<S: GatewayStore> {
    state: Arc<AppState<S>>,
}

impl<S: GatewayStore> HttpServer<S> {
    /// Creates a new HTTP server around the engine.
    pub fn new(engine: PaymentEngine<S>) -> Self {
        Self {
            state: Arc::new(AppState { engine }),
        }
    }

    /// Builds the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/api/payments", post(handlers::submit_payment::<S>))
            .route("/api/payments/{id}", get(handlers::get_payment::<S>))
            .route(
                "/api/payments/{id}/capture",
                post(handlers::capture_payment::<S>),
            )
            .route("/api/payments/{id}/void", post(handlers::void_payment::<S>))
            .route(
                "/api/payments/{id}/refund",
                post(handlers::refund_payment::<S>),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Runs the server on the given address until `shutdown` resolves.
    pub async fn run<F>(self, addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
