//! HTTP server assembly (spec.md §6). Grounded on the teacher's
//! `web-api::server::ApiServer`, generalized from the bot-registry router
//! to the signal-store router and stripped of the bot-registry's
//! websocket/data-health routes this system has no counterpart for.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use hedge_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Shared state handed to every route.
pub struct ApiState {
    pub store: Arc<Store>,
    pub api_key: Option<String>,
}

/// HTTP server exposing the inbound signal API.
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    #[must_use]
    pub fn new(store: Arc<Store>, api_key: Option<String>) -> Self {
        Self { state: Arc::new(ApiState { store, api_key }) }
    }

    /// Builds the router with all signal API routes.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/signal", post(handlers::post_signal))
            .route("/api/signal/latest", get(handlers::latest_signal))
            .route("/api/signal/:market_start", get(handlers::signal_for_market))
            .route("/api/health", get(handlers::health))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Starts the web server listening on the specified address.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "signal API listening");

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
