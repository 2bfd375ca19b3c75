//! HTTP binding (feature-gated): reverse-proxy fallback route, health and admin endpoints.

mod admin;
mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::dispatch::Dispatcher;
use crate::upstream::Upstream;

/// Application-scoped state, built once at startup and cloned into every handler.
#[derive(Clone)]
pub struct GatewayState {
    dispatcher: Arc<Dispatcher>,
    upstream: Arc<dyn Upstream>,
    admin_token: Option<Arc<str>>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("dispatcher", &self.dispatcher)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        upstream: Arc<dyn Upstream>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            upstream,
            admin_token: admin_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .map(Arc::from),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/quarantine/reset", post(admin::reset_quarantine))
        .fallback(proxy::handle_proxy)
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: GatewayState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
