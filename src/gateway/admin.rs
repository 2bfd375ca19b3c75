use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::info;

use super::GatewayState;
use crate::forward::header_value;

pub(super) async fn health(State(state): State<GatewayState>) -> Response {
    let stats = state.dispatcher.balancer().stats();
    Json(json!({
        "status": "ok",
        "available_credentials": stats.available_count,
        "total_credentials": stats.total_count,
    }))
    .into_response()
}

pub(super) async fn stats(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    Json(state.dispatcher.stats()).into_response()
}

pub(super) async fn reset_quarantine(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    state.dispatcher.balancer().reset_quarantine();
    let stats = state.dispatcher.stats();
    info!(
        available = stats.balancer.available_count,
        "quarantine reset by admin request"
    );
    Json(stats).into_response()
}

fn ensure_admin(state: &GatewayState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(admin_error(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| header_value(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(admin_error(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = header_value(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn admin_error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}
