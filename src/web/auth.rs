//! Shared-secret authentication middleware.
//!
//! Every request must carry the configured key in the `x-api-key` header.
//! Fail-closed: an absent or empty configured key rejects all requests,
//! never "auth disabled".

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.config.api_key.as_str();
    if expected.is_empty() {
        warn!("[Auth] no API key configured, rejecting request");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if presented == expected {
        Ok(next.run(request).await)
    } else {
        warn!("[Auth] missing or invalid API key");
        Err(StatusCode::UNAUTHORIZED)
    }
}
