//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::{AppState, VerifiedUser};

/// Middleware that verifies the bearer token and extracts the user id it was issued to.
///
/// If valid, inserts a `VerifiedUser` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Extract the bearer token
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // 2. Verify it with the identity provider
    let user_id = state.identity.verify(token).await.map_err(|e| {
        warn!("Failed to verify bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    // 3. Insert the verified subject into request extensions
    req.extensions_mut().insert(VerifiedUser(user_id));

    // 4. Continue to the handler
    Ok(next.run(req).await)
}
