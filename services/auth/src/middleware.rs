//! Middleware for session token validation
//!
//! Verifies the bearer token, refreshes the volatile OAuth fields when
//! the provider access token is close to expiry, and stores the claims
//! in the request extensions for the handlers.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::warn;

use crate::AppState;

/// Extract and validate the session token from the Authorization header
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state
        .jwt_service
        .decode_session(bearer.token())
        .map_err(|e| {
            warn!("Rejected session token: {e:#}");
            StatusCode::UNAUTHORIZED
        })?;

    // Provider access tokens expire independently of the session; top
    // them up here so handlers always see usable claims
    let claims = state
        .issuer
        .refreshed_claims(claims, &state.oauth_manager)
        .await;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
