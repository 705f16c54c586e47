//! Authentication service routes

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::AppState;
use crate::clock::Clock;
use crate::error::AuthError;
use crate::models::{Account, MfaMethod, SessionClaims};
use crate::oauth::{OAuthProvider, OAuthSession};
use crate::session::LoginOutcome;
use crate::validation::validate_email;

/// Authorization sessions are abandoned after this many seconds
const OAUTH_SESSION_TTL: u64 = 600;

/// Request for credentials login
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    pub mfa_session_token: Option<String>,
}

/// Response for an established session
#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub token_type: String,
    pub expires_at: i64,
}

/// Request for the login-time second factor check
#[derive(Deserialize)]
pub struct MfaChallengeRequest {
    pub email: String,
    pub mfa_session_token: String,
    pub code: String,
}

/// Request to begin MFA enrollment
#[derive(Deserialize)]
pub struct MfaSetupRequest {
    pub method: MfaMethod,
}

/// Request to complete MFA enrollment
#[derive(Deserialize)]
pub struct MfaEnableRequest {
    pub method: MfaMethod,
    pub code: String,
    pub backup_codes: Option<Vec<String>>,
}

/// Response for TOTP enrollment
#[derive(Serialize)]
pub struct MfaSetupResponse {
    pub qr_data_url: String,
    pub secret: String,
    pub backup_codes: Vec<String>,
}

/// Response for the authorize redirect
#[derive(Serialize)]
pub struct AuthorizeResponse {
    pub authorization_url: String,
    pub state: String,
}

/// Request for the provider callback
#[derive(Deserialize)]
pub struct CallbackRequest {
    pub code: String,
    pub state: String,
}

/// Request for password reset confirmation
#[derive(Deserialize)]
pub struct PasswordResetRequest {
    pub token: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Create the router for the authentication service
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/auth/mfa",
            post(mfa_setup).put(mfa_enable).delete(mfa_disable),
        )
        .route("/auth/oauth/revoke", post(oauth_revoke))
        .route_layer(from_fn_with_state(
            state.clone(),
            crate::middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(login))
        .route("/auth/mfa/challenge", post(mfa_challenge))
        .route("/auth/oauth/:provider/authorize", get(oauth_authorize))
        .route("/auth/oauth/:provider/callback", post(oauth_callback))
        .route("/auth/password/reset", post(password_reset))
        .merge(protected)
        .with_state(state)
}

/// Health check endpoint reporting backing-store reachability
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = common::database::health_check(&state.db_pool)
        .await
        .unwrap_or(false);
    let cache = state.redis_pool.health_check().await.unwrap_or(false);

    let status = if database && cache { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "service": "plaza-auth",
        "database": database,
        "cache": cache,
    }))
}

fn session_response(state: &AppState, claims: SessionClaims) -> Result<SessionResponse, AuthError> {
    let token = state.jwt_service.encode_session(&claims)?;
    Ok(SessionResponse {
        token,
        token_type: "Bearer".to_string(),
        expires_at: claims.exp,
    })
}

/// Look up the account behind authenticated claims
async fn account_for(state: &AppState, claims: &SessionClaims) -> Result<Account, AuthError> {
    state
        .accounts
        .find_by_id(claims.sub)
        .await?
        .ok_or(AuthError::Unauthorized)
}

/// Credentials login endpoint
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    validate_email(&payload.email).map_err(AuthError::Validation)?;

    let outcome = state
        .issuer
        .login(crate::session::LoginRequest {
            email: payload.email,
            password: payload.password,
            remember_me: payload.remember_me,
            mfa_session_token: payload.mfa_session_token,
        })
        .await?;

    match outcome {
        LoginOutcome::Established(claims) => {
            Ok((StatusCode::OK, Json(session_response(&state, claims)?)))
        }
        LoginOutcome::MfaPending { mfa_session_token } => {
            Err(AuthError::MfaRequired { mfa_session_token })
        }
        LoginOutcome::Denied(reason) => Err(reason.into()),
    }
}

/// Second factor check during a pending login. On success the client
/// resubmits the login request carrying the same MFA session token.
pub async fn mfa_challenge(
    State(state): State<AppState>,
    Json(payload): Json<MfaChallengeRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let account = state
        .accounts
        .find_by_email(&payload.email)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    // The pending token proves the first factor already passed; the
    // comparison is non-destructive so the login call can consume it
    let pending = state
        .mfa_tokens
        .matches(account.id, &payload.mfa_session_token)
        .await?;
    if !pending {
        return Err(AuthError::Unauthorized);
    }

    state.mfa_engine.verify_challenge(&account, &payload.code).await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({"verified": true})),
    ))
}

/// Begin MFA enrollment for the authenticated account; only TOTP is
/// accepted
pub async fn mfa_setup(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Json(payload): Json<MfaSetupRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let account = account_for(&state, &claims).await?;
    let enrollment = state
        .mfa_engine
        .begin_enrollment(&account, payload.method)
        .await?;

    Ok((
        StatusCode::OK,
        Json(MfaSetupResponse {
            qr_data_url: enrollment.qr_data_url,
            secret: enrollment.secret_base32,
            backup_codes: enrollment.backup_codes,
        }),
    ))
}

/// Complete enrollment by verifying the first code
pub async fn mfa_enable(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Json(payload): Json<MfaEnableRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let account = account_for(&state, &claims).await?;
    state
        .mfa_engine
        .verify_and_enable(&account, payload.method, &payload.code, payload.backup_codes)
        .await?;

    Ok((StatusCode::OK, Json(serde_json::json!({"enabled": true}))))
}

/// Disable MFA for the authenticated account
pub async fn mfa_disable(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
) -> Result<impl IntoResponse, AuthError> {
    let account = account_for(&state, &claims).await?;
    state.mfa_engine.disable(&account).await?;

    // Any half-finished login should not survive the policy change
    state.issuer.invalidate_mfa_tokens(account.id).await?;

    Ok((StatusCode::OK, Json(serde_json::json!({"enabled": false}))))
}

fn parse_provider(value: &str) -> Result<OAuthProvider, AuthError> {
    OAuthProvider::parse(value)
        .ok_or_else(|| AuthError::Validation(format!("Unknown provider: {value}")))
}

fn oauth_session_key(csrf_state: &str) -> String {
    format!("oauth_session:{}", csrf_state)
}

/// Start the provider authorization flow
pub async fn oauth_authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, AuthError> {
    let provider = parse_provider(&provider)?;

    let (authorization_url, csrf_token, pkce_verifier) = state
        .oauth_manager
        .generate_auth_url(provider)
        .map_err(|e| {
            warn!("Authorization URL generation failed: {e:#}");
            AuthError::Provider
        })?;

    let session = OAuthSession {
        csrf_token: csrf_token.secret().clone(),
        pkce_verifier: pkce_verifier.secret().clone(),
        provider,
        created_at: state.clock.now().timestamp(),
    };
    let serialized =
        serde_json::to_string(&session).context("Failed to serialize authorization session")?;
    state
        .redis_pool
        .set(
            &oauth_session_key(csrf_token.secret()),
            &serialized,
            Some(OAUTH_SESSION_TTL),
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(AuthorizeResponse {
            authorization_url,
            state: session.csrf_token,
        }),
    ))
}

/// Complete the provider authorization flow and establish a session
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(payload): Json<CallbackRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let provider = parse_provider(&provider)?;

    // Single use: the stored session is consumed on first presentation
    let stored = state
        .redis_pool
        .take(&oauth_session_key(&payload.state))
        .await?
        .ok_or(AuthError::Unauthorized)?;
    let session: OAuthSession =
        serde_json::from_str(&stored).context("Corrupt authorization session")?;

    if session.provider != provider || session.csrf_token != payload.state {
        return Err(AuthError::Unauthorized);
    }

    let identity = state
        .oauth_manager
        .exchange_code(
            provider,
            payload.code,
            oauth2::PkceCodeVerifier::new(session.pkce_verifier),
            state.clock.now(),
        )
        .await
        .map_err(|e| {
            warn!("Code exchange failed for {}: {e:#}", provider.as_str());
            AuthError::Provider
        })?;

    let claims = state.issuer.oauth_sign_in(identity).await?;

    Ok((StatusCode::OK, Json(session_response(&state, claims)?)))
}

/// Disconnect the linked provider
pub async fn oauth_revoke(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
) -> Result<impl IntoResponse, AuthError> {
    let account = account_for(&state, &claims).await?;
    let provider = account
        .oauth_provider
        .ok_or_else(|| AuthError::Validation("No provider is linked".to_string()))?;

    state
        .issuer
        .disconnect_oauth(&account, provider, &state.oauth_manager)
        .await?;

    info!(account_id = account.id, "Provider disconnected");
    Ok((StatusCode::OK, Json(serde_json::json!({"revoked": true}))))
}

/// Password reset confirmation endpoint
pub async fn password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<impl IntoResponse, AuthError> {
    state
        .password_reset
        .confirm(&payload.token, &payload.new_password, &payload.confirm_password)
        .await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({"message": "Password updated"})),
    ))
}
