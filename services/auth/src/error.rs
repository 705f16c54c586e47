//! Typed authentication errors surfaced at the HTTP boundary
//!
//! Every handler outcome maps to one of these; raw store or provider
//! errors never reach the caller. Wrong email and wrong password both
//! collapse into `InvalidCredentials` so the two responses are
//! byte-for-byte identical.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

/// Authentication error taxonomy
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown email or wrong password; deliberately indistinct
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is suspended")]
    AccountSuspended,

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Account is pending verification")]
    AccountPendingVerification,

    /// Account in a state the policy table does not recognise
    #[error("Account state does not permit login")]
    InvalidAccountState,

    #[error("Too many attempts")]
    RateLimitExceeded {
        remaining: u32,
        resets_at: DateTime<Utc>,
    },

    /// Not a failure: the first factor passed and a second call carrying
    /// the returned token must complete the login
    #[error("Multi-factor authentication required")]
    MfaRequired { mfa_session_token: String },

    /// MFA operation attempted without a stored secret or with an
    /// unsupported method; distinct from a wrong code
    #[error("Multi-factor authentication is not configured")]
    MfaNotConfigured,

    #[error("Invalid one-time code")]
    InvalidMfaCode,

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Identity-provider failure during sign-in; fails closed
    #[error("Identity provider error")]
    Provider,

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code rendered to the caller
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountSuspended => "ACCOUNT_SUSPENDED",
            AuthError::AccountInactive => "ACCOUNT_INACTIVE",
            AuthError::AccountPendingVerification => "ACCOUNT_PENDING_VERIFICATION",
            AuthError::InvalidAccountState => "ACCOUNT_INVALID_STATE",
            AuthError::RateLimitExceeded { .. } => "ACCOUNT_RATE_LIMIT_EXCEEDED",
            AuthError::MfaRequired { .. } => "MFA_REQUIRED",
            AuthError::MfaNotConfigured => "MFA_NOT_CONFIGURED",
            AuthError::InvalidMfaCode => "INVALID_MFA_CODE",
            AuthError::Validation(_) => "VALIDATION_FAILED",
            AuthError::Provider => "PROVIDER_ERROR",
            AuthError::Unauthorized => "UNAUTHORIZED",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::AccountSuspended
            | AuthError::AccountInactive
            | AuthError::AccountPendingVerification
            | AuthError::InvalidAccountState => StatusCode::FORBIDDEN,
            AuthError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::MfaRequired { .. } => StatusCode::UNAUTHORIZED,
            AuthError::MfaNotConfigured => StatusCode::PRECONDITION_FAILED,
            AuthError::InvalidMfaCode => StatusCode::UNAUTHORIZED,
            AuthError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::Provider => StatusCode::BAD_GATEWAY,
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AuthError::RateLimitExceeded {
                remaining,
                resets_at,
            } => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
                "remaining_attempts": remaining,
                "resets_at": resets_at,
            }),
            AuthError::MfaRequired { mfa_session_token } => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
                "mfa_session_token": mfa_session_token,
            }),
            AuthError::Validation(message) => serde_json::json!({
                "error": self.code(),
                "message": message,
            }),
            AuthError::Internal(e) => {
                error!("Internal error at the auth boundary: {:#}", e);
                serde_json::json!({
                    "error": self.code(),
                    "message": "Internal server error",
                })
            }
            _ => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
