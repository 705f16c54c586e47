//! Session claims carried in the signed session token
//!
//! All fields are declared upfront; nothing is attached to the token at
//! runtime. Optional fields are explicit `Option`s.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AccountRole, AccountState};
use crate::oauth::OAuthProvider;

/// Claims minted when a session is established and refreshed on
/// subsequent requests. Identity fields stay stable for the lifetime of
/// the session; only the OAuth token fields are volatile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id
    pub sub: i64,
    /// Stable external reference
    pub uuid: Uuid,
    pub email: String,
    pub role: AccountRole,
    pub state: AccountState,
    pub name: String,
    pub surname: Option<String>,
    pub avatar: Option<String>,
    pub oauth_provider: Option<OAuthProvider>,
    pub oauth_access_token: Option<String>,
    pub oauth_refresh_token: Option<String>,
    /// Unix seconds; absent when no provider session is linked
    pub oauth_expires_at: Option<i64>,
    pub remember_me: bool,
    pub mfa_required: bool,
    pub mfa_verified: bool,
    pub mfa_session_token: Option<String>,
    pub trusted_device: bool,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds: 30 days out with remember-me, 24 hours otherwise
    pub exp: i64,
}

impl SessionClaims {
    /// Session lifetime without remember-me
    pub const DEFAULT_TTL: Duration = Duration::hours(24);
    /// Session lifetime with remember-me
    pub const REMEMBER_TTL: Duration = Duration::days(30);

    /// Compute the session expiry from the remember-me flag
    pub fn expiry_from(issued_at: DateTime<Utc>, remember_me: bool) -> DateTime<Utc> {
        if remember_me {
            issued_at + Self::REMEMBER_TTL
        } else {
            issued_at + Self::DEFAULT_TTL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_without_remember_me() {
        let issued = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let exp = SessionClaims::expiry_from(issued, false);
        assert_eq!(exp - issued, Duration::hours(24));
    }

    #[test]
    fn test_expiry_with_remember_me() {
        let issued = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let exp = SessionClaims::expiry_from(issued, true);
        assert_eq!(exp - issued, Duration::days(30));
    }
}
