//! Account model and related payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::oauth::OAuthProvider;

/// Authorization role attached to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountRole {
    EndUser,
    BusinessOwner,
    Moderator,
    Admin,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::EndUser => "end-user",
            AccountRole::BusinessOwner => "business-owner",
            AccountRole::Moderator => "moderator",
            AccountRole::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "end-user" => Some(AccountRole::EndUser),
            "business-owner" => Some(AccountRole::BusinessOwner),
            "moderator" => Some(AccountRole::Moderator),
            "admin" => Some(AccountRole::Admin),
            _ => None,
        }
    }
}

/// Lifecycle state of an account. Only `Active` accounts may complete login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountState {
    Active,
    Inactive,
    Suspended,
    PendingVerification,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Active => "active",
            AccountState::Inactive => "inactive",
            AccountState::Suspended => "suspended",
            AccountState::PendingVerification => "pending-verification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AccountState::Active),
            "inactive" => Some(AccountState::Inactive),
            "suspended" => Some(AccountState::Suspended),
            "pending-verification" => Some(AccountState::PendingVerification),
            _ => None,
        }
    }
}

/// Second-factor method configured on an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Sms => "sms",
            MfaMethod::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "totp" => Some(MfaMethod::Totp),
            "sms" => Some(MfaMethod::Sms),
            "email" => Some(MfaMethod::Email),
            _ => None,
        }
    }
}

/// Account entity
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub uuid: Uuid,
    pub email: String,
    /// Null for accounts that only ever signed in through a provider
    pub password_hash: Option<String>,
    pub name: String,
    pub surname: Option<String>,
    pub avatar_url: Option<String>,
    pub role: AccountRole,
    pub state: AccountState,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_access_at: Option<DateTime<Utc>>,
    /// Tombstone; rows carrying one are invisible to lookups
    pub deleted_at: Option<DateTime<Utc>>,
    pub oauth_provider: Option<OAuthProvider>,
    pub oauth_access_token: Option<String>,
    pub oauth_refresh_token: Option<String>,
    pub oauth_expires_at: Option<DateTime<Utc>>,
    pub mfa_enabled: bool,
    pub mfa_method: Option<MfaMethod>,
    /// TOTP secret ciphertext; set at enrollment, cleared on disable
    pub mfa_secret: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New account creation payload
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: Option<String>,
    pub name: String,
    pub surname: Option<String>,
    pub avatar_url: Option<String>,
    pub role: AccountRole,
    pub state: AccountState,
    pub verified_at: Option<DateTime<Utc>>,
    pub oauth_provider: Option<OAuthProvider>,
}

/// Profile fields refreshed from an identity provider
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub avatar_url: Option<String>,
}

/// OAuth token fields persisted against an account
#[derive(Debug, Clone)]
pub struct OAuthTokenSet {
    pub provider: OAuthProvider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// MFA state update persisted against an account
#[derive(Debug, Clone)]
pub struct MfaStateUpdate {
    pub enabled: bool,
    pub method: Option<MfaMethod>,
    pub secret: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [
            AccountRole::EndUser,
            AccountRole::BusinessOwner,
            AccountRole::Moderator,
            AccountRole::Admin,
        ] {
            assert_eq!(AccountRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(AccountRole::parse("superuser"), None);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            AccountState::Active,
            AccountState::Inactive,
            AccountState::Suspended,
            AccountState::PendingVerification,
        ] {
            assert_eq!(AccountState::parse(state.as_str()), Some(state));
        }
        assert_eq!(AccountState::parse("banned"), None);
    }
}
