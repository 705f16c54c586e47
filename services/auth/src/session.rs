//! Session issuer: the single authentication decision point
//!
//! One login attempt walks a fixed pipeline — rate check, account
//! lookup, state policy, password verify, MFA gate — short-circuiting
//! into a typed outcome at the first failure. The ordering is a
//! security property: the rate limiter answers before anything reveals
//! whether the account exists, and an unknown email is indistinguishable
//! from a wrong password.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::AuthError;
use crate::models::{
    Account, AccountRole, AccountState, NewAccount, OAuthTokenSet, ProfileUpdate, SessionClaims,
};
use crate::oauth::{OAuthProvider, ProviderIdentity, TokenRefresher};
use crate::rate_limiter::RateLimiter;
use crate::stores::{CredentialStore, MfaTokenStore};

/// Refresh the provider access token when it expires within this window
const OAUTH_REFRESH_WINDOW: Duration = Duration::minutes(5);

/// Login request accepted at the boundary
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
    pub mfa_session_token: Option<String>,
}

/// Why a login attempt was denied
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    /// Unknown email or wrong password; deliberately one variant
    InvalidCredentials,
    RateLimited {
        remaining: u32,
        resets_at: DateTime<Utc>,
    },
    PendingVerification,
    Suspended,
    Inactive,
    InvalidState,
}

impl From<DenialReason> for AuthError {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::InvalidCredentials => AuthError::InvalidCredentials,
            DenialReason::RateLimited {
                remaining,
                resets_at,
            } => AuthError::RateLimitExceeded {
                remaining,
                resets_at,
            },
            DenialReason::PendingVerification => AuthError::AccountPendingVerification,
            DenialReason::Suspended => AuthError::AccountSuspended,
            DenialReason::Inactive => AuthError::AccountInactive,
            DenialReason::InvalidState => AuthError::InvalidAccountState,
        }
    }
}

/// Outcome of one login attempt. `MfaPending` is not a failure: it
/// carries the token the client must resubmit after the second factor.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Established(SessionClaims),
    MfaPending { mfa_session_token: String },
    Denied(DenialReason),
}

/// Session issuer
#[derive(Clone)]
pub struct SessionIssuer {
    accounts: Arc<dyn CredentialStore>,
    mfa_tokens: Arc<dyn MfaTokenStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    clock: SharedClock,
    mfa_token_ttl: u64,
    /// Verified against when no account (or no hash) exists, keeping the
    /// miss path timing-comparable to a real verification
    dummy_hash: String,
}

impl SessionIssuer {
    pub fn new(
        accounts: Arc<dyn CredentialStore>,
        mfa_tokens: Arc<dyn MfaTokenStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        clock: SharedClock,
        mfa_token_ttl: u64,
    ) -> Result<Self> {
        let dummy_hash =
            crate::repositories::account::hash_password("plaza-enumeration-resistance")?;

        Ok(Self {
            accounts,
            mfa_tokens,
            rate_limiter,
            clock,
            mfa_token_ttl,
            dummy_hash,
        })
    }

    fn rate_key(email: &str) -> String {
        format!("login:{}", email.to_lowercase())
    }

    /// Credentials login. Checks run in fixed order and short-circuit;
    /// infrastructure failures on the security-relevant path propagate
    /// as errors, the last-access update is best-effort.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome> {
        let now = self.clock.now();
        let rate_key = Self::rate_key(&request.email);

        // 1. Count this attempt and check the limit before anything
        // reveals account existence; counting inside the check keeps
        // concurrent attempts from racing past the limit
        let decision = self.rate_limiter.check_and_count(&rate_key, now).await?;
        if !decision.allowed {
            return Ok(LoginOutcome::Denied(DenialReason::RateLimited {
                remaining: decision.remaining,
                resets_at: decision.resets_at,
            }));
        }

        // 2. Lookup among non-tombstoned rows
        let Some(account) = self.accounts.find_by_email(&request.email).await? else {
            let _ = crate::repositories::account::verify_password(
                &self.dummy_hash,
                &request.password,
            );
            return Ok(LoginOutcome::Denied(DenialReason::InvalidCredentials));
        };

        // 3. State policy, fixed priority
        match account.state {
            AccountState::PendingVerification => {
                return Ok(LoginOutcome::Denied(DenialReason::PendingVerification));
            }
            AccountState::Suspended => {
                return Ok(LoginOutcome::Denied(DenialReason::Suspended));
            }
            AccountState::Inactive => {
                return Ok(LoginOutcome::Denied(DenialReason::Inactive));
            }
            AccountState::Active => {}
        }

        // 4. Password verify; a missing hash (provider-only account)
        // takes the same path as a mismatch
        let verified = match account.password_hash.as_deref() {
            Some(hash) => crate::repositories::account::verify_password(hash, &request.password)?,
            None => {
                let _ = crate::repositories::account::verify_password(
                    &self.dummy_hash,
                    &request.password,
                );
                false
            }
        };

        if !verified {
            return Ok(LoginOutcome::Denied(DenialReason::InvalidCredentials));
        }

        // 5. MFA gate. An expired or mismatched token behaves exactly
        // like no token: a fresh one is issued for the retry.
        if account.mfa_enabled {
            let satisfied = match &request.mfa_session_token {
                Some(token) => self.mfa_tokens.consume(account.id, token).await?,
                None => false,
            };

            if !satisfied {
                let token = generate_session_token();
                self.mfa_tokens
                    .issue(account.id, &token, self.mfa_token_ttl)
                    .await?;
                info!(account_id = account.id, "Login pending second factor");
                return Ok(LoginOutcome::MfaPending {
                    mfa_session_token: token,
                });
            }
        }

        self.rate_limiter.reset(&rate_key).await?;

        // 6. Best-effort audit update; never blocks the login
        if let Err(e) = self.accounts.update_last_access(account.id, now).await {
            warn!(account_id = account.id, "Failed to record last access: {e:#}");
        }

        info!(account_id = account.id, "Session established");
        Ok(LoginOutcome::Established(self.assemble_claims(
            &account,
            request.remember_me,
            now,
        )))
    }

    /// Provider sign-in: upsert by email, fail closed on any
    /// persistence error. The provider assertion stands in for the
    /// second factor.
    pub async fn oauth_sign_in(&self, identity: ProviderIdentity) -> Result<SessionClaims, AuthError> {
        let now = self.clock.now();

        let existing = self
            .accounts
            .find_by_email(&identity.email)
            .await
            .map_err(|e| {
                error!("Account lookup failed during provider sign-in: {e:#}");
                AuthError::Provider
            })?;

        let account = match existing {
            None => self
                .accounts
                .create(NewAccount {
                    email: identity.email.clone(),
                    password_hash: None,
                    name: identity.name.clone(),
                    surname: identity.surname.clone(),
                    avatar_url: identity.avatar_url.clone(),
                    role: AccountRole::EndUser,
                    state: AccountState::Active,
                    verified_at: Some(now),
                    oauth_provider: Some(identity.provider),
                })
                .await
                .map_err(|e| {
                    error!("Account creation failed during provider sign-in: {e:#}");
                    AuthError::Provider
                })?,
            Some(account) => {
                self.accounts
                    .update_profile(
                        account.id,
                        ProfileUpdate {
                            name: Some(identity.name.clone()),
                            surname: identity.surname.clone(),
                            avatar_url: identity.avatar_url.clone(),
                        },
                    )
                    .await
                    .map_err(|e| {
                        error!("Profile sync failed during provider sign-in: {e:#}");
                        AuthError::Provider
                    })?;

                Account {
                    name: identity.name.clone(),
                    surname: identity.surname.clone().or(account.surname.clone()),
                    avatar_url: identity.avatar_url.clone().or(account.avatar_url.clone()),
                    ..account
                }
            }
        };

        self.accounts
            .update_oauth_tokens(
                account.id,
                OAuthTokenSet {
                    provider: identity.provider,
                    access_token: identity.access_token.clone(),
                    refresh_token: identity.refresh_token.clone(),
                    expires_at: identity.expires_at,
                },
            )
            .await
            .map_err(|e| {
                error!("Token persistence failed during provider sign-in: {e:#}");
                AuthError::Provider
            })?;

        if let Err(e) = self.accounts.update_last_access(account.id, now).await {
            warn!(account_id = account.id, "Failed to record last access: {e:#}");
        }

        let mut claims = self.assemble_claims(&account, false, now);
        claims.oauth_provider = Some(identity.provider);
        claims.oauth_access_token = Some(identity.access_token);
        claims.oauth_refresh_token = identity.refresh_token;
        claims.oauth_expires_at = Some(identity.expires_at.timestamp());

        info!(account_id = account.id, provider = identity.provider.as_str(), "Provider session established");
        Ok(claims)
    }

    /// Copy identity, profile, and authorization fields into a fresh
    /// claim set. Identity fields stay stable until the next sign-in
    /// event; only the OAuth token fields are refreshed afterwards.
    pub fn assemble_claims(
        &self,
        account: &Account,
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> SessionClaims {
        SessionClaims {
            sub: account.id,
            uuid: account.uuid,
            email: account.email.clone(),
            role: account.role,
            state: account.state,
            name: account.name.clone(),
            surname: account.surname.clone(),
            avatar: account.avatar_url.clone(),
            oauth_provider: account.oauth_provider,
            oauth_access_token: account.oauth_access_token.clone(),
            oauth_refresh_token: account.oauth_refresh_token.clone(),
            oauth_expires_at: account.oauth_expires_at.map(|t| t.timestamp()),
            remember_me,
            mfa_required: account.mfa_enabled,
            mfa_verified: true,
            mfa_session_token: None,
            trusted_device: false,
            iat: now.timestamp(),
            exp: SessionClaims::expiry_from(now, remember_me).timestamp(),
        }
    }

    /// Refresh the volatile OAuth fields of in-flight claims. Invoked
    /// per request; a refresh failure keeps the stale tokens and the
    /// request proceeds.
    ///
    /// The JWT is a snapshot taken at sign-in: providers rotate refresh
    /// tokens, so both the window decision and the token to present come
    /// from the persisted account record, never from the bearer token.
    pub async fn refreshed_claims(
        &self,
        mut claims: SessionClaims,
        refresher: &dyn TokenRefresher,
    ) -> SessionClaims {
        let now = self.clock.now();

        let account = match self.accounts.find_by_id(claims.sub).await {
            Ok(Some(account)) => account,
            Ok(None) => return claims,
            Err(e) => {
                warn!(account_id = claims.sub, "Account load failed during token refresh: {e:#}");
                return claims;
            }
        };

        claims.oauth_provider = account.oauth_provider;
        claims.oauth_access_token = account.oauth_access_token.clone();
        claims.oauth_refresh_token = account.oauth_refresh_token.clone();
        claims.oauth_expires_at = account.oauth_expires_at.map(|t| t.timestamp());

        let (Some(provider), Some(refresh_token), Some(expires_at)) = (
            account.oauth_provider,
            account.oauth_refresh_token,
            account.oauth_expires_at,
        ) else {
            return claims;
        };

        if expires_at - now >= OAUTH_REFRESH_WINDOW {
            return claims;
        }

        match refresher.refresh(provider, &refresh_token, now).await {
            Ok(refreshed) => {
                claims.oauth_access_token = Some(refreshed.access_token.clone());
                if refreshed.refresh_token.is_some() {
                    claims.oauth_refresh_token = refreshed.refresh_token.clone();
                }
                claims.oauth_expires_at = Some(refreshed.expires_at.timestamp());

                let update = OAuthTokenSet {
                    provider,
                    access_token: refreshed.access_token,
                    refresh_token: refreshed.refresh_token,
                    expires_at: refreshed.expires_at,
                };
                if let Err(e) = self.accounts.update_oauth_tokens(claims.sub, update).await {
                    warn!(account_id = claims.sub, "Failed to persist refreshed tokens: {e:#}");
                }

                claims
            }
            Err(e) => {
                warn!(
                    account_id = claims.sub,
                    "Provider token refresh failed, continuing with stale token: {e:#}"
                );
                claims
            }
        }
    }

    /// Disconnect the linked provider: best effort with the provider,
    /// authoritative locally.
    pub async fn disconnect_oauth(
        &self,
        account: &Account,
        provider: OAuthProvider,
        refresher: &dyn TokenRefresher,
    ) -> Result<()> {
        if let Some(access_token) = account.oauth_access_token.as_deref() {
            if let Err(e) = refresher.revoke(provider, access_token).await {
                warn!(
                    account_id = account.id,
                    "Provider revocation not confirmed, clearing locally anyway: {e:#}"
                );
            }
        }

        self.accounts.clear_oauth_tokens(account.id).await?;
        info!(account_id = account.id, "Provider tokens cleared");
        Ok(())
    }

    /// Invalidate any outstanding MFA session token for the account
    pub async fn invalidate_mfa_tokens(&self, account_id: i64) -> Result<()> {
        self.mfa_tokens.invalidate(account_id).await
    }
}

/// Random 32-byte hex token for the MFA bridging credential
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
