//! Collaborator store interfaces
//!
//! The session issuer, MFA engine, and password-reset flow talk to their
//! stores through these traits. Production wiring uses the Postgres
//! repositories and the Redis-backed token stores below; tests swap in
//! in-memory doubles.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::cache::RedisPool;
use std::sync::Arc;

use crate::models::{Account, MfaStateUpdate, NewAccount, OAuthTokenSet, ProfileUpdate};

/// Source of truth for account records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Case-insensitive lookup among non-tombstoned rows
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Account>>;
    async fn create(&self, new_account: NewAccount) -> Result<Account>;
    async fn update_profile(&self, id: i64, profile: ProfileUpdate) -> Result<()>;
    async fn update_last_access(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn update_oauth_tokens(&self, id: i64, tokens: OAuthTokenSet) -> Result<()>;
    async fn clear_oauth_tokens(&self, id: i64) -> Result<()>;
    async fn update_mfa_state(&self, id: i64, update: MfaStateUpdate) -> Result<()>;
    async fn update_password_hash(&self, id: i64, hash: &str) -> Result<()>;
}

/// One stored backup code row
#[derive(Debug, Clone)]
pub struct StoredBackupCode {
    pub id: i64,
    pub ciphertext: Vec<u8>,
}

/// Backup recovery codes, stored distinct from the TOTP secret
#[async_trait]
pub trait BackupCodeStore: Send + Sync {
    /// Replace the full code set for an account
    async fn store(&self, account_id: i64, ciphertexts: Vec<Vec<u8>>) -> Result<()>;
    async fn load(&self, account_id: i64) -> Result<Vec<StoredBackupCode>>;
    /// Delete one code row; returns false when it was already gone
    async fn consume(&self, account_id: i64, code_id: i64) -> Result<bool>;
    async fn delete_all(&self, account_id: i64) -> Result<()>;
}

/// Short-lived, single-use MFA session tokens
#[async_trait]
pub trait MfaTokenStore: Send + Sync {
    async fn issue(&self, account_id: i64, token: &str, ttl_seconds: u64) -> Result<()>;
    /// Non-destructive comparison against the outstanding token
    async fn matches(&self, account_id: i64, token: &str) -> Result<bool>;
    /// Invalidate on first successful use; a mismatch leaves the stored
    /// token in place
    async fn consume(&self, account_id: i64, token: &str) -> Result<bool>;
    async fn invalidate(&self, account_id: i64) -> Result<()>;
}

/// Password-reset tokens, bound to a single account with an expiry.
/// Issuance is handled outside this core.
#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    /// Single use: resolves the token to its account id and removes it
    async fn consume(&self, token: &str) -> Result<Option<i64>>;
}

/// Redis-backed MFA session token store. Expiry is enforced by key TTL.
#[derive(Clone)]
pub struct RedisMfaTokenStore {
    redis: Arc<RedisPool>,
}

impl RedisMfaTokenStore {
    pub fn new(redis: Arc<RedisPool>) -> Self {
        Self { redis }
    }

    fn key(account_id: i64) -> String {
        format!("mfa_session:{}", account_id)
    }
}

#[async_trait]
impl MfaTokenStore for RedisMfaTokenStore {
    async fn issue(&self, account_id: i64, token: &str, ttl_seconds: u64) -> Result<()> {
        self.redis
            .set(&Self::key(account_id), token, Some(ttl_seconds))
            .await
    }

    async fn matches(&self, account_id: i64, token: &str) -> Result<bool> {
        let stored = self.redis.get(&Self::key(account_id)).await?;
        Ok(stored.as_deref() == Some(token))
    }

    async fn consume(&self, account_id: i64, token: &str) -> Result<bool> {
        let key = Self::key(account_id);
        match self.redis.get(&key).await? {
            Some(stored) if stored == token => {
                self.redis.delete(&key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(&self, account_id: i64) -> Result<()> {
        self.redis.delete(&Self::key(account_id)).await
    }
}

/// Redis-backed password-reset token store
#[derive(Clone)]
pub struct RedisResetTokenStore {
    redis: Arc<RedisPool>,
}

impl RedisResetTokenStore {
    pub fn new(redis: Arc<RedisPool>) -> Self {
        Self { redis }
    }

    fn key(token: &str) -> String {
        format!("password_reset:{}", token)
    }
}

#[async_trait]
impl ResetTokenStore for RedisResetTokenStore {
    async fn consume(&self, token: &str) -> Result<Option<i64>> {
        let value = self.redis.take(&Self::key(token)).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }
}
