//! Account repository for database operations

use anyhow::Result;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::models::{
    Account, AccountRole, AccountState, MfaMethod, MfaStateUpdate, NewAccount, OAuthTokenSet,
    ProfileUpdate,
};
use crate::oauth::OAuthProvider;
use crate::stores::CredentialStore;

/// Hash a password with Argon2 and a fresh salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();

    Ok(hash)
}

/// Verify a password against a stored Argon2 hash
pub fn verify_password(stored_hash: &str, password: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(stored_hash)
        .map_err(|e| anyhow::anyhow!("Failed to parse password hash: {}", e))?;

    let argon2 = Argon2::default();
    Ok(argon2
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

const ACCOUNT_COLUMNS: &str = "id, uuid, email, password_hash, name, surname, avatar_url, \
     role, state, verified_at, last_access_at, deleted_at, \
     oauth_provider, oauth_access_token, oauth_refresh_token, oauth_expires_at, \
     mfa_enabled, mfa_method, mfa_secret, created_at, updated_at";

fn map_account(row: &PgRow) -> Result<Account> {
    let role: String = row.get("role");
    let state: String = row.get("state");
    let provider: Option<String> = row.get("oauth_provider");
    let method: Option<String> = row.get("mfa_method");

    Ok(Account {
        id: row.get("id"),
        uuid: row.get::<Uuid, _>("uuid"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        name: row.get("name"),
        surname: row.get("surname"),
        avatar_url: row.get("avatar_url"),
        role: AccountRole::parse(&role)
            .ok_or_else(|| anyhow::anyhow!("Unknown account role: {}", role))?,
        state: AccountState::parse(&state)
            .ok_or_else(|| anyhow::anyhow!("Unknown account state: {}", state))?,
        verified_at: row.get("verified_at"),
        last_access_at: row.get("last_access_at"),
        deleted_at: row.get("deleted_at"),
        oauth_provider: provider
            .map(|p| {
                OAuthProvider::parse(&p).ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", p))
            })
            .transpose()?,
        oauth_access_token: row.get("oauth_access_token"),
        oauth_refresh_token: row.get("oauth_refresh_token"),
        oauth_expires_at: row.get("oauth_expires_at"),
        mfa_enabled: row.get("mfa_enabled"),
        mfa_method: method
            .map(|m| MfaMethod::parse(&m).ok_or_else(|| anyhow::anyhow!("Unknown MFA method: {}", m)))
            .transpose()?,
        mfa_secret: row.get("mfa_secret"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Account repository
#[derive(Clone)]
pub struct AccountRepository {
    pool: PgPool,
}

impl AccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for AccountRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE lower(email) = lower($1) AND deleted_at IS NULL"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_account).transpose()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_account).transpose()
    }

    async fn create(&self, new_account: NewAccount) -> Result<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts \
             (uuid, email, password_hash, name, surname, avatar_url, role, state, \
              verified_at, oauth_provider) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new_account.email)
        .bind(&new_account.password_hash)
        .bind(&new_account.name)
        .bind(&new_account.surname)
        .bind(&new_account.avatar_url)
        .bind(new_account.role.as_str())
        .bind(new_account.state.as_str())
        .bind(new_account.verified_at)
        .bind(new_account.oauth_provider.map(|p| p.as_str()))
        .fetch_one(&self.pool)
        .await?;

        map_account(&row)
    }

    async fn update_profile(&self, id: i64, profile: ProfileUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
             name = COALESCE($2, name), \
             surname = COALESCE($3, surname), \
             avatar_url = COALESCE($4, avatar_url), \
             updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&profile.name)
        .bind(&profile.surname)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_last_access(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_access_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_oauth_tokens(&self, id: i64, tokens: OAuthTokenSet) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
             oauth_provider = $2, \
             oauth_access_token = $3, \
             oauth_refresh_token = COALESCE($4, oauth_refresh_token), \
             oauth_expires_at = $5, \
             updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(tokens.provider.as_str())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_oauth_tokens(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
             oauth_provider = NULL, \
             oauth_access_token = NULL, \
             oauth_refresh_token = NULL, \
             oauth_expires_at = NULL, \
             updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_mfa_state(&self, id: i64, update: MfaStateUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
             mfa_enabled = $2, \
             mfa_method = $3, \
             mfa_secret = $4, \
             updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(update.enabled)
        .bind(update.method.map(|m| m.as_str()))
        .bind(&update.secret)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_password_hash(&self, id: i64, hash: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
