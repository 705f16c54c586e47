//! Password reset confirmation
//!
//! Token issuance and delivery happen outside this core; this module
//! accepts an outstanding reset token plus the new password and applies
//! the change. Each token resolves at most once, and a successful reset
//! severs everything that could keep the old credentials alive: pending
//! MFA session tokens and stored provider tokens.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::error::AuthError;
use crate::repositories::account::hash_password;
use crate::stores::{CredentialStore, MfaTokenStore, ResetTokenStore};
use crate::validation::validate_password;

/// Password reset service
#[derive(Clone)]
pub struct PasswordResetService {
    accounts: Arc<dyn CredentialStore>,
    reset_tokens: Arc<dyn ResetTokenStore>,
    mfa_tokens: Arc<dyn MfaTokenStore>,
}

impl PasswordResetService {
    pub fn new(
        accounts: Arc<dyn CredentialStore>,
        reset_tokens: Arc<dyn ResetTokenStore>,
        mfa_tokens: Arc<dyn MfaTokenStore>,
    ) -> Self {
        Self {
            accounts,
            reset_tokens,
            mfa_tokens,
        }
    }

    /// Apply a password reset. Input checks run before the token store
    /// is touched, so a rejected request never burns the token.
    pub async fn confirm(
        &self,
        token: &str,
        new_password: &str,
        confirmation: &str,
    ) -> Result<(), AuthError> {
        if new_password != confirmation {
            return Err(AuthError::Validation(
                "Password confirmation does not match".to_string(),
            ));
        }

        let password = validate_password(new_password).map_err(AuthError::Validation)?;

        let account_id = self
            .reset_tokens
            .consume(token)
            .await
            .context("Failed to resolve reset token")?
            .ok_or(AuthError::Unauthorized)?;

        let account = self
            .accounts
            .find_by_id(account_id)
            .await
            .context("Failed to load account for reset")?
            .ok_or(AuthError::Unauthorized)?;

        let hash = hash_password(password).context("Failed to hash new password")?;
        self.accounts
            .update_password_hash(account.id, &hash)
            .await
            .context("Failed to store new password")?;

        // The credential changed: drop any half-finished login and the
        // stored provider tokens
        self.mfa_tokens
            .invalidate(account.id)
            .await
            .context("Failed to invalidate MFA session token")?;
        self.accounts
            .clear_oauth_tokens(account.id)
            .await
            .context("Failed to clear provider tokens")?;

        info!(account_id = account.id, "Password reset applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::repositories::account::verify_password;
    use crate::stores::MfaTokenStore;
    use crate::testing::{
        InMemoryCredentialStore, InMemoryMfaTokenStore, InMemoryResetTokenStore, account_fixture,
    };

    struct Fixture {
        service: PasswordResetService,
        accounts: Arc<InMemoryCredentialStore>,
        reset_tokens: Arc<InMemoryResetTokenStore>,
        mfa_tokens: Arc<InMemoryMfaTokenStore>,
    }

    fn fixture() -> Fixture {
        let accounts = Arc::new(InMemoryCredentialStore::new());
        let reset_tokens = Arc::new(InMemoryResetTokenStore::new());
        let mfa_tokens = Arc::new(InMemoryMfaTokenStore::new(Arc::new(SystemClock)));
        let service = PasswordResetService::new(
            accounts.clone(),
            reset_tokens.clone(),
            mfa_tokens.clone(),
        );

        Fixture {
            service,
            accounts,
            reset_tokens,
            mfa_tokens,
        }
    }

    #[tokio::test]
    async fn test_reset_rehashes_password() {
        let f = fixture();
        let account = f.accounts.insert(account_fixture("a@plaza.market")).await;
        f.reset_tokens.issue("tok-1", account.id).await;

        f.service.confirm("tok-1", "Abcd123!", "Abcd123!").await.unwrap();

        let stored = f.accounts.get(account.id).await;
        let hash = stored.password_hash.unwrap();
        assert!(verify_password(&hash, "Abcd123!").unwrap());
    }

    #[tokio::test]
    async fn test_confirmation_mismatch_fails_before_token_is_touched() {
        let f = fixture();
        let account = f.accounts.insert(account_fixture("a@plaza.market")).await;
        f.reset_tokens.issue("tok-1", account.id).await;

        let result = f.service.confirm("tok-1", "Abcd123!", "Other123!").await;
        assert!(matches!(result, Err(AuthError::Validation(_))));

        // The token survives the rejected attempt
        f.service.confirm("tok-1", "Abcd123!", "Abcd123!").await.unwrap();
    }

    #[tokio::test]
    async fn test_weak_password_rejected() {
        let f = fixture();
        let account = f.accounts.insert(account_fixture("a@plaza.market")).await;
        f.reset_tokens.issue("tok-1", account.id).await;

        // Length alone is not enough
        let result = f.service.confirm("tok-1", "abcdefgh", "abcdefgh").await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let f = fixture();
        let account = f.accounts.insert(account_fixture("a@plaza.market")).await;
        f.reset_tokens.issue("tok-1", account.id).await;

        f.service.confirm("tok-1", "Abcd123!", "Abcd123!").await.unwrap();

        let result = f.service.confirm("tok-1", "Efgh456!", "Efgh456!").await;
        assert!(matches!(result, Err(AuthError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let f = fixture();

        let result = f.service.confirm("no-such-token", "Abcd123!", "Abcd123!").await;
        assert!(matches!(result, Err(AuthError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_reset_severs_mfa_and_provider_tokens() {
        let f = fixture();
        let mut account = account_fixture("a@plaza.market");
        account.oauth_provider = Some(crate::oauth::OAuthProvider::Google);
        account.oauth_access_token = Some("access-1".to_string());
        account.oauth_refresh_token = Some("refresh-1".to_string());
        let account = f.accounts.insert(account).await;

        f.reset_tokens.issue("tok-1", account.id).await;
        f.mfa_tokens.issue(account.id, "pending-mfa", 600).await.unwrap();

        f.service.confirm("tok-1", "Abcd123!", "Abcd123!").await.unwrap();

        assert!(!f.mfa_tokens.matches(account.id, "pending-mfa").await.unwrap());
        let stored = f.accounts.get(account.id).await;
        assert_eq!(stored.oauth_access_token, None);
        assert_eq!(stored.oauth_refresh_token, None);
    }
}
