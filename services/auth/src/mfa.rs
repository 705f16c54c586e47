//! MFA engine: TOTP enrollment, verification, backup codes
//!
//! Secrets are encrypted before they reach the account store and
//! decrypted for verification; plaintext secrets leave this module
//! exactly once, inside the provisioning payload returned at setup.
//! Backup codes are shown once at generation and stored as individual
//! ciphertexts; consuming a code deletes it.

use anyhow::anyhow;
use rand::Rng;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};
use crate::crypto::SecretCipher;
use crate::error::AuthError;
use crate::models::{Account, MfaMethod, MfaStateUpdate};
use crate::rate_limiter::RateLimiter;
use crate::stores::{BackupCodeStore, CredentialStore};
use crate::validation;

/// Number of backup codes issued at enrollment
pub const BACKUP_CODE_COUNT: usize = 8;

const SECRET_PURPOSE: &str = "mfa-secret";
const BACKUP_CODE_PURPOSE: &str = "backup-code";

/// Charset for backup codes; ambiguous characters excluded
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Provisioning payload returned to the caller exactly once
#[derive(Debug)]
pub struct MfaEnrollment {
    /// `data:image/png;base64,...` QR embedding the otpauth URL
    pub qr_data_url: String,
    /// Base32 secret for manual entry
    pub secret_base32: String,
    pub backup_codes: Vec<String>,
}

/// MFA engine
#[derive(Clone)]
pub struct MfaEngine {
    accounts: Arc<dyn CredentialStore>,
    backup_codes: Arc<dyn BackupCodeStore>,
    cipher: SecretCipher,
    rate_limiter: Arc<dyn RateLimiter>,
    clock: SharedClock,
    issuer: String,
}

impl MfaEngine {
    pub fn new(
        accounts: Arc<dyn CredentialStore>,
        backup_codes: Arc<dyn BackupCodeStore>,
        cipher: SecretCipher,
        rate_limiter: Arc<dyn RateLimiter>,
        clock: SharedClock,
        issuer: String,
    ) -> Self {
        Self {
            accounts,
            backup_codes,
            cipher,
            rate_limiter,
            clock,
            issuer,
        }
    }

    fn rate_key(account: &Account, method: MfaMethod) -> String {
        format!("mfa:{}:{}", account.id, method.as_str())
    }

    /// Count the attempt and enforce the per-account limit; every call
    /// is an attempt, successful verifications reset the counter
    async fn check_rate(&self, account: &Account, method: MfaMethod) -> Result<(), AuthError> {
        let decision = self
            .rate_limiter
            .check_and_count(&Self::rate_key(account, method), self.clock.now())
            .await
            .map_err(AuthError::Internal)?;

        if !decision.allowed {
            return Err(AuthError::RateLimitExceeded {
                remaining: decision.remaining,
                resets_at: decision.resets_at,
            });
        }

        Ok(())
    }

    fn totp_for(&self, account: &Account, secret_bytes: Vec<u8>) -> Result<TOTP, AuthError> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some(self.issuer.clone()),
            account.email.clone(),
        )
        .map_err(|e| AuthError::Internal(anyhow!("TOTP init error: {e}")))
    }

    fn decrypt_secret(&self, account: &Account) -> Result<Vec<u8>, AuthError> {
        let ciphertext = account
            .mfa_secret
            .as_deref()
            .ok_or(AuthError::MfaNotConfigured)?;

        self.cipher
            .decrypt(account.uuid, SECRET_PURPOSE, ciphertext)
            .map_err(AuthError::Internal)
    }

    fn encrypt_codes(&self, account: &Account, codes: &[String]) -> Result<Vec<Vec<u8>>, AuthError> {
        codes
            .iter()
            .map(|code| {
                self.cipher
                    .encrypt(account.uuid, BACKUP_CODE_PURPOSE, code.as_bytes())
                    .map_err(AuthError::Internal)
            })
            .collect()
    }

    /// Begin enrollment for the requested method. Only TOTP is
    /// supported; SMS and email enrollment are rejected up front.
    pub async fn begin_enrollment(
        &self,
        account: &Account,
        method: MfaMethod,
    ) -> Result<MfaEnrollment, AuthError> {
        if method != MfaMethod::Totp {
            return Err(AuthError::MfaNotConfigured);
        }
        self.setup_totp(account).await
    }

    /// Begin TOTP enrollment. The secret and method are persisted with
    /// MFA left disabled; enrollment completes in
    /// [`MfaEngine::verify_and_enable`].
    pub async fn setup_totp(&self, account: &Account) -> Result<MfaEnrollment, AuthError> {
        self.check_rate(account, MfaMethod::Totp).await?;

        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow!("Secret generation error: {e}")))?;

        let ciphertext = self
            .cipher
            .encrypt(account.uuid, SECRET_PURPOSE, &secret_bytes)
            .map_err(AuthError::Internal)?;

        let totp = self.totp_for(account, secret_bytes)?;
        let qr = totp
            .get_qr_base64()
            .map_err(|e| AuthError::Internal(anyhow!("QR generation error: {e}")))?;
        let qr_data_url = format!("data:image/png;base64,{qr}");
        let secret_base32 = totp.get_secret_base32();

        let backup_codes = generate_backup_codes();
        let encrypted_codes = self.encrypt_codes(account, &backup_codes)?;

        self.accounts
            .update_mfa_state(
                account.id,
                MfaStateUpdate {
                    enabled: false,
                    method: Some(MfaMethod::Totp),
                    secret: Some(ciphertext),
                },
            )
            .await?;
        self.backup_codes.store(account.id, encrypted_codes).await?;

        info!(account_id = account.id, "TOTP enrollment started, pending verification");

        Ok(MfaEnrollment {
            qr_data_url,
            secret_base32,
            backup_codes,
        })
    }

    /// Complete enrollment: verify the first code and flip the enabled
    /// flag. Any supplied backup codes replace the stored set.
    pub async fn verify_and_enable(
        &self,
        account: &Account,
        method: MfaMethod,
        code: &str,
        backup_codes: Option<Vec<String>>,
    ) -> Result<(), AuthError> {
        if method != MfaMethod::Totp || account.mfa_method != Some(MfaMethod::Totp) {
            return Err(AuthError::MfaNotConfigured);
        }

        validation::validate_totp_code(code).map_err(AuthError::Validation)?;
        self.check_rate(account, method).await?;

        let secret_bytes = self.decrypt_secret(account)?;
        let totp = self.totp_for(account, secret_bytes)?;
        let valid = totp.check_current(code).unwrap_or(false);

        if !valid {
            warn!(account_id = account.id, "MFA enable verification failed");
            return Err(AuthError::InvalidMfaCode);
        }

        self.accounts
            .update_mfa_state(
                account.id,
                MfaStateUpdate {
                    enabled: true,
                    method: Some(method),
                    secret: account.mfa_secret.clone(),
                },
            )
            .await?;

        if let Some(codes) = backup_codes {
            let encrypted = self.encrypt_codes(account, &codes)?;
            self.backup_codes.store(account.id, encrypted).await?;
        }

        self.rate_limiter
            .reset(&Self::rate_key(account, method))
            .await
            .map_err(AuthError::Internal)?;
        info!(account_id = account.id, "MFA enabled");

        Ok(())
    }

    /// Disable MFA: clears flag, secret, and method, and deletes all
    /// backup codes. Disabling an already-disabled account is a no-op
    /// success.
    pub async fn disable(&self, account: &Account) -> Result<(), AuthError> {
        if !account.mfa_enabled && account.mfa_secret.is_none() && account.mfa_method.is_none() {
            return Ok(());
        }

        self.accounts
            .update_mfa_state(
                account.id,
                MfaStateUpdate {
                    enabled: false,
                    method: None,
                    secret: None,
                },
            )
            .await?;
        self.backup_codes.delete_all(account.id).await?;

        info!(account_id = account.id, "MFA disabled");
        Ok(())
    }

    /// Login-time second factor check: a current TOTP code, or one
    /// unused backup code as fallback.
    pub async fn verify_challenge(&self, account: &Account, code: &str) -> Result<(), AuthError> {
        let method = account.mfa_method.ok_or(AuthError::MfaNotConfigured)?;
        self.check_rate(account, method).await?;

        if validation::validate_totp_code(code).is_ok() {
            let secret_bytes = self.decrypt_secret(account)?;
            let totp = self.totp_for(account, secret_bytes)?;
            if totp.check_current(code).unwrap_or(false) {
                self.rate_limiter
                    .reset(&Self::rate_key(account, method))
                    .await
                    .map_err(AuthError::Internal)?;
                return Ok(());
            }
        }

        if self.consume_backup_code(account, code).await? {
            self.rate_limiter
                .reset(&Self::rate_key(account, method))
                .await
                .map_err(AuthError::Internal)?;
            info!(account_id = account.id, "Backup code consumed");
            return Ok(());
        }

        warn!(account_id = account.id, "MFA challenge failed");
        Err(AuthError::InvalidMfaCode)
    }

    async fn consume_backup_code(&self, account: &Account, code: &str) -> Result<bool, AuthError> {
        let submitted = code.trim().to_ascii_uppercase();
        let stored = self.backup_codes.load(account.id).await?;

        for entry in stored {
            let plaintext = match self
                .cipher
                .decrypt(account.uuid, BACKUP_CODE_PURPOSE, &entry.ciphertext)
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(account_id = account.id, "Undecryptable backup code row: {e}");
                    continue;
                }
            };

            if plaintext == submitted.as_bytes() {
                // The DELETE row count makes the code single-use even
                // under concurrent submission
                return Ok(self.backup_codes.consume(account.id, entry.id).await?);
            }
        }

        Ok(false)
    }
}

/// Generate the fixed-size backup code set, `XXXX-XXXX` format
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();

    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let chars: Vec<char> = (0..8)
                .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
                .collect();
            format!(
                "{}-{}",
                chars[..4].iter().collect::<String>(),
                chars[4..].iter().collect::<String>()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{AccountRole, AccountState};
    use crate::rate_limiter::{LocalRateLimiter, RateLimiterConfig};
    use crate::testing::{InMemoryBackupCodeStore, InMemoryCredentialStore};
    use chrono::Utc;
    use uuid::Uuid;

    fn account(id: i64) -> Account {
        Account {
            id,
            uuid: Uuid::new_v4(),
            email: format!("user{id}@plaza.market"),
            password_hash: None,
            name: "Test".to_string(),
            surname: None,
            avatar_url: None,
            role: AccountRole::EndUser,
            state: AccountState::Active,
            verified_at: Some(Utc::now()),
            last_access_at: None,
            deleted_at: None,
            oauth_provider: None,
            oauth_access_token: None,
            oauth_refresh_token: None,
            oauth_expires_at: None,
            mfa_enabled: false,
            mfa_method: None,
            mfa_secret: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Fixture {
        engine: MfaEngine,
        accounts: Arc<InMemoryCredentialStore>,
        codes: Arc<InMemoryBackupCodeStore>,
    }

    fn fixture() -> Fixture {
        let accounts = Arc::new(InMemoryCredentialStore::new());
        let codes = Arc::new(InMemoryBackupCodeStore::new());
        let engine = MfaEngine::new(
            accounts.clone(),
            codes.clone(),
            SecretCipher::new([9u8; 32]),
            Arc::new(LocalRateLimiter::new(RateLimiterConfig::default())),
            Arc::new(SystemClock),
            "Plaza".to_string(),
        );

        Fixture {
            engine,
            accounts,
            codes,
        }
    }

    fn current_code(secret_base32: &str) -> String {
        let secret_bytes = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some("Plaza".to_string()),
            "test".to_string(),
        )
        .unwrap();
        totp.generate_current().unwrap()
    }

    #[tokio::test]
    async fn test_setup_leaves_mfa_disabled() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        assert!(enrollment.qr_data_url.starts_with("data:image/png;base64,"));
        assert_eq!(enrollment.backup_codes.len(), BACKUP_CODE_COUNT);

        let stored = f.accounts.get(account.id).await;
        assert!(!stored.mfa_enabled);
        assert_eq!(stored.mfa_method, Some(MfaMethod::Totp));
        assert!(stored.mfa_secret.is_some());
    }

    #[tokio::test]
    async fn test_verify_and_enable_flips_flag() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;

        let code = current_code(&enrollment.secret_base32);
        f.engine
            .verify_and_enable(&account, MfaMethod::Totp, &code, None)
            .await
            .unwrap();

        assert!(f.accounts.get(account.id).await.mfa_enabled);
    }

    #[tokio::test]
    async fn test_wrong_code_does_not_enable() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;

        let result = f
            .engine
            .verify_and_enable(&account, MfaMethod::Totp, "000000", None)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidMfaCode)));
        assert!(!f.accounts.get(account.id).await.mfa_enabled);
    }

    #[tokio::test]
    async fn test_enable_without_setup_is_precondition_failure() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let result = f
            .engine
            .verify_and_enable(&account, MfaMethod::Totp, "123456", None)
            .await;
        assert!(matches!(result, Err(AuthError::MfaNotConfigured)));
    }

    #[tokio::test]
    async fn test_unsupported_method_is_precondition_failure() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;
        f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;

        let result = f
            .engine
            .verify_and_enable(&account, MfaMethod::Sms, "123456", None)
            .await;
        assert!(matches!(result, Err(AuthError::MfaNotConfigured)));
    }

    #[tokio::test]
    async fn test_enrollment_rejects_unsupported_methods() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        for method in [MfaMethod::Sms, MfaMethod::Email] {
            let result = f.engine.begin_enrollment(&account, method).await;
            assert!(matches!(result, Err(AuthError::MfaNotConfigured)));
        }

        // Nothing was persisted for the rejected methods
        let stored = f.accounts.get(account.id).await;
        assert!(stored.mfa_method.is_none());
        assert!(stored.mfa_secret.is_none());

        // TOTP goes through the same entry point
        f.engine.begin_enrollment(&account, MfaMethod::Totp).await.unwrap();
        let stored = f.accounts.get(account.id).await;
        assert_eq!(stored.mfa_method, Some(MfaMethod::Totp));
    }

    #[tokio::test]
    async fn test_challenge_locks_out_after_repeated_failures() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;
        let code = current_code(&enrollment.secret_base32);
        f.engine
            .verify_and_enable(&account, MfaMethod::Totp, &code, None)
            .await
            .unwrap();
        let account = f.accounts.get(account.id).await;

        for _ in 0..5 {
            let result = f.engine.verify_challenge(&account, "000000").await;
            assert!(matches!(result, Err(AuthError::InvalidMfaCode)));
        }

        // Even a correct code is refused once the limit is reached
        let code = current_code(&enrollment.secret_base32);
        let result = f.engine.verify_challenge(&account, &code).await;
        assert!(matches!(result, Err(AuthError::RateLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        // Already disabled: no-op success
        f.engine.disable(&account).await.unwrap();

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;
        let code = current_code(&enrollment.secret_base32);
        f.engine
            .verify_and_enable(&account, MfaMethod::Totp, &code, None)
            .await
            .unwrap();

        let account = f.accounts.get(account.id).await;
        f.engine.disable(&account).await.unwrap();

        let stored = f.accounts.get(account.id).await;
        assert!(!stored.mfa_enabled);
        assert!(stored.mfa_secret.is_none());
        assert!(stored.mfa_method.is_none());
        assert!(f.codes.count(account.id).await == 0);
    }

    #[tokio::test]
    async fn test_backup_code_single_use() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;
        let code = current_code(&enrollment.secret_base32);
        f.engine
            .verify_and_enable(&account, MfaMethod::Totp, &code, None)
            .await
            .unwrap();

        let account = f.accounts.get(account.id).await;
        let backup = enrollment.backup_codes[0].clone();

        f.engine.verify_challenge(&account, &backup).await.unwrap();
        let second = f.engine.verify_challenge(&account, &backup).await;
        assert!(matches!(second, Err(AuthError::InvalidMfaCode)));
    }

    #[tokio::test]
    async fn test_challenge_accepts_current_totp() {
        let f = fixture();
        let account = f.accounts.insert(account(1)).await;

        let enrollment = f.engine.setup_totp(&account).await.unwrap();
        let account = f.accounts.get(account.id).await;
        let code = current_code(&enrollment.secret_base32);
        f.engine
            .verify_and_enable(&account, MfaMethod::Totp, &code, None)
            .await
            .unwrap();

        let account = f.accounts.get(account.id).await;
        let code = current_code(&enrollment.secret_base32);
        f.engine.verify_challenge(&account, &code).await.unwrap();
    }

    #[test]
    fn test_generate_backup_codes_shape() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(code.chars().nth(4), Some('-'));
        }
    }
}
