//! Service configuration and startup validation
//!
//! Configuration is read once at process initialization; nothing in this
//! module is consulted globally afterwards. The signing secret is
//! validated by the pure [`validate_secret`] function: the service
//! refuses to start on a short secret in production and logs a warning
//! for secrets that pass the length check but look low-entropy.

use std::collections::HashMap;
use thiserror::Error;

/// Minimum signing-secret length accepted in production
pub const MIN_SECRET_LEN: usize = 32;

/// Configuration errors that abort startup
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("AUTH_SECRET must be at least {MIN_SECRET_LEN} characters in production")]
    WeakSecret,

    #[error("MFA_ENCRYPTION_KEY must decode to 32 bytes")]
    BadEncryptionKey,
}

/// Outcome of secret validation when the secret is acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    Strong,
    /// Passed the length check but a single character dominates it
    LowEntropy,
}

/// Validate the signing secret. Pure; the caller decides how to react
/// to `LowEntropy` (the service logs a warning and continues).
pub fn validate_secret(secret: &str, production: bool) -> Result<SecretStrength, ConfigError> {
    if production && secret.len() < MIN_SECRET_LEN {
        return Err(ConfigError::WeakSecret);
    }

    // Repeated-character heuristic: a secret where one character accounts
    // for more than half the length is treated as low entropy.
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in secret.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let max_run = counts.values().copied().max().unwrap_or(0);
    if !secret.is_empty() && max_run * 2 > secret.chars().count() {
        return Ok(SecretStrength::LowEntropy);
    }

    Ok(SecretStrength::Strong)
}

/// Credentials for one OAuth provider
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

/// Authentication service configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Session signing secret; >= 32 characters in production
    pub secret: String,
    /// True when APP_ENV=production
    pub production: bool,
    /// Base64-encoded 32-byte key for MFA secret encryption at rest
    pub mfa_encryption_key: [u8; 32],
    /// Issuer name embedded in TOTP provisioning payloads
    pub mfa_issuer: String,
    /// MFA session token lifetime in seconds
    pub mfa_token_ttl: u64,
    /// Failed attempts tolerated per rate-limit window
    pub rate_limit_max_attempts: u32,
    /// Rate-limit window in seconds
    pub rate_limit_window: u64,
    pub google: Option<ProviderCredentials>,
    pub facebook: Option<ProviderCredentials>,
}

impl AuthConfig {
    /// Create a new AuthConfig from environment variables
    ///
    /// # Environment Variables
    /// - `AUTH_SECRET`: session signing secret (required)
    /// - `APP_ENV`: "production" enables strict secret validation
    /// - `MFA_ENCRYPTION_KEY`: base64 32-byte key (required)
    /// - `MFA_ISSUER`: TOTP issuer label (default: "Plaza")
    /// - `MFA_TOKEN_TTL`: MFA session token TTL in seconds (default: 600)
    /// - `RATE_LIMIT_MAX_ATTEMPTS`: default 5
    /// - `RATE_LIMIT_WINDOW`: window in seconds, default 900
    /// - `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET` / `GOOGLE_REDIRECT_URL`
    /// - `FACEBOOK_CLIENT_ID` / `FACEBOOK_CLIENT_SECRET` / `FACEBOOK_REDIRECT_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var("AUTH_SECRET").map_err(|_| ConfigError::Missing("AUTH_SECRET"))?;

        let production = std::env::var("APP_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let key_b64 = std::env::var("MFA_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("MFA_ENCRYPTION_KEY"))?;
        let mfa_encryption_key = decode_key(&key_b64)?;

        let mfa_issuer = std::env::var("MFA_ISSUER").unwrap_or_else(|_| "Plaza".to_string());

        let mfa_token_ttl = std::env::var("MFA_TOKEN_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);

        let rate_limit_max_attempts = std::env::var("RATE_LIMIT_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let rate_limit_window = std::env::var("RATE_LIMIT_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(900);

        Ok(AuthConfig {
            secret,
            production,
            mfa_encryption_key,
            mfa_issuer,
            mfa_token_ttl,
            rate_limit_max_attempts,
            rate_limit_window,
            google: provider_from_env("GOOGLE"),
            facebook: provider_from_env("FACEBOOK"),
        })
    }
}

fn provider_from_env(prefix: &str) -> Option<ProviderCredentials> {
    let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
    let redirect_url = std::env::var(format!("{prefix}_REDIRECT_URL")).ok()?;

    Some(ProviderCredentials {
        client_id,
        client_secret,
        redirect_url,
    })
}

fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| ConfigError::BadEncryptionKey)?;
    bytes.try_into().map_err(|_| ConfigError::BadEncryptionKey)
}
