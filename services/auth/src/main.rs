use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod clock;
mod config;
mod crypto;
mod error;
mod jwt;
mod mfa;
mod middleware;
mod models;
mod oauth;
mod password_reset;
mod rate_limiter;
mod repositories;
mod routes;
mod session;
mod stores;
mod validation;

#[cfg(test)]
mod testing;

use sqlx::PgPool;
use tokio::net::TcpListener;

use common::cache::{RedisConfig, RedisPool};
use common::database::{self, DatabaseConfig};

use crate::clock::{SharedClock, SystemClock};
use crate::config::{AuthConfig, SecretStrength, validate_secret};
use crate::crypto::SecretCipher;
use crate::jwt::JwtService;
use crate::mfa::MfaEngine;
use crate::oauth::OAuthTokenManager;
use crate::password_reset::PasswordResetService;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RedisRateLimiter};
use crate::repositories::{AccountRepository, BackupCodeRepository};
use crate::session::SessionIssuer;
use crate::stores::{
    CredentialStore, MfaTokenStore, RedisMfaTokenStore, RedisResetTokenStore,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub redis_pool: Arc<RedisPool>,
    pub jwt_service: JwtService,
    pub issuer: SessionIssuer,
    pub mfa_engine: MfaEngine,
    pub password_reset: PasswordResetService,
    pub oauth_manager: OAuthTokenManager,
    pub accounts: Arc<dyn CredentialStore>,
    pub mfa_tokens: Arc<dyn MfaTokenStore>,
    pub clock: SharedClock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting authentication service");

    let config = AuthConfig::from_env()?;
    match validate_secret(&config.secret, config.production)? {
        SecretStrength::Strong => {}
        SecretStrength::LowEntropy => {
            warn!("AUTH_SECRET looks low-entropy; consider rotating it");
        }
    }

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;

    if database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    sqlx::migrate!("./migrations").run(&pool).await?;

    // Initialize Redis connection pool
    let redis_config = RedisConfig::from_env()?;
    let redis_pool = Arc::new(RedisPool::new(&redis_config).await?);

    let clock: SharedClock = Arc::new(SystemClock);
    let accounts: Arc<dyn CredentialStore> = Arc::new(AccountRepository::new(pool.clone()));
    let backup_codes = Arc::new(BackupCodeRepository::new(pool.clone()));
    let mfa_tokens: Arc<dyn MfaTokenStore> =
        Arc::new(RedisMfaTokenStore::new(redis_pool.clone()));
    let reset_tokens = Arc::new(RedisResetTokenStore::new(redis_pool.clone()));

    // Counters live in Redis so the limit holds across replicas and
    // restarts
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(RedisRateLimiter::new(
        RateLimiterConfig {
            max_attempts: config.rate_limit_max_attempts,
            window_seconds: config.rate_limit_window,
        },
        redis_pool.clone(),
    ));

    let jwt_service = JwtService::new(&config.secret);
    let cipher = SecretCipher::new(config.mfa_encryption_key);

    let issuer = SessionIssuer::new(
        accounts.clone(),
        mfa_tokens.clone(),
        rate_limiter.clone(),
        clock.clone(),
        config.mfa_token_ttl,
    )?;

    let mfa_engine = MfaEngine::new(
        accounts.clone(),
        backup_codes,
        cipher,
        rate_limiter,
        clock.clone(),
        config.mfa_issuer.clone(),
    );

    let password_reset =
        PasswordResetService::new(accounts.clone(), reset_tokens, mfa_tokens.clone());

    let oauth_manager = OAuthTokenManager::new(config.google.clone(), config.facebook.clone())?;

    let app_state = AppState {
        db_pool: pool,
        redis_pool,
        jwt_service,
        issuer,
        mfa_engine,
        password_reset,
        oauth_manager,
        accounts,
        mfa_tokens,
        clock,
    };

    let app = routes::create_router(app_state);

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Authentication service listening on 0.0.0.0:3000");

    axum::serve(listener, app).await?;

    Ok(())
}
