//! OAuth2 integration for Google and Facebook providers
//!
//! The authorization-code exchange uses the `oauth2` client with PKCE;
//! token refresh and revocation go straight to the provider token and
//! revoke endpoints. Refresh failures are reported to the caller, never
//! panicked on: a session keeps its stale tokens when the provider is
//! unreachable. Revocation is best effort with the provider and
//! authoritative locally.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl,
    Scope, TokenResponse, TokenUrl, basic::BasicClient,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ProviderCredentials;

/// Seconds a refreshed access token is assumed to live when the
/// provider omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Network timeout for all provider HTTP calls
const PROVIDER_TIMEOUT_SECS: u64 = 10;

/// OAuth2 provider types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Facebook,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Facebook => "facebook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google" => Some(OAuthProvider::Google),
            "facebook" => Some(OAuthProvider::Facebook),
            _ => None,
        }
    }

    fn auth_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://accounts.google.com/o/oauth2/v2/auth",
            OAuthProvider::Facebook => "https://www.facebook.com/v19.0/dialog/oauth",
        }
    }

    fn token_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://oauth2.googleapis.com/token",
            OAuthProvider::Facebook => "https://graph.facebook.com/v19.0/oauth/access_token",
        }
    }

    fn revoke_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://oauth2.googleapis.com/revoke",
            OAuthProvider::Facebook => "https://graph.facebook.com/v19.0/me/permissions",
        }
    }

    fn scopes(&self) -> &'static [&'static str] {
        match self {
            OAuthProvider::Google => &["openid", "email", "profile"],
            OAuthProvider::Facebook => &["email", "public_profile"],
        }
    }
}

/// Identity assertion handed to the session issuer after a provider
/// callback completes
#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub provider: OAuthProvider,
    pub email: String,
    pub name: String,
    pub surname: Option<String>,
    pub avatar_url: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful token refresh
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Absent when the provider did not rotate the refresh token; the
    /// prior one remains valid
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Seam over the provider token endpoints
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a new access/refresh pair
    async fn refresh(
        &self,
        provider: OAuthProvider,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshedTokens>;

    /// Ask the provider to revoke an access token. An error here only
    /// means the provider did not confirm; local state is cleared by the
    /// caller regardless.
    async fn revoke(&self, provider: OAuthProvider, access_token: &str) -> Result<()>;
}

/// Wire shape of a provider token-endpoint response
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

fn refreshed_from(response: TokenEndpointResponse, now: DateTime<Utc>) -> RefreshedTokens {
    RefreshedTokens {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        expires_at: now + Duration::seconds(response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
    }
}

/// Split a provider display name: first whitespace token is the given
/// name, the remainder is the surname.
pub fn split_display_name(full: &str) -> (String, Option<String>) {
    let trimmed = full.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), Some(rest.trim().to_string())),
        None => (trimmed.to_string(), None),
    }
}

/// OAuth client for one configured provider
#[derive(Clone)]
struct ProviderClient {
    oauth: BasicClient,
    credentials: ProviderCredentials,
}

impl ProviderClient {
    fn new(provider: OAuthProvider, credentials: ProviderCredentials) -> Result<Self> {
        let oauth = BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(credentials.client_secret.clone())),
            AuthUrl::new(provider.auth_url().to_string())?,
            Some(TokenUrl::new(provider.token_url().to_string())?),
        )
        .set_redirect_uri(RedirectUrl::new(credentials.redirect_url.clone())?);

        Ok(Self { oauth, credentials })
    }
}

/// Token manager over the configured providers
#[derive(Clone)]
pub struct OAuthTokenManager {
    http: reqwest::Client,
    google: Option<ProviderClient>,
    facebook: Option<ProviderClient>,
}

impl OAuthTokenManager {
    pub fn new(
        google: Option<ProviderCredentials>,
        facebook: Option<ProviderCredentials>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            google: google
                .map(|c| ProviderClient::new(OAuthProvider::Google, c))
                .transpose()?,
            facebook: facebook
                .map(|c| ProviderClient::new(OAuthProvider::Facebook, c))
                .transpose()?,
        })
    }

    fn client(&self, provider: OAuthProvider) -> Result<&ProviderClient> {
        let client = match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Facebook => self.facebook.as_ref(),
        };

        client.ok_or_else(|| anyhow::anyhow!("Provider {} is not configured", provider.as_str()))
    }

    /// Generate an authorization URL with PKCE
    pub fn generate_auth_url(
        &self,
        provider: OAuthProvider,
    ) -> Result<(String, CsrfToken, PkceCodeVerifier)> {
        info!("Generating authorization URL for {:?}", provider);

        let client = self.client(provider)?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client
            .oauth
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);

        for scope in provider.scopes() {
            request = request.add_scope(Scope::new(scope.to_string()));
        }

        let (auth_url, csrf_token) = request.url();

        Ok((auth_url.to_string(), csrf_token, pkce_verifier))
    }

    /// Exchange an authorization code and fetch the provider profile,
    /// producing the identity assertion for the session issuer
    pub async fn exchange_code(
        &self,
        provider: OAuthProvider,
        code: String,
        pkce_verifier: PkceCodeVerifier,
        now: DateTime<Utc>,
    ) -> Result<ProviderIdentity> {
        info!("Exchanging authorization code for {:?}", provider);

        let client = self.client(provider)?;
        let token_response = client
            .oauth
            .exchange_code(oauth2::AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| anyhow::anyhow!("Code exchange failed: {e}"))?;

        let access_token = token_response.access_token().secret().clone();
        let refresh_token = token_response.refresh_token().map(|t| t.secret().clone());
        let expires_at = now
            + token_response
                .expires_in()
                .map(|d| Duration::seconds(d.as_secs() as i64))
                .unwrap_or_else(|| Duration::seconds(DEFAULT_EXPIRES_IN));

        let profile = self.fetch_profile(provider, &access_token).await?;
        let (name, surname) = split_display_name(&profile.name);

        Ok(ProviderIdentity {
            provider,
            email: profile.email,
            name,
            surname,
            avatar_url: profile.avatar_url,
            access_token,
            refresh_token,
            expires_at,
        })
    }

    async fn fetch_profile(
        &self,
        provider: OAuthProvider,
        access_token: &str,
    ) -> Result<RawProfile> {
        match provider {
            OAuthProvider::Google => {
                let response = self
                    .http
                    .get("https://www.googleapis.com/oauth2/v2/userinfo")
                    .bearer_auth(access_token)
                    .send()
                    .await?;

                if !response.status().is_success() {
                    return Err(anyhow::anyhow!(
                        "Failed to get Google user profile: {}",
                        response.status()
                    ));
                }

                let user: GoogleUser = response.json().await?;
                Ok(RawProfile {
                    email: user.email,
                    name: user.name,
                    avatar_url: user.picture,
                })
            }
            OAuthProvider::Facebook => {
                let response = self
                    .http
                    .get("https://graph.facebook.com/v19.0/me")
                    .query(&[("fields", "id,name,email,picture")])
                    .bearer_auth(access_token)
                    .send()
                    .await?;

                if !response.status().is_success() {
                    return Err(anyhow::anyhow!(
                        "Failed to get Facebook user profile: {}",
                        response.status()
                    ));
                }

                let user: FacebookUser = response.json().await?;
                let email = user
                    .email
                    .ok_or_else(|| anyhow::anyhow!("Facebook profile has no email"))?;

                Ok(RawProfile {
                    email,
                    name: user.name,
                    avatar_url: user.picture.map(|p| p.data.url),
                })
            }
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenManager {
    async fn refresh(
        &self,
        provider: OAuthProvider,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshedTokens> {
        let client = self.client(provider)?;

        let response = self
            .http
            .post(provider.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client.credentials.client_id.as_str()),
                ("client_secret", client.credentials.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Token refresh failed for {}: {}",
                provider.as_str(),
                response.status()
            ));
        }

        let body: TokenEndpointResponse = response.json().await?;
        Ok(refreshed_from(body, now))
    }

    async fn revoke(&self, provider: OAuthProvider, access_token: &str) -> Result<()> {
        let response = self
            .http
            .post(provider.revoke_url())
            .form(&[("token", access_token)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Token revocation failed for {}: {}",
                provider.as_str(),
                response.status()
            ));
        }

        Ok(())
    }
}

#[derive(Debug)]
struct RawProfile {
    email: String,
    name: String,
    avatar_url: Option<String>,
}

/// Google userinfo response
#[derive(Debug, Deserialize)]
struct GoogleUser {
    email: String,
    name: String,
    picture: Option<String>,
}

/// Facebook graph `/me` response
#[derive(Debug, Deserialize)]
struct FacebookUser {
    name: String,
    email: Option<String>,
    picture: Option<FacebookPicture>,
}

#[derive(Debug, Deserialize)]
struct FacebookPicture {
    data: FacebookPictureData,
}

#[derive(Debug, Deserialize)]
struct FacebookPictureData {
    url: String,
}

/// OAuth authorization session stored in Redis between the authorize
/// redirect and the provider callback
#[derive(Debug, Serialize, Deserialize)]
pub struct OAuthSession {
    pub csrf_token: String,
    pub pkce_verifier: String,
    pub provider: OAuthProvider,
    pub created_at: i64,
}
