//! In-memory doubles shared by the unit tests

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::models::{
    Account, AccountRole, AccountState, MfaStateUpdate, NewAccount, OAuthTokenSet, ProfileUpdate,
};
use crate::oauth::{OAuthProvider, RefreshedTokens, TokenRefresher};
use crate::stores::{
    BackupCodeStore, CredentialStore, MfaTokenStore, ResetTokenStore, StoredBackupCode,
};

/// A plain active account with no password hash and no linked provider
pub fn account_fixture(email: &str) -> Account {
    let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    Account {
        id: 0,
        uuid: Uuid::new_v4(),
        email: email.to_string(),
        password_hash: None,
        name: "Ada".to_string(),
        surname: None,
        avatar_url: None,
        role: AccountRole::EndUser,
        state: AccountState::Active,
        verified_at: Some(now),
        last_access_at: None,
        deleted_at: None,
        oauth_provider: None,
        oauth_access_token: None,
        oauth_refresh_token: None,
        oauth_expires_at: None,
        mfa_enabled: false,
        mfa_method: None,
        mfa_secret: None,
        created_at: now,
        updated_at: now,
    }
}

/// HashMap-backed [`CredentialStore`]
pub struct InMemoryCredentialStore {
    accounts: AsyncMutex<HashMap<i64, Account>>,
    next_id: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            accounts: AsyncMutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Seed an account, assigning an id when none is set
    pub async fn insert(&self, mut account: Account) -> Account {
        if account.id == 0 {
            account.id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        }
        let mut accounts = self.accounts.lock().await;
        accounts.insert(account.id, account.clone());
        account
    }

    /// Fetch a known-present account, panicking otherwise
    pub async fn get(&self, id: i64) -> Account {
        let accounts = self.accounts.lock().await;
        accounts.get(&id).cloned().unwrap()
    }

    pub async fn count(&self) -> usize {
        self.accounts.lock().await.len()
    }

    /// Make every write return an error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write_guard(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("simulated write failure"))
        } else {
            Ok(())
        }
    }

    async fn modify(&self, id: i64, f: impl FnOnce(&mut Account)) -> Result<()> {
        self.write_guard()?;
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no account {id}"))?;
        f(account);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email) && a.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts.get(&id).filter(|a| a.deleted_at.is_none()).cloned())
    }

    async fn create(&self, new_account: NewAccount) -> Result<Account> {
        self.write_guard()?;
        let mut account = account_fixture(&new_account.email);
        account.password_hash = new_account.password_hash;
        account.name = new_account.name;
        account.surname = new_account.surname;
        account.avatar_url = new_account.avatar_url;
        account.role = new_account.role;
        account.state = new_account.state;
        account.verified_at = new_account.verified_at;
        account.oauth_provider = new_account.oauth_provider;
        Ok(self.insert(account).await)
    }

    async fn update_profile(&self, id: i64, profile: ProfileUpdate) -> Result<()> {
        self.modify(id, |account| {
            if let Some(name) = profile.name {
                account.name = name;
            }
            if let Some(surname) = profile.surname {
                account.surname = Some(surname);
            }
            if let Some(avatar_url) = profile.avatar_url {
                account.avatar_url = Some(avatar_url);
            }
        })
        .await
    }

    async fn update_last_access(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.modify(id, |account| account.last_access_at = Some(at)).await
    }

    async fn update_oauth_tokens(&self, id: i64, tokens: OAuthTokenSet) -> Result<()> {
        self.modify(id, |account| {
            account.oauth_provider = Some(tokens.provider);
            account.oauth_access_token = Some(tokens.access_token);
            if tokens.refresh_token.is_some() {
                account.oauth_refresh_token = tokens.refresh_token;
            }
            account.oauth_expires_at = Some(tokens.expires_at);
        })
        .await
    }

    async fn clear_oauth_tokens(&self, id: i64) -> Result<()> {
        self.modify(id, |account| {
            account.oauth_provider = None;
            account.oauth_access_token = None;
            account.oauth_refresh_token = None;
            account.oauth_expires_at = None;
        })
        .await
    }

    async fn update_mfa_state(&self, id: i64, update: MfaStateUpdate) -> Result<()> {
        self.modify(id, |account| {
            account.mfa_enabled = update.enabled;
            account.mfa_method = update.method;
            account.mfa_secret = update.secret;
        })
        .await
    }

    async fn update_password_hash(&self, id: i64, hash: &str) -> Result<()> {
        let hash = hash.to_string();
        self.modify(id, |account| account.password_hash = Some(hash)).await
    }
}

/// HashMap-backed [`BackupCodeStore`]
pub struct InMemoryBackupCodeStore {
    codes: AsyncMutex<HashMap<i64, Vec<StoredBackupCode>>>,
    next_id: AtomicUsize,
}

impl InMemoryBackupCodeStore {
    pub fn new() -> Self {
        Self {
            codes: AsyncMutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub async fn count(&self, account_id: i64) -> usize {
        let codes = self.codes.lock().await;
        codes.get(&account_id).map_or(0, |set| set.len())
    }
}

#[async_trait]
impl BackupCodeStore for InMemoryBackupCodeStore {
    async fn store(&self, account_id: i64, ciphertexts: Vec<Vec<u8>>) -> Result<()> {
        let rows = ciphertexts
            .into_iter()
            .map(|ciphertext| StoredBackupCode {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) as i64,
                ciphertext,
            })
            .collect();
        let mut codes = self.codes.lock().await;
        codes.insert(account_id, rows);
        Ok(())
    }

    async fn load(&self, account_id: i64) -> Result<Vec<StoredBackupCode>> {
        let codes = self.codes.lock().await;
        Ok(codes.get(&account_id).cloned().unwrap_or_default())
    }

    async fn consume(&self, account_id: i64, code_id: i64) -> Result<bool> {
        let mut codes = self.codes.lock().await;
        let Some(set) = codes.get_mut(&account_id) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|row| row.id != code_id);
        Ok(set.len() < before)
    }

    async fn delete_all(&self, account_id: i64) -> Result<()> {
        let mut codes = self.codes.lock().await;
        codes.remove(&account_id);
        Ok(())
    }
}

/// Clock-aware [`MfaTokenStore`]; expiry is checked on read so tests can
/// advance a fixed clock past the TTL
pub struct InMemoryMfaTokenStore {
    tokens: AsyncMutex<HashMap<i64, (String, DateTime<Utc>)>>,
    clock: SharedClock,
}

impl InMemoryMfaTokenStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tokens: AsyncMutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl MfaTokenStore for InMemoryMfaTokenStore {
    async fn issue(&self, account_id: i64, token: &str, ttl_seconds: u64) -> Result<()> {
        let expires_at = self.clock.now() + Duration::seconds(ttl_seconds as i64);
        let mut tokens = self.tokens.lock().await;
        tokens.insert(account_id, (token.to_string(), expires_at));
        Ok(())
    }

    async fn matches(&self, account_id: i64, token: &str) -> Result<bool> {
        let tokens = self.tokens.lock().await;
        Ok(matches!(
            tokens.get(&account_id),
            Some((stored, expires_at)) if stored == token && *expires_at > self.clock.now()
        ))
    }

    async fn consume(&self, account_id: i64, token: &str) -> Result<bool> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get(&account_id) {
            Some((stored, expires_at))
                if stored == token && *expires_at > self.clock.now() =>
            {
                tokens.remove(&account_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(&self, account_id: i64) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        tokens.remove(&account_id);
        Ok(())
    }
}

/// Single-use [`ResetTokenStore`] over a plain map
pub struct InMemoryResetTokenStore {
    tokens: AsyncMutex<HashMap<String, i64>>,
}

impl InMemoryResetTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn issue(&self, token: &str, account_id: i64) {
        let mut tokens = self.tokens.lock().await;
        tokens.insert(token.to_string(), account_id);
    }
}

#[async_trait]
impl ResetTokenStore for InMemoryResetTokenStore {
    async fn consume(&self, token: &str) -> Result<Option<i64>> {
        let mut tokens = self.tokens.lock().await;
        Ok(tokens.remove(token))
    }
}

/// [`TokenRefresher`] that counts calls and returns a canned outcome
pub struct CountingRefresher {
    outcome: Option<(String, Option<String>, i64)>,
    refresh_calls: AtomicUsize,
    refresh_args: Mutex<Vec<String>>,
    revoke_calls: AtomicUsize,
    revocations: Mutex<Vec<String>>,
}

impl CountingRefresher {
    pub fn succeeding(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> Self {
        Self {
            outcome: Some((
                access_token.to_string(),
                refresh_token.map(str::to_string),
                expires_in,
            )),
            refresh_calls: AtomicUsize::new(0),
            refresh_args: Mutex::new(Vec::new()),
            revoke_calls: AtomicUsize::new(0),
            revocations: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            outcome: None,
            refresh_calls: AtomicUsize::new(0),
            refresh_args: Mutex::new(Vec::new()),
            revoke_calls: AtomicUsize::new(0),
            revocations: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented across calls, in order
    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_args.lock().unwrap().clone()
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    pub fn revoked_tokens(&self) -> Vec<String> {
        self.revocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(
        &self,
        _provider: OAuthProvider,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshedTokens> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_args.lock().unwrap().push(refresh_token.to_string());
        match &self.outcome {
            Some((access_token, refresh_token, expires_in)) => Ok(RefreshedTokens {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
                expires_at: now + Duration::seconds(*expires_in),
            }),
            None => Err(anyhow!("simulated provider failure")),
        }
    }

    async fn revoke(&self, _provider: OAuthProvider, access_token: &str) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if self.outcome.is_none() {
            return Err(anyhow!("simulated provider failure"));
        }
        self.revocations.lock().unwrap().push(access_token.to_string());
        Ok(())
    }
}
