//! In-memory collaborators
//!
//! Used by `--dev-mode` and by tests. Each fake implements only its
//! capability traits and supports simple failure and latency injection so
//! error paths can be exercised without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::custodial_keys::{KeyRecord, UserRecord};

use super::{
    AuthorityError, CreateOutcome, ExchangeResponse, IdentityProvider, IdpError, KeyStore,
    ServiceAuth, ServiceAuthority, ServiceToken, SessionToken, StoreError, TokenInfo, TokenLookup,
    UserPresence,
};

/// Optional artificial latency, in milliseconds
#[derive(Debug, Default)]
struct Latency(AtomicU64);

impl Latency {
    fn set(&self, latency: Duration) {
        self.0.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn wait(&self) {
        let ms = self.0.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

// =============================================================================
// Key store
// =============================================================================

/// Key store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    records: DashMap<String, KeyRecord>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    latency: Latency,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of successful writes (put + created)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Address stored at `path`, without going through a service token
    pub fn stored_address(&self, path: &str) -> Option<String> {
        self.records.get(path).map(|r| r.public_address_hex().to_string())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get(&self, _auth: &ServiceToken, path: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.latency.wait().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.get(path).map(|r| r.clone()))
    }

    async fn put(&self, _auth: &ServiceToken, path: &str, record: &KeyRecord) -> Result<(), StoreError> {
        self.latency.wait().await;
        self.check_write()?;
        self.records.insert(path.to_string(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_if_absent(
        &self,
        _auth: &ServiceToken,
        path: &str,
        record: &KeyRecord,
    ) -> Result<CreateOutcome, StoreError> {
        self.latency.wait().await;
        self.check_write()?;
        match self.records.entry(path.to_string()) {
            Entry::Occupied(existing) => {
                debug!(path = %path, "create_if_absent found existing record");
                Ok(CreateOutcome::Existing(existing.get().clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(CreateOutcome::Created)
            }
        }
    }
}

// =============================================================================
// Identity provider + token lookup
// =============================================================================

/// Identity provider fake: an account table (the IdP org), a directory of
/// enrolled users, and the session tokens it has issued.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    accounts: DashMap<String, String>,
    users: DashMap<String, UserRecord>,
    sessions: DashMap<String, TokenInfo>,
    revoked: DashSet<String>,
    fail_create: AtomicBool,
    fail_lookup: AtomicBool,
    unavailable: AtomicBool,
    latency: Latency,
    create_calls: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an IdP account that can log in
    pub fn add_account(&self, username: &str, password: &str) {
        self.accounts.insert(username.to_string(), password.to_string());
    }

    /// Seed a directory record without going through enrollment
    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.username.clone(), user);
    }

    pub fn user(&self, username: &str) -> Option<UserRecord> {
        self.users.get(username).map(|u| u.clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Invalidate a previously issued session token
    pub fn revoke(&self, token: &SessionToken) {
        self.sessions.remove(token.as_str());
        self.revoked.insert(token.as_str().to_string());
    }

    /// Issue a token carrying arbitrary metadata (e.g. no username)
    pub fn issue_raw_token(&self, meta: HashMap<String, String>) -> SessionToken {
        let token = format!("s.{}", uuid::Uuid::new_v4().simple());
        self.sessions.insert(token.clone(), TokenInfo { meta });
        SessionToken::new(token)
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookup(&self, fail: bool) {
        self.fail_lookup.store(fail, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    fn check_available(&self) -> Result<(), IdpError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdpError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryDirectory {
    async fn login(&self, username: &str, password: &str) -> Result<SessionToken, IdpError> {
        self.latency.wait().await;
        self.check_available()?;

        let accepted = self
            .accounts
            .get(username)
            .map(|stored| stored.value() == password)
            .unwrap_or(false);
        if !accepted {
            return Err(IdpError::Rejected);
        }

        Ok(self.issue_raw_token(HashMap::from([("username".to_string(), username.to_string())])))
    }

    async fn user_exists(&self, _auth: &ServiceToken, username: &str) -> Result<UserPresence, IdpError> {
        self.latency.wait().await;
        self.check_available()?;
        Ok(if self.users.contains_key(username) {
            UserPresence::Present
        } else {
            UserPresence::Absent
        })
    }

    async fn create_user(&self, _auth: &ServiceToken, user: &UserRecord) -> Result<(), IdpError> {
        self.latency.wait().await;
        self.check_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(IdpError::Failed("injected directory failure".into()));
        }
        self.users.insert(user.username.clone(), user.clone());
        Ok(())
    }
}

#[async_trait]
impl TokenLookup for InMemoryDirectory {
    async fn lookup_token(
        &self,
        _auth: &ServiceToken,
        token: &SessionToken,
    ) -> Result<Option<TokenInfo>, StoreError> {
        self.latency.wait().await;
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected lookup failure".into()));
        }
        if self.revoked.contains(token.as_str()) {
            return Ok(None);
        }
        Ok(self.sessions.get(token.as_str()).map(|info| info.clone()))
    }
}

// =============================================================================
// Service authority
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AuthorityMode {
    #[default]
    Normal,
    Malformed,
    Unavailable,
}

/// Service authority that accepts a fixed set of secret IDs
#[derive(Debug, Default)]
pub struct StaticAuthority {
    secrets: DashSet<String>,
    mode: std::sync::Mutex<AuthorityMode>,
    latency: Latency,
    issued: AtomicUsize,
}

impl StaticAuthority {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let authority = Self::default();
        for secret in secrets {
            authority.secrets.insert(secret.into());
        }
        authority
    }

    /// Answer successful exchanges without any credential payload
    pub fn respond_malformed(&self, malformed: bool) {
        self.set_mode(if malformed { AuthorityMode::Malformed } else { AuthorityMode::Normal });
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.set_mode(if unavailable { AuthorityMode::Unavailable } else { AuthorityMode::Normal });
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// Number of tokens issued so far
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn set_mode(&self, mode: AuthorityMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }

    fn mode(&self) -> AuthorityMode {
        self.mode.lock().map(|m| *m).unwrap_or_default()
    }
}

#[async_trait]
impl ServiceAuthority for StaticAuthority {
    async fn exchange(&self, secret_id: &str, _role_id: &str) -> Result<ExchangeResponse, AuthorityError> {
        self.latency.wait().await;
        match self.mode() {
            AuthorityMode::Unavailable => {
                return Err(AuthorityError::Unavailable("injected outage".into()))
            }
            AuthorityMode::Malformed => return Ok(ExchangeResponse { auth: None }),
            AuthorityMode::Normal => {}
        }

        if !self.secrets.contains(secret_id) {
            return Err(AuthorityError::Rejected("invalid secret id".into()));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExchangeResponse {
            auth: Some(ServiceAuth {
                client_token: format!("s.service-{n}"),
                lease_duration: 3600,
            }),
        })
    }
}
