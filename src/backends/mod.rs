//! Collaborator capabilities consumed by the broker
//!
//! The broker core never talks to a vendor SDK directly. Each external
//! system is reached through a narrow trait so tests can substitute fakes
//! that implement exactly that capability set:
//!
//! - [`KeyStore`]: get / put / atomic create-if-absent of key records
//! - [`TokenLookup`]: resolves a session token to its metadata
//! - [`IdentityProvider`]: delegated login plus the user directory
//! - [`ServiceAuthority`]: secret-ID for service-token exchange
//! - [`SigningPrimitive`]: keypair generation and digest signing
//!
//! Concrete implementations live in [`memory`] (in-process fakes used in
//! dev mode and tests) and [`vault`] / [`okta`] (HTTP adapters).

pub mod memory;
pub mod okta;
pub mod vault;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::custodial_keys::{Digest, KeyRecord, UserRecord};

pub use memory::{InMemoryDirectory, InMemoryKeyStore, StaticAuthority};
pub use okta::OktaClient;
pub use vault::{VaultClient, VaultSettings};

// =============================================================================
// Tokens
// =============================================================================

/// Credential proving the broker itself is authorized to call upstream.
///
/// Only produced from a successful service authority exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceToken(Zeroizing<String>);

impl ServiceToken {
    pub(crate) fn new(token: String) -> Self {
        Self(Zeroizing::new(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceToken(<redacted>)")
    }
}

/// Per-user bearer credential issued by the IdP-backed login.
///
/// The broker never stores these; validity is decided by [`TokenLookup`].
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Zeroizing<String>);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

// =============================================================================
// Value types
// =============================================================================

/// Result of an atomic create-if-absent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record was written by this call
    Created,
    /// A record already existed; it is returned unchanged
    Existing(KeyRecord),
}

/// Explicit answer to "does this account exist?".
///
/// Transport failures are reported through the `Err` side, never folded
/// into `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPresence {
    Present,
    Absent,
}

/// Metadata attached to a live session token
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl TokenInfo {
    /// Username recorded on the token, if any (blank values count as missing)
    pub fn username(&self) -> Option<&str> {
        self.meta
            .get("username")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Credential payload returned by a successful exchange
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAuth {
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: u64,
}

/// Raw exchange response. `auth` may be absent even on success.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeResponse {
    #[serde(default)]
    pub auth: Option<ServiceAuth>,
}

// =============================================================================
// Collaborator errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key store unavailable: {0}")]
    Unavailable(String),

    #[error("key store rejected request: {0}")]
    Rejected(String),

    #[error("malformed record at {path}")]
    Malformed { path: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdpError {
    /// Credentials were refused. Carries no detail.
    #[error("credentials rejected")]
    Rejected,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("identity provider request failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("exchange rejected: {0}")]
    Rejected(String),

    #[error("service authority unavailable: {0}")]
    Unavailable(String),
}

/// Signing primitive failures. Messages are fixed so no key-derived
/// material can reach them.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PrimitiveError {
    #[error("key generation failed")]
    KeyGeneration,

    #[error("stored key is not a valid secp256k1 scalar")]
    InvalidKey,

    #[error("signing operation failed")]
    Signing,
}

// =============================================================================
// Capabilities
// =============================================================================

/// Durable storage of key records keyed by username-derived path
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, auth: &ServiceToken, path: &str) -> Result<Option<KeyRecord>, StoreError>;

    async fn put(&self, auth: &ServiceToken, path: &str, record: &KeyRecord) -> Result<(), StoreError>;

    /// Write `record` only if nothing is stored at `path`; otherwise return
    /// what is there. Must be atomic with respect to concurrent callers.
    async fn create_if_absent(
        &self,
        auth: &ServiceToken,
        path: &str,
        record: &KeyRecord,
    ) -> Result<CreateOutcome, StoreError>;
}

/// Token introspection of the key store's authorization layer
#[async_trait]
pub trait TokenLookup: Send + Sync {
    /// `Ok(None)` means the token is unknown, expired or revoked
    async fn lookup_token(
        &self,
        auth: &ServiceToken,
        token: &SessionToken,
    ) -> Result<Option<TokenInfo>, StoreError>;
}

/// Delegated login and the IdP-side user directory
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<SessionToken, IdpError>;

    async fn user_exists(&self, auth: &ServiceToken, username: &str) -> Result<UserPresence, IdpError>;

    async fn create_user(&self, auth: &ServiceToken, user: &UserRecord) -> Result<(), IdpError>;
}

/// Service-to-service credential exchange
#[async_trait]
pub trait ServiceAuthority: Send + Sync {
    async fn exchange(&self, secret_id: &str, role_id: &str) -> Result<ExchangeResponse, AuthorityError>;
}

/// Keypair generation and signing over an already-hashed digest
#[async_trait]
pub trait SigningPrimitive: Send + Sync {
    async fn generate_keypair(&self) -> Result<KeyRecord, PrimitiveError>;

    /// Returns the hex signature encoding only
    async fn sign(&self, private_key_hex: &str, digest: &Digest) -> Result<String, PrimitiveError>;
}
