//! Process-wide broker session
//!
//! Holds the service credential obtained by `authorize` together with the
//! collaborator handles every operation needs. The credential moves
//! `Unauthorized -> Authorized` and is replaced wholesale on
//! re-authorization; it is never observable half-written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::backends::{IdentityProvider, KeyStore, ServiceAuthority, ServiceToken, SigningPrimitive, TokenLookup};
use crate::config::{DEFAULT_ENROLLMENT_GROUP, DEFAULT_ROLE_ID};

/// Default deadline for a single collaborator call
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles to the external systems the broker consumes
#[derive(Clone)]
pub struct Collaborators {
    pub key_store: Arc<dyn KeyStore>,
    pub tokens: Arc<dyn TokenLookup>,
    pub identity: Arc<dyn IdentityProvider>,
    pub authority: Arc<dyn ServiceAuthority>,
    pub signer: Arc<dyn SigningPrimitive>,
}

/// Tunables that are fixed for the life of the process
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub role_id: String,
    pub enrollment_group: String,
    pub upstream_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            role_id: DEFAULT_ROLE_ID.to_string(),
            enrollment_group: DEFAULT_ENROLLMENT_GROUP.to_string(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
enum ServiceAuthState {
    Unauthorized,
    Authorized {
        token: ServiceToken,
        authorized_at: DateTime<Utc>,
        lease_seconds: u64,
    },
}

/// Shared state for all broker operations
pub struct GuardianSession {
    state: RwLock<ServiceAuthState>,
    /// Serializes authorize calls so exchanges never interleave
    authorize_lock: Mutex<()>,
    collaborators: Collaborators,
    settings: BrokerSettings,
}

impl GuardianSession {
    pub fn new(collaborators: Collaborators, settings: BrokerSettings) -> Self {
        Self {
            state: RwLock::new(ServiceAuthState::Unauthorized),
            authorize_lock: Mutex::new(()),
            collaborators,
            settings,
        }
    }

    /// Current service credential, if the broker has been authorized.
    ///
    /// Never waits on an in-flight authorize: the exchange runs outside
    /// the state lock, so callers see the previous state until the new
    /// token is installed.
    pub async fn service_token(&self) -> Option<ServiceToken> {
        match &*self.state.read().await {
            ServiceAuthState::Authorized { token, .. } => Some(token.clone()),
            ServiceAuthState::Unauthorized => None,
        }
    }

    pub async fn is_authorized(&self) -> bool {
        matches!(*self.state.read().await, ServiceAuthState::Authorized { .. })
    }

    pub async fn authorized_at(&self) -> Option<DateTime<Utc>> {
        match &*self.state.read().await {
            ServiceAuthState::Authorized { authorized_at, .. } => Some(*authorized_at),
            ServiceAuthState::Unauthorized => None,
        }
    }

    /// Lease reported by the authority for the current token (0 = unknown)
    pub async fn lease_seconds(&self) -> Option<u64> {
        match &*self.state.read().await {
            ServiceAuthState::Authorized { lease_seconds, .. } => Some(*lease_seconds),
            ServiceAuthState::Unauthorized => None,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub(super) fn authorize_lock(&self) -> &Mutex<()> {
        &self.authorize_lock
    }

    /// Replace the service credential. Only the authorize path calls this.
    pub(super) async fn install(&self, token: ServiceToken, lease_seconds: u64) -> DateTime<Utc> {
        let authorized_at = Utc::now();
        *self.state.write().await = ServiceAuthState::Authorized {
            token,
            authorized_at,
            lease_seconds,
        };
        authorized_at
    }
}

impl std::fmt::Debug for GuardianSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianSession")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
