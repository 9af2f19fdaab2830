//! First-login enrollment: directory registration plus a fresh keypair.
//!
//! Steps run in a fixed order under a per-username lock:
//!
//! 1. a key record already stored for the user short-circuits everything
//! 2. register the `UserRecord` in the directory unless it is already there
//! 3. generate a keypair
//! 4. persist it with an atomic create-if-absent
//!
//! A registration failure stops before any key is generated. A directory
//! record left behind by an earlier attempt whose key write failed is
//! reused, so the next call completes the enrollment. If step 4 finds a
//! record written by another instance, that record wins and the freshly
//! generated key is dropped (and zeroized) without ever being stored.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{ProvisioningError, Upstream};
use super::session::GuardianSession;
use super::upstream::{self, CallError};
use crate::backends::{CreateOutcome, ServiceToken, UserPresence};
use crate::custodial_keys::{key_path, validate_username, UserRecord};

pub struct Provisioner {
    session: Arc<GuardianSession>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Provisioner {
    pub fn new(session: Arc<GuardianSession>) -> Self {
        Self {
            session,
            locks: DashMap::new(),
        }
    }

    /// Enroll `username` and return its Ethereum address.
    ///
    /// Idempotent: concurrent or repeated calls for one username all
    /// return the same address and store exactly one key record.
    pub async fn provision_user(&self, username: &str) -> Result<String, ProvisioningError> {
        validate_username(username).map_err(|e| ProvisioningError::InvalidUsername(e.to_string()))?;
        let auth = self
            .session
            .service_token()
            .await
            .ok_or(ProvisioningError::ServiceNotAuthorized)?;
        let path = key_path(username).map_err(|e| ProvisioningError::InvalidUsername(e.to_string()))?;

        let lease = self.lease(username);
        let _guard = lease.lock.lock().await;
        self.provision_locked(&auth, username, &path).await
    }

    /// Number of usernames with an enrollment currently in flight
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    fn lease<'a>(&'a self, username: &'a str) -> LockLease<'a> {
        let entry = self
            .locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        let lock = Arc::clone(&*entry);
        drop(entry);
        LockLease {
            locks: &self.locks,
            username,
            lock,
        }
    }

    async fn provision_locked(
        &self,
        auth: &ServiceToken,
        username: &str,
        path: &str,
    ) -> Result<String, ProvisioningError> {
        let collaborators = self.session.collaborators();
        let settings = self.session.settings();
        let timeout = settings.upstream_timeout;

        let store = collaborators.key_store.as_ref();
        let existing = upstream::retry_read_once(Upstream::KeyStore, timeout, || store.get(auth, path))
            .await
            .map_err(|e| match e {
                CallError::Timeout(service) => ProvisioningError::UpstreamTimeout(service),
                CallError::Failed(err) => ProvisioningError::KeyPersistenceFailed(err.to_string()),
            })?;
        if let Some(record) = existing {
            debug!(username = %username, "Key already provisioned");
            return Ok(record.public_address_hex().to_string());
        }

        let identity = collaborators.identity.as_ref();
        let presence = upstream::retry_read_once(Upstream::IdentityProvider, timeout, || {
            identity.user_exists(auth, username)
        })
        .await
        .map_err(|e| match e {
            CallError::Timeout(service) => ProvisioningError::UpstreamTimeout(service),
            CallError::Failed(err) => ProvisioningError::DirectoryUnavailable(err.to_string()),
        })?;

        if presence == UserPresence::Present {
            warn!(username = %username, "Directory record has no key, completing enrollment");
        } else {
            let user = UserRecord::enrollment(username, &settings.enrollment_group)
                .map_err(|e| ProvisioningError::InvalidUsername(e.to_string()))?;
            info!(username = %username, group = %settings.enrollment_group, "Enrolling user");
            upstream::with_timeout(Upstream::IdentityProvider, timeout, identity.create_user(auth, &user))
                .await
                .map_err(|e| match e {
                    CallError::Timeout(service) => ProvisioningError::UpstreamTimeout(service),
                    CallError::Failed(err) => {
                        warn!(username = %username, error = %err, "Directory registration failed");
                        ProvisioningError::DirectoryRegistrationFailed(err.to_string())
                    }
                })?;
        }

        let record = upstream::with_timeout(
            Upstream::SigningPrimitive,
            timeout,
            collaborators.signer.generate_keypair(),
        )
        .await
        .map_err(|e| match e {
            CallError::Timeout(service) => ProvisioningError::UpstreamTimeout(service),
            CallError::Failed(_) => ProvisioningError::KeyGenerationFailed,
        })?;

        let outcome = upstream::with_timeout(
            Upstream::KeyStore,
            timeout,
            collaborators.key_store.create_if_absent(auth, path, &record),
        )
        .await
        .map_err(|e| match e {
            CallError::Timeout(service) => ProvisioningError::UpstreamTimeout(service),
            CallError::Failed(err) => {
                warn!(username = %username, error = %err, "Key persistence failed");
                ProvisioningError::KeyPersistenceFailed(err.to_string())
            }
        })?;

        match outcome {
            CreateOutcome::Created => {
                info!(
                    username = %username,
                    address = %record.public_address_hex(),
                    "Provisioned signing key"
                );
                Ok(record.public_address_hex().to_string())
            }
            CreateOutcome::Existing(stored) => {
                info!(username = %username, "Key written concurrently, keeping stored record");
                Ok(stored.public_address_hex().to_string())
            }
        }
    }
}

/// Holds one username's lock handle; drops the map entry once nobody else
/// is waiting on it, including when the enrollment future is cancelled.
struct LockLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    username: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        // Map entry plus this handle
        self.locks.remove_if(self.username, |_, held| {
            Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryDirectory, InMemoryKeyStore, StaticAuthority};
    use crate::broker::session::{BrokerSettings, Collaborators};
    use std::time::Duration;

    use crate::custodial_keys::Secp256k1Signer;

    struct Fixture {
        provisioner: Arc<Provisioner>,
        session: Arc<GuardianSession>,
        store: Arc<InMemoryKeyStore>,
        directory: Arc<InMemoryDirectory>,
    }

    async fn fixture(authorized: bool) -> Fixture {
        let store = Arc::new(InMemoryKeyStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let session = Arc::new(GuardianSession::new(
            Collaborators {
                key_store: store.clone(),
                tokens: directory.clone(),
                identity: directory.clone(),
                authority: Arc::new(StaticAuthority::new(["S1"])),
                signer: Arc::new(Secp256k1Signer::new()),
            },
            BrokerSettings::default(),
        ));
        if authorized {
            session.install(ServiceToken::new("s.test".into()), 0).await;
        }
        Fixture {
            provisioner: Arc::new(Provisioner::new(session.clone())),
            session,
            store,
            directory,
        }
    }

    #[tokio::test]
    async fn test_provision_creates_user_and_key() {
        let f = fixture(true).await;
        let address = f.provisioner.provision_user("alice").await.unwrap();

        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert_eq!(f.store.stored_address("guardian/keys/alice"), Some(address));
        let user = f.directory.user("alice").unwrap();
        assert!(user.groups.contains("guardian-enduser"));
        assert!(user.policies.is_empty());
        assert_eq!(f.provisioner.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_requires_authorization() {
        let f = fixture(false).await;
        assert_eq!(
            f.provisioner.provision_user("alice").await,
            Err(ProvisioningError::ServiceNotAuthorized)
        );
        assert!(f.store.is_empty());
        assert!(!f.session.is_authorized().await);
    }

    #[tokio::test]
    async fn test_directory_failure_generates_no_key() {
        let f = fixture(true).await;
        f.directory.fail_create(true);

        assert!(matches!(
            f.provisioner.provision_user("alice").await,
            Err(ProvisioningError::DirectoryRegistrationFailed(_))
        ));
        assert!(f.store.is_empty());
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_reports_no_key_material() {
        let f = fixture(true).await;
        f.store.fail_writes(true);

        let err = f.provisioner.provision_user("alice").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::KeyPersistenceFailed(_)));
        assert!(!format!("{err} {err:?}").contains("privKeyHex"));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_provision_is_idempotent() {
        let f = fixture(true).await;
        let first = f.provisioner.provision_user("bob").await.unwrap();
        let second = f.provisioner.provision_user("bob").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.store.write_count(), 1);
        assert_eq!(f.directory.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_key_write_is_completed_on_retry() {
        let f = fixture(true).await;
        f.store.fail_writes(true);
        assert!(f.provisioner.provision_user("alice").await.is_err());
        assert!(f.directory.user("alice").is_some());
        assert!(f.store.is_empty());

        f.store.fail_writes(false);
        let address = f.provisioner.provision_user("alice").await.unwrap();

        assert_eq!(f.store.stored_address("guardian/keys/alice"), Some(address));
        assert_eq!(f.directory.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_directory_outage_stops_enrollment() {
        let f = fixture(true).await;
        f.directory.set_unavailable(true);

        assert!(matches!(
            f.provisioner.provision_user("alice").await,
            Err(ProvisioningError::DirectoryUnavailable(_))
        ));
        assert_eq!(f.directory.create_calls(), 0);
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_enrollment_releases_lock() {
        let f = fixture(true).await;
        f.directory.set_latency(Duration::from_secs(5));

        let attempt = f.provisioner.provision_user("alice");
        assert!(tokio::time::timeout(Duration::from_millis(10), attempt).await.is_err());
        assert_eq!(f.provisioner.in_flight(), 0);

        f.directory.set_latency(Duration::ZERO);
        assert!(f.provisioner.provision_user("alice").await.is_ok());
        assert_eq!(f.provisioner.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rejects_path_unsafe_usernames() {
        let f = fixture(true).await;
        for name in ["", "..", "a/b", "a b"] {
            assert!(matches!(
                f.provisioner.provision_user(name).await,
                Err(ProvisioningError::InvalidUsername(_))
            ));
        }
        assert_eq!(f.directory.create_calls(), 0);
    }
}
