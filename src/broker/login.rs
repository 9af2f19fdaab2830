//! `login`: delegate credential checks to the IdP, enroll on first login

use std::sync::Arc;

use tracing::{info, warn};

use super::error::{LoginError, Upstream};
use super::provision::Provisioner;
use super::session::GuardianSession;
use super::upstream::{self, CallError};
use crate::backends::{IdpError, SessionToken, UserPresence};
use crate::custodial_keys::validate_username;

pub struct LoginHandler {
    session: Arc<GuardianSession>,
    provisioner: Arc<Provisioner>,
}

impl LoginHandler {
    pub fn new(session: Arc<GuardianSession>, provisioner: Arc<Provisioner>) -> Self {
        Self { session, provisioner }
    }

    /// Authenticate `username` and return the IdP-issued session token.
    ///
    /// Unknown usernames and wrong passwords produce the same
    /// `InvalidCredentials`. A user missing from the directory is
    /// provisioned before the token is handed back; if that fails the
    /// token is discarded and the provisioning error is returned. A user
    /// already in the directory still goes through the provisioner, which
    /// returns the stored address or completes an enrollment whose key
    /// write never landed.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionToken, LoginError> {
        if username.trim().is_empty() {
            return Err(LoginError::MissingField("okta_username"));
        }
        if password.is_empty() {
            return Err(LoginError::MissingField("okta_password"));
        }

        let auth = self
            .session
            .service_token()
            .await
            .ok_or(LoginError::ServiceNotAuthorized)?;

        if validate_username(username).is_err() {
            warn!("Login rejected");
            return Err(LoginError::InvalidCredentials);
        }

        let identity = self.session.collaborators().identity.as_ref();
        let timeout = self.session.settings().upstream_timeout;

        let attempt = identity.login(username, password);
        let token = match upstream::with_timeout(Upstream::IdentityProvider, timeout, attempt).await {
            Ok(token) => token,
            Err(CallError::Failed(IdpError::Rejected)) => {
                warn!("Login rejected");
                return Err(LoginError::InvalidCredentials);
            }
            Err(CallError::Failed(IdpError::Unavailable(msg) | IdpError::Failed(msg))) => {
                warn!(error = %msg, "Identity provider login failed");
                return Err(LoginError::IdentityProviderUnavailable(msg));
            }
            Err(CallError::Timeout(service)) => return Err(LoginError::UpstreamTimeout(service)),
        };

        let auth = &auth;
        let presence = upstream::retry_read_once(Upstream::IdentityProvider, timeout, || {
            identity.user_exists(auth, username)
        })
        .await
        .map_err(|e| match e {
            CallError::Timeout(service) => LoginError::UpstreamTimeout(service),
            CallError::Failed(err) => {
                warn!(username = %username, error = %err, "Directory lookup failed");
                LoginError::DirectoryUnavailable(err.to_string())
            }
        })?;

        let address = self.provisioner.provision_user(username).await?;
        if presence == UserPresence::Absent {
            info!(username = %username, address = %address, "Enrolled user on first login");
        }

        info!(username = %username, "Login succeeded");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryDirectory, InMemoryKeyStore, ServiceToken, StaticAuthority};
    use crate::broker::session::{BrokerSettings, Collaborators};
    use crate::custodial_keys::{Secp256k1Signer, UserRecord};

    struct Fixture {
        handler: LoginHandler,
        store: Arc<InMemoryKeyStore>,
        directory: Arc<InMemoryDirectory>,
    }

    async fn fixture(authorized: bool) -> Fixture {
        let store = Arc::new(InMemoryKeyStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_account("alice", "pw1");
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
        let provisioner = Arc::new(Provisioner::new(session.clone()));
        Fixture {
            handler: LoginHandler::new(session, provisioner),
            store,
            directory,
        }
    }

    #[tokio::test]
    async fn test_first_login_enrolls() {
        let f = fixture(true).await;
        let token = f.handler.login("alice", "pw1").await.unwrap();

        assert!(!token.is_empty());
        assert!(f.directory.user("alice").is_some());
        assert!(f.store.stored_address("guardian/keys/alice").is_some());
    }

    #[tokio::test]
    async fn test_second_login_reuses_key() {
        let f = fixture(true).await;
        f.handler.login("alice", "pw1").await.unwrap();
        let address = f.store.stored_address("guardian/keys/alice");
        f.handler.login("alice", "pw1").await.unwrap();

        assert_eq!(f.store.stored_address("guardian/keys/alice"), address);
        assert_eq!(f.store.write_count(), 1);
        assert_eq!(f.directory.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_present_user_without_key_gets_one() {
        let f = fixture(true).await;
        f.directory
            .insert_user(UserRecord::enrollment("alice", "guardian-enduser").unwrap());

        f.handler.login("alice", "pw1").await.unwrap();
        assert!(f.store.stored_address("guardian/keys/alice").is_some());
        assert_eq!(f.directory.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_login_after_failed_key_write_recovers() {
        let f = fixture(true).await;
        f.store.fail_writes(true);
        assert!(matches!(
            f.handler.login("alice", "pw1").await,
            Err(LoginError::KeyPersistenceFailed(_))
        ));
        assert!(f.directory.user("alice").is_some());

        f.store.fail_writes(false);
        f.handler.login("alice", "pw1").await.unwrap();
        assert!(f.store.stored_address("guardian/keys/alice").is_some());
        assert_eq!(f.directory.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_fails_before_idp() {
        let f = fixture(false).await;
        assert_eq!(
            f.handler.login("alice", "pw1").await.unwrap_err(),
            LoginError::ServiceNotAuthorized
        );
        assert_eq!(f.directory.user_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_the_same() {
        let f = fixture(true).await;
        let unknown = f.handler.login("mallory", "pw1").await.unwrap_err();
        let wrong = f.handler.login("alice", "nope").await.unwrap_err();

        assert_eq!(unknown, wrong);
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let f = fixture(true).await;
        assert_eq!(
            f.handler.login("", "pw1").await.unwrap_err(),
            LoginError::MissingField("okta_username")
        );
        assert_eq!(
            f.handler.login("alice", "").await.unwrap_err(),
            LoginError::MissingField("okta_password")
        );
    }

    #[tokio::test]
    async fn test_provisioning_failure_withholds_token() {
        let f = fixture(true).await;
        f.store.fail_writes(true);

        assert!(matches!(
            f.handler.login("alice", "pw1").await,
            Err(LoginError::KeyPersistenceFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_idp_outage() {
        let f = fixture(true).await;
        f.directory.set_unavailable(true);
        assert!(matches!(
            f.handler.login("alice", "pw1").await,
            Err(LoginError::IdentityProviderUnavailable(_))
        ));
    }
}
