//! Signing broker core
//!
//! Enrolled users never hold their private keys. The broker authorizes
//! itself once with a secret ID, delegates user logins to the identity
//! provider, provisions a keypair on first login, and signs digests on a
//! user's behalf when presented with a valid session token.
//!
//! # Architecture
//!
//! ```text
//!  authorize(secret_id) ──► ServiceAuthority ──► GuardianSession (service token)
//!
//!  login(user, pass) ──► IdentityProvider.login
//!                        └─ user absent? ──► Provisioner
//!                                            ├─ IdentityProvider.create_user
//!                                            ├─ SigningPrimitive.generate_keypair
//!                                            └─ KeyStore.create_if_absent
//!
//!  sign(token, digest) ──► TokenLookup ──► KeyStore.get ──► SigningPrimitive.sign
//! ```
//!
//! Every collaborator call is bounded by the configured upstream timeout
//! (see [`upstream`]).

pub mod authorize;
pub mod error;
pub mod login;
pub mod provision;
pub mod session;
pub mod signing;
pub mod upstream;

use std::sync::Arc;

pub use authorize::AuthorizationHandler;
pub use error::{
    AuthorizationError, LoginError, OperationError, ProvisioningError, ResolutionError, SigningError, Upstream,
};
pub use login::LoginHandler;
pub use provision::Provisioner;
pub use session::{BrokerSettings, Collaborators, GuardianSession, DEFAULT_UPSTREAM_TIMEOUT};
pub use signing::{SignedDigest, SigningHandler, SUPPORTED_ADDRESS_INDEX};

use crate::backends::SessionToken;

/// All broker operations behind one handle
pub struct Broker {
    session: Arc<GuardianSession>,
    authorizer: AuthorizationHandler,
    provisioner: Arc<Provisioner>,
    login: LoginHandler,
    signing: SigningHandler,
}

impl Broker {
    pub fn new(collaborators: Collaborators, settings: BrokerSettings) -> Self {
        let session = Arc::new(GuardianSession::new(collaborators, settings));
        let provisioner = Arc::new(Provisioner::new(session.clone()));
        Self {
            authorizer: AuthorizationHandler::new(session.clone()),
            login: LoginHandler::new(session.clone(), provisioner.clone()),
            signing: SigningHandler::new(session.clone()),
            provisioner,
            session,
        }
    }

    pub fn session(&self) -> &Arc<GuardianSession> {
        &self.session
    }

    pub async fn authorize(&self, secret_id: &str) -> Result<(), AuthorizationError> {
        self.authorizer.authorize(secret_id).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionToken, LoginError> {
        self.login.login(username, password).await
    }

    pub async fn provision_user(&self, username: &str) -> Result<String, ProvisioningError> {
        self.provisioner.provision_user(username).await
    }

    pub async fn get_address(&self, token: &SessionToken) -> Result<String, ResolutionError> {
        self.signing.get_address(token).await
    }

    pub async fn sign(
        &self,
        token: &SessionToken,
        raw_digest: &str,
        address_index: i64,
    ) -> Result<SignedDigest, SigningError> {
        self.signing.sign(token, raw_digest, address_index).await
    }
}
