//! `authorize`: exchange a one-time secret ID for the service token

use std::sync::Arc;

use tracing::{info, warn};

use super::error::{AuthorizationError, Upstream};
use super::session::GuardianSession;
use super::upstream::{self, CallError};
use crate::backends::{AuthorityError, ServiceToken};

pub struct AuthorizationHandler {
    session: Arc<GuardianSession>,
}

impl AuthorizationHandler {
    pub fn new(session: Arc<GuardianSession>) -> Self {
        Self { session }
    }

    /// Exchange `secret_id` and install the resulting service token.
    ///
    /// On any failure the session keeps whatever state it had before.
    /// The exchange is never retried: secret IDs may be single-use.
    pub async fn authorize(&self, secret_id: &str) -> Result<(), AuthorizationError> {
        if secret_id.trim().is_empty() {
            warn!("Authorize called with an empty secret id");
            return Err(AuthorizationError::InvalidSecret);
        }

        let _serialized = self.session.authorize_lock().lock().await;

        let settings = self.session.settings();
        let authority = &self.session.collaborators().authority;

        let response = match upstream::with_timeout(
            Upstream::ServiceAuthority,
            settings.upstream_timeout,
            authority.exchange(secret_id, &settings.role_id),
        )
        .await
        {
            Ok(response) => response,
            Err(CallError::Failed(AuthorityError::Rejected(_))) => {
                warn!("Service authority rejected the secret id");
                return Err(AuthorizationError::InvalidSecret);
            }
            Err(CallError::Failed(AuthorityError::Unavailable(msg))) => {
                warn!(error = %msg, "Service authority unavailable");
                return Err(AuthorizationError::AuthorityUnavailable(msg));
            }
            Err(CallError::Timeout(service)) => return Err(AuthorizationError::UpstreamTimeout(service)),
        };

        let auth = response
            .auth
            .filter(|auth| !auth.client_token.trim().is_empty())
            .ok_or_else(|| {
                warn!("Service authority returned no client token");
                AuthorizationError::MalformedAuthResponse
            })?;

        let authorized_at = self
            .session
            .install(ServiceToken::new(auth.client_token), auth.lease_duration)
            .await;

        info!(
            authorized_at = %authorized_at,
            lease_seconds = auth.lease_duration,
            "Broker authorized"
        );
        Ok(())
    }
}
