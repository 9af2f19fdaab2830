//! `getAddress` and `sign`: resolve a session token to its key record
//!
//! Resolution order is token lookup, username from token metadata, key
//! path, key store read. The private key is borrowed only for the signing
//! call and is dropped (zeroized) with the record when the call returns.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{ResolutionError, SigningError, Upstream};
use super::session::GuardianSession;
use super::upstream::{self, CallError};
use crate::backends::{SessionToken, StoreError};
use crate::custodial_keys::{address_matches_key, key_path, Digest, KeyRecord};

/// Only index 0 is served; each user owns one key
pub const SUPPORTED_ADDRESS_INDEX: i64 = 0;

/// Successful signing result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedDigest {
    /// `0x` + r || s || v
    pub signature: String,
    pub address: String,
}

struct Resolved {
    username: String,
    record: KeyRecord,
}

pub struct SigningHandler {
    session: Arc<GuardianSession>,
}

impl SigningHandler {
    pub fn new(session: Arc<GuardianSession>) -> Self {
        Self { session }
    }

    /// Address of the key belonging to the token's user
    pub async fn get_address(&self, token: &SessionToken) -> Result<String, ResolutionError> {
        let resolved = self.resolve(token).await?;
        debug!(username = %resolved.username, "Resolved address");
        Ok(resolved.record.public_address_hex().to_string())
    }

    /// Sign an already-hashed digest with the token user's key.
    ///
    /// Input checks run before any collaborator is called, so an
    /// unsupported index or bad digest fails the same way for every token.
    pub async fn sign(
        &self,
        token: &SessionToken,
        raw_digest: &str,
        address_index: i64,
    ) -> Result<SignedDigest, SigningError> {
        if address_index != SUPPORTED_ADDRESS_INDEX {
            return Err(SigningError::UnsupportedAddressIndex(address_index));
        }
        let digest = Digest::from_hex(raw_digest)?;

        let resolved = self.resolve(token).await?;
        let signer = self.session.collaborators().signer.as_ref();
        let timeout = self.session.settings().upstream_timeout;

        let signature = upstream::with_timeout(
            Upstream::SigningPrimitive,
            timeout,
            signer.sign(resolved.record.private_key_hex(), &digest),
        )
        .await
        .map_err(|e| match e {
            CallError::Timeout(service) => SigningError::UpstreamTimeout(service),
            CallError::Failed(err) => {
                warn!(username = %resolved.username, error = %err, "Signing failed");
                SigningError::SigningFailed
            }
        })?;

        info!(
            username = %resolved.username,
            address_index,
            digest_hex_len = raw_digest.len(),
            "Signed digest"
        );
        Ok(SignedDigest {
            signature,
            address: resolved.record.public_address_hex().to_string(),
        })
    }

    async fn resolve(&self, token: &SessionToken) -> Result<Resolved, ResolutionError> {
        if token.is_empty() {
            return Err(ResolutionError::InvalidToken);
        }
        let auth = self
            .session
            .service_token()
            .await
            .ok_or(ResolutionError::ServiceNotAuthorized)?;
        let auth = &auth;

        let collaborators = self.session.collaborators();
        let timeout = self.session.settings().upstream_timeout;

        let tokens = collaborators.tokens.as_ref();
        let info = upstream::retry_read_once(Upstream::TokenLookup, timeout, || tokens.lookup_token(auth, token))
            .await
            .map_err(|e| match e {
                CallError::Timeout(service) => ResolutionError::UpstreamTimeout(service),
                CallError::Failed(err) => {
                    warn!(error = %err, "Token lookup failed");
                    ResolutionError::InvalidToken
                }
            })?
            .ok_or(ResolutionError::InvalidToken)?;

        let username = info.username().ok_or(ResolutionError::InvalidToken)?.to_string();
        let path = key_path(&username).map_err(|_| {
            warn!("Token metadata carries an unusable username");
            ResolutionError::InvalidToken
        })?;
        let path = path.as_str();

        let store = collaborators.key_store.as_ref();
        let record = upstream::retry_read_once(Upstream::KeyStore, timeout, || store.get(auth, path))
            .await
            .map_err(|e| match e {
                CallError::Timeout(service) => ResolutionError::UpstreamTimeout(service),
                CallError::Failed(StoreError::Malformed { .. }) => {
                    warn!(username = %username, "Stored key record is malformed");
                    ResolutionError::CorruptKeyRecord
                }
                CallError::Failed(err) => ResolutionError::KeyStoreUnavailable(err.to_string()),
            })?
            .ok_or(ResolutionError::NoKeyProvisioned)?;

        if record.validate().is_err() {
            warn!(username = %username, "Stored key record failed validation");
            return Err(ResolutionError::CorruptKeyRecord);
        }
        if !address_matches_key(&record) {
            warn!(username = %username, "Stored address does not belong to the stored key");
            return Err(ResolutionError::CorruptKeyRecord);
        }

        Ok(Resolved { username, record })
    }
}
