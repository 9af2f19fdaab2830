//! Error taxonomy for broker operations
//!
//! Each operation has its own error enum. All of them:
//! - carry an `UpstreamTimeout` variant for collaborator calls that ran out
//!   of time (the one retryable kind)
//! - expose a stable `code()` and an HTTP status for the route layer
//! - never format key material; collaborator messages are the only free
//!   text and collaborators never see private keys in their error paths

use std::fmt;

use thiserror::Error;

use crate::custodial_keys::DigestError;

/// External system a call was made to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Upstream {
    ServiceAuthority,
    IdentityProvider,
    KeyStore,
    TokenLookup,
    SigningPrimitive,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Upstream::ServiceAuthority => "service_authority",
            Upstream::IdentityProvider => "identity_provider",
            Upstream::KeyStore => "key_store",
            Upstream::TokenLookup => "token_lookup",
            Upstream::SigningPrimitive => "signing_primitive",
        };
        f.write_str(name)
    }
}

/// Shared surface used by the route layer to render any operation error
pub trait OperationError: std::error::Error {
    /// Stable machine-readable code
    fn code(&self) -> &'static str;

    /// HTTP status to answer with
    fn http_status(&self) -> u16;

    /// Whether the caller may reasonably retry the same request
    fn is_retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// authorize
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("secret id rejected by the service authority")]
    InvalidSecret,

    #[error("service authority unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("service authority reported success without a usable service token")]
    MalformedAuthResponse,

    #[error("timed out calling {0}")]
    UpstreamTimeout(Upstream),
}

impl OperationError for AuthorizationError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidSecret => "INVALID_SECRET",
            Self::AuthorityUnavailable(_) => "AUTHORITY_UNAVAILABLE",
            Self::MalformedAuthResponse => "MALFORMED_AUTH_RESPONSE",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            Self::InvalidSecret => 401,
            Self::AuthorityUnavailable(_) => 503,
            Self::MalformedAuthResponse => 502,
            Self::UpstreamTimeout(_) => 504,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::AuthorityUnavailable(_) | Self::UpstreamTimeout(_))
    }
}

// =============================================================================
// provisionUser
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("broker has not been authorized")]
    ServiceNotAuthorized,

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("user directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("directory registration failed: {0}")]
    DirectoryRegistrationFailed(String),

    #[error("key generation failed")]
    KeyGenerationFailed,

    #[error("key persistence failed: {0}")]
    KeyPersistenceFailed(String),

    #[error("timed out calling {0}")]
    UpstreamTimeout(Upstream),
}

impl OperationError for ProvisioningError {
    fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotAuthorized => "SERVICE_NOT_AUTHORIZED",
            Self::InvalidUsername(_) => "INVALID_USERNAME",
            Self::DirectoryUnavailable(_) => "DIRECTORY_UNAVAILABLE",
            Self::DirectoryRegistrationFailed(_) => "DIRECTORY_REGISTRATION_FAILED",
            Self::KeyGenerationFailed => "KEY_GENERATION_FAILED",
            Self::KeyPersistenceFailed(_) => "KEY_PERSISTENCE_FAILED",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            Self::ServiceNotAuthorized => 503,
            Self::InvalidUsername(_) => 400,
            Self::DirectoryUnavailable(_) => 503,
            Self::DirectoryRegistrationFailed(_) => 502,
            Self::KeyGenerationFailed => 500,
            Self::KeyPersistenceFailed(_) => 502,
            Self::UpstreamTimeout(_) => 504,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_) | Self::DirectoryUnavailable(_))
    }
}

// =============================================================================
// login
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("broker has not been authorized")]
    ServiceNotAuthorized,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Same answer for unknown users and wrong passwords.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("identity provider unavailable: {0}")]
    IdentityProviderUnavailable(String),

    #[error("user directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("directory registration failed: {0}")]
    DirectoryRegistrationFailed(String),

    #[error("key generation failed")]
    KeyGenerationFailed,

    #[error("key persistence failed: {0}")]
    KeyPersistenceFailed(String),

    #[error("timed out calling {0}")]
    UpstreamTimeout(Upstream),
}

impl From<ProvisioningError> for LoginError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::ServiceNotAuthorized => Self::ServiceNotAuthorized,
            // Login validates usernames before the IdP is consulted
            ProvisioningError::InvalidUsername(_) => Self::InvalidCredentials,
            ProvisioningError::DirectoryUnavailable(m) => Self::DirectoryUnavailable(m),
            ProvisioningError::DirectoryRegistrationFailed(m) => Self::DirectoryRegistrationFailed(m),
            ProvisioningError::KeyGenerationFailed => Self::KeyGenerationFailed,
            ProvisioningError::KeyPersistenceFailed(m) => Self::KeyPersistenceFailed(m),
            ProvisioningError::UpstreamTimeout(s) => Self::UpstreamTimeout(s),
        }
    }
}

impl OperationError for LoginError {
    fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotAuthorized => "SERVICE_NOT_AUTHORIZED",
            Self::MissingField(_) => "MISSING_FIELD",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::IdentityProviderUnavailable(_) => "IDP_UNAVAILABLE",
            Self::DirectoryUnavailable(_) => "DIRECTORY_UNAVAILABLE",
            Self::DirectoryRegistrationFailed(_) => "DIRECTORY_REGISTRATION_FAILED",
            Self::KeyGenerationFailed => "KEY_GENERATION_FAILED",
            Self::KeyPersistenceFailed(_) => "KEY_PERSISTENCE_FAILED",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            Self::ServiceNotAuthorized => 503,
            Self::MissingField(_) => 400,
            Self::InvalidCredentials => 401,
            Self::IdentityProviderUnavailable(_) | Self::DirectoryUnavailable(_) => 503,
            Self::DirectoryRegistrationFailed(_) | Self::KeyPersistenceFailed(_) => 502,
            Self::KeyGenerationFailed => 500,
            Self::UpstreamTimeout(_) => 504,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::IdentityProviderUnavailable(_) | Self::DirectoryUnavailable(_)
        )
    }
}

// =============================================================================
// getAddress / sign
// =============================================================================

/// Failures resolving a session token to a stored key
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("broker has not been authorized")]
    ServiceNotAuthorized,

    #[error("session token is invalid or carries no username")]
    InvalidToken,

    #[error("no signing key has been provisioned for this user")]
    NoKeyProvisioned,

    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("stored key record is corrupt")]
    CorruptKeyRecord,

    #[error("timed out calling {0}")]
    UpstreamTimeout(Upstream),
}

impl OperationError for ResolutionError {
    fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotAuthorized => "SERVICE_NOT_AUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::NoKeyProvisioned => "NO_KEY_PROVISIONED",
            Self::KeyStoreUnavailable(_) => "KEY_STORE_UNAVAILABLE",
            Self::CorruptKeyRecord => "CORRUPT_KEY_RECORD",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            Self::ServiceNotAuthorized => 503,
            Self::InvalidToken => 401,
            Self::NoKeyProvisioned => 404,
            Self::KeyStoreUnavailable(_) => 503,
            Self::CorruptKeyRecord => 500,
            Self::UpstreamTimeout(_) => 504,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_) | Self::KeyStoreUnavailable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("address index {0} is not supported, only 0 is")]
    UnsupportedAddressIndex(i64),

    #[error("invalid digest encoding: {0}")]
    InvalidDigestEncoding(#[from] DigestError),

    #[error("signing failed")]
    SigningFailed,

    #[error("timed out calling {0}")]
    UpstreamTimeout(Upstream),
}

impl OperationError for SigningError {
    fn code(&self) -> &'static str {
        match self {
            Self::Resolution(inner) => inner.code(),
            Self::UnsupportedAddressIndex(_) => "UNSUPPORTED_ADDRESS_INDEX",
            Self::InvalidDigestEncoding(_) => "INVALID_DIGEST_ENCODING",
            Self::SigningFailed => "SIGNING_FAILED",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            Self::Resolution(inner) => inner.http_status(),
            Self::UnsupportedAddressIndex(_) | Self::InvalidDigestEncoding(_) => 400,
            Self::SigningFailed => 500,
            Self::UpstreamTimeout(_) => 504,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution(inner) => inner.is_retryable(),
            Self::UpstreamTimeout(_) => true,
            _ => false,
        }
    }
}
