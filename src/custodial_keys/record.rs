//! Data model for enrolled users and their custody keys.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Prefix under the key store mount for all key records
pub const KEY_PATH_PREFIX: &str = "guardian/keys";

/// Longest username accepted as a path segment
const MAX_USERNAME_LEN: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),

    #[error("private key must be {expected} hex characters")]
    InvalidPrivateKey { expected: usize },

    #[error("address must be 0x followed by 40 hex characters")]
    InvalidAddress,

    #[error("enrollment group '{0}' missing from user groups")]
    MissingEnrollmentGroup(String),
}

/// Check that a username can safely address a key-store path.
pub fn validate_username(username: &str) -> Result<(), RecordError> {
    if username.is_empty() {
        return Err(RecordError::InvalidUsername("empty"));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(RecordError::InvalidUsername("too long"));
    }
    if username == "." || username == ".." {
        return Err(RecordError::InvalidUsername("reserved path segment"));
    }
    if username
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
    {
        return Err(RecordError::InvalidUsername("contains separator or whitespace"));
    }
    Ok(())
}

/// Key-store path for a user's key record. Depends on the username only.
pub fn key_path(username: &str) -> Result<String, RecordError> {
    validate_username(username)?;
    Ok(format!("{KEY_PATH_PREFIX}/{username}"))
}

// =============================================================================
// KeyRecord
// =============================================================================

/// One user's custody key.
///
/// Both halves come from a single generation event. The record is wiped
/// from memory on drop and its `Debug` output never shows the private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRecord {
    #[serde(rename = "privKeyHex")]
    private_key_hex: String,

    #[serde(rename = "publicAddressHex")]
    public_address_hex: String,
}

impl KeyRecord {
    /// Hex length of a 32-byte private key
    pub const PRIVATE_KEY_HEX_LEN: usize = 64;

    pub fn new(private_key_hex: String, public_address_hex: String) -> Result<Self, RecordError> {
        let record = Self {
            private_key_hex,
            public_address_hex,
        };
        record.validate()?;
        Ok(record)
    }

    /// Shape check for records read back from storage
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.private_key_hex.len() != Self::PRIVATE_KEY_HEX_LEN
            || !self.private_key_hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(RecordError::InvalidPrivateKey {
                expected: Self::PRIVATE_KEY_HEX_LEN,
            });
        }

        let body = self
            .public_address_hex
            .strip_prefix("0x")
            .ok_or(RecordError::InvalidAddress)?;
        if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RecordError::InvalidAddress);
        }

        Ok(())
    }

    pub fn public_address_hex(&self) -> &str {
        &self.public_address_hex
    }

    /// Raw private key. Only the signing path reads this.
    pub(crate) fn private_key_hex(&self) -> &str {
        &self.private_key_hex
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("private_key_hex", &"<redacted>")
            .field("public_address_hex", &self.public_address_hex)
            .finish()
    }
}

// =============================================================================
// UserRecord
// =============================================================================

/// Directory entry for one enrolled end user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub policies: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl UserRecord {
    /// Record created at enrollment: the enrollment group and no policies.
    pub fn enrollment(username: &str, enrollment_group: &str) -> Result<Self, RecordError> {
        Self::new(
            username,
            BTreeSet::from([enrollment_group.to_string()]),
            BTreeSet::new(),
            enrollment_group,
        )
    }

    pub fn new(
        username: &str,
        groups: BTreeSet<String>,
        policies: BTreeSet<String>,
        enrollment_group: &str,
    ) -> Result<Self, RecordError> {
        validate_username(username)?;
        if !groups.contains(enrollment_group) {
            return Err(RecordError::MissingEnrollmentGroup(enrollment_group.to_string()));
        }
        Ok(Self {
            username: username.to_string(),
            policies,
            groups,
        })
    }

    /// Comma-joined groups, the form directory APIs accept
    pub fn groups_csv(&self) -> String {
        self.groups.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Comma-joined policies (empty string when there are none)
    pub fn policies_csv(&self) -> String {
        self.policies.iter().cloned().collect::<Vec<_>>().join(",")
    }
}
