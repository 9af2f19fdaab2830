//! Custodial key management for enrolled users
//!
//! Each enrolled user owns exactly one secp256k1 keypair. The private half
//! is written to the key store at a path derived from the username and is
//! only ever read back to sign; callers see the Ethereum address and
//! signatures, never the key.
//!
//! # Layout
//!
//! - [`record`]: `KeyRecord` / `UserRecord` and key-path derivation
//! - [`crypto`]: secp256k1 keygen, EIP-55 addresses, recoverable signatures

pub mod crypto;
pub mod record;

pub use crypto::{
    address_matches_key, checksum_address, ethereum_address, recover_address, Digest, DigestError, Secp256k1Signer,
    DIGEST_LEN, SIGNATURE_LEN,
};
pub use record::{key_path, validate_username, KeyRecord, RecordError, UserRecord, KEY_PATH_PREFIX};
