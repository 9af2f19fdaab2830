//! Cryptographic primitives for custodial keys.
//!
//! # Algorithms
//!
//! - **Key Generation**: secp256k1 from the OS CSPRNG
//! - **Address**: last 20 bytes of Keccak-256 over the uncompressed public
//!   key (without the 0x04 tag), rendered with the EIP-55 checksum
//! - **Signing**: recoverable ECDSA over a caller-supplied 32-byte digest,
//!   encoded as `r || s || v` with `v = 27 + recovery id`
//!
//! The broker never hashes payloads itself; callers hash, the broker signs.

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest as _, Keccak256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::backends::{PrimitiveError, SigningPrimitive};

use super::record::KeyRecord;

/// Digest length accepted for signing (32 bytes)
pub const DIGEST_LEN: usize = 32;

/// Encoded signature length (r: 32, s: 32, v: 1)
pub const SIGNATURE_LEN: usize = 65;

/// Offset added to the recovery id to form Ethereum's `v`
const RECOVERY_ID_OFFSET: u8 = 27;

// =============================================================================
// Digest
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest is empty")]
    Empty,

    #[error("digest has an odd number of hex characters")]
    OddLength,

    #[error("digest contains non-hex characters")]
    NotHex,

    #[error("digest is {0} bytes, at most 32 are allowed")]
    TooLong(usize),
}

/// An already-hashed payload, normalised to 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Parse a hex digest. An optional `0x` prefix is accepted; inputs
    /// shorter than 32 bytes are left-padded with zeros, which keeps the
    /// integer the curve signs unchanged.
    pub fn from_hex(raw: &str) -> Result<Self, DigestError> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(DigestError::Empty);
        }
        if body.len() % 2 != 0 {
            return Err(DigestError::OddLength);
        }

        let bytes = hex::decode(body).map_err(|_| DigestError::NotHex)?;
        if bytes.len() > DIGEST_LEN {
            return Err(DigestError::TooLong(bytes.len()));
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest[DIGEST_LEN - bytes.len()..].copy_from_slice(&bytes);
        Ok(Self(digest))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

// =============================================================================
// Keys and addresses
// =============================================================================

/// Generate a new secp256k1 signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

/// Raw 20-byte Ethereum address of a public key.
pub fn ethereum_address(verifying_key: &VerifyingKey) -> [u8; 20] {
    let uncompressed = verifying_key.to_encoded_point(false);
    let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// EIP-55 mixed-case rendering of an address, `0x` prefixed.
pub fn checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn signing_key_from_hex(private_key_hex: &str) -> Result<SigningKey, PrimitiveError> {
    let bytes = Zeroizing::new(hex::decode(private_key_hex).map_err(|_| PrimitiveError::InvalidKey)?);
    SigningKey::from_slice(&bytes).map_err(|_| PrimitiveError::InvalidKey)
}

/// True when the record's address is the one its private key derives.
pub fn address_matches_key(record: &KeyRecord) -> bool {
    signing_key_from_hex(record.private_key_hex())
        .map(|key| checksum_address(&ethereum_address(key.verifying_key())))
        .is_ok_and(|derived| derived.eq_ignore_ascii_case(record.public_address_hex()))
}

/// Build a key record from a signing key.
pub fn key_record(signing_key: &SigningKey) -> Result<KeyRecord, PrimitiveError> {
    let private_key_hex = Zeroizing::new(hex::encode(signing_key.to_bytes()));
    let address = checksum_address(&ethereum_address(signing_key.verifying_key()));
    KeyRecord::new(private_key_hex.to_string(), address).map_err(|_| PrimitiveError::KeyGeneration)
}

// =============================================================================
// Signing
// =============================================================================

/// Sign a digest, returning `r || s || v`.
pub fn sign_digest(signing_key: &SigningKey, digest: &Digest) -> Result<[u8; SIGNATURE_LEN], PrimitiveError> {
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(digest.as_bytes())
        .map_err(|_| PrimitiveError::Signing)?;

    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte() + RECOVERY_ID_OFFSET;
    Ok(out)
}

/// Recover the checksummed signer address from a hex `r || s || v`
/// signature. Returns `None` for anything that does not verify.
pub fn recover_address(digest: &Digest, signature_hex: &str) -> Option<String> {
    let body = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = hex::decode(body).ok()?;
    if bytes.len() != SIGNATURE_LEN {
        return None;
    }

    let v = bytes[64];
    let recovery_byte = if v >= RECOVERY_ID_OFFSET { v - RECOVERY_ID_OFFSET } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte)?;
    let signature = Signature::from_slice(&bytes[..64]).ok()?;

    let verifying_key =
        VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id).ok()?;
    Some(checksum_address(&ethereum_address(&verifying_key)))
}

// =============================================================================
// SigningPrimitive
// =============================================================================

/// In-process secp256k1 signing primitive
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Signer;

impl Secp256k1Signer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SigningPrimitive for Secp256k1Signer {
    async fn generate_keypair(&self) -> Result<KeyRecord, PrimitiveError> {
        key_record(&generate_signing_key())
    }

    async fn sign(&self, private_key_hex: &str, digest: &Digest) -> Result<String, PrimitiveError> {
        let signing_key = signing_key_from_hex(private_key_hex)?;
        let signature = sign_digest(&signing_key, digest)?;
        Ok(format!("0x{}", hex::encode(signature)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test vector (web3.js accounts documentation)
    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const ADDR: &str = "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23";

    #[test]
    fn test_address_from_known_key() {
        let key = signing_key_from_hex(KEY).unwrap();
        let address = checksum_address(&ethereum_address(key.verifying_key()));
        assert_eq!(address, ADDR);
    }

    #[test]
    fn test_address_matches_key() {
        let record = KeyRecord::new(KEY.into(), ADDR.into()).unwrap();
        assert!(address_matches_key(&record));

        let lower = KeyRecord::new(KEY.into(), ADDR.to_lowercase()).unwrap();
        assert!(address_matches_key(&lower));

        let swapped = KeyRecord::new(KEY.into(), format!("0x{}", "ab".repeat(20))).unwrap();
        assert!(!address_matches_key(&swapped));
    }

    #[test]
    fn test_eip55_checksum_vectors() {
        let raw: [u8; 20] = hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(checksum_address(&raw), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");

        let raw: [u8; 20] = hex::decode("fb6916095ca1df60bb79ce92ce3ea74c37c5d359")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(checksum_address(&raw), "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
    }

    #[test]
    fn test_generated_record_is_consistent() {
        let key = generate_signing_key();
        let record = key_record(&key).unwrap();

        let reparsed = signing_key_from_hex(record.private_key_hex()).unwrap();
        let address = checksum_address(&ethereum_address(reparsed.verifying_key()));
        assert_eq!(address, record.public_address_hex());
    }

    #[test]
    fn test_digest_parsing() {
        let short = Digest::from_hex("deadbeef").unwrap();
        assert_eq!(&short.as_bytes()[28..], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(short.as_bytes()[..28].iter().all(|b| *b == 0));

        let full = "11".repeat(32);
        assert_eq!(Digest::from_hex(&format!("0x{full}")).unwrap().as_bytes(), &[0x11; 32]);

        assert_eq!(Digest::from_hex(""), Err(DigestError::Empty));
        assert_eq!(Digest::from_hex("0x"), Err(DigestError::Empty));
        assert_eq!(Digest::from_hex("abc"), Err(DigestError::OddLength));
        assert_eq!(Digest::from_hex("zz"), Err(DigestError::NotHex));
        assert_eq!(Digest::from_hex(&"ab".repeat(33)), Err(DigestError::TooLong(33)));
    }

    #[tokio::test]
    async fn test_sign_then_recover() {
        let signer = Secp256k1Signer::new();
        let record = signer.generate_keypair().await.unwrap();
        let digest = Digest::from_hex(&"ab".repeat(32)).unwrap();

        let signature = signer.sign(record.private_key_hex(), &digest).await.unwrap();
        assert_eq!(signature.len(), 2 + SIGNATURE_LEN * 2);

        let v = u8::from_str_radix(&signature[signature.len() - 2..], 16).unwrap();
        assert!(v == 27 || v == 28);

        assert_eq!(recover_address(&digest, &signature).as_deref(), Some(record.public_address_hex()));
    }

    #[tokio::test]
    async fn test_recover_rejects_other_digest() {
        let signer = Secp256k1Signer::new();
        let record = signer.generate_keypair().await.unwrap();
        let digest = Digest::from_hex("deadbeef").unwrap();
        let other = Digest::from_hex("deadbeee").unwrap();

        let signature = signer.sign(record.private_key_hex(), &digest).await.unwrap();
        assert_ne!(recover_address(&other, &signature).as_deref(), Some(record.public_address_hex()));
        assert_eq!(recover_address(&digest, "0x1234"), None);
    }

    #[tokio::test]
    async fn test_invalid_stored_key() {
        let signer = Secp256k1Signer::new();
        let digest = Digest::from_hex("deadbeef").unwrap();
        assert_eq!(signer.sign("not-hex", &digest).await, Err(PrimitiveError::InvalidKey));
        assert_eq!(
            signer.sign(&"00".repeat(32), &digest).await,
            Err(PrimitiveError::InvalidKey)
        );
    }
}
