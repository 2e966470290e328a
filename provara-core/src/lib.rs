//! provara-core — Provara Protocol v1.0 Core Implementation
//!
//! This crate provides the core cryptographic substrate and algorithms
//! for the Provara Protocol, including:
//!
//! - Ed25519 signing and verification (RFC 8032)
//! - SHA-256 hashing (FIPS 180-4)
//! - Content-addressed events and causal chains
//! - Key registry and the two-event rotation ceremony
//! - The deterministic four-namespace belief reducer
//! - Vault directories with manifest + Merkle integrity
//! - Union-merge sync with fencing tokens
//! - The phased chain validator
//!
//! ## Example
//!
//! ```rust
//! use provara_core::{create_event, verify_event_signature, EventKind, KeyPair, Namespace};
//! use rand::thread_rng;
//!
//! // Generate a new keypair
//! let mut rng = thread_rng();
//! let keypair = KeyPair::generate(&mut rng);
//!
//! // Create a signed event
//! let event = create_event(
//!     &EventKind::Observation,
//!     "alice",
//!     &keypair,
//!     None,
//!     Namespace::Local,
//!     "2026-01-01T00:00:00Z",
//!     None,
//!     serde_json::json!({"subject": "door", "predicate": "status", "value": "open"}),
//! ).unwrap();
//!
//! // Verify the signature
//! assert!(verify_event_signature(&event, &keypair.public_key()).unwrap());
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

pub use jcs_rs::{canonical_hash, canonical_hash_hex, canonical_to_string, canonicalize};

pub mod chain;
pub mod error;
pub mod event;
pub mod keys;
pub mod manifest;
pub mod reducer;
pub mod sync;
pub mod validator;
pub mod vault;

pub use chain::{actor_heads, detect_forks, log_head, verify_causal_chain, ActorChain, Fork};
pub use error::{ErrorCode, ProvaraError, ValidationError};
pub use event::{
    create_event, derive_event_id, sign_event, verify_event_signature, Event, EventKind, Namespace,
};
pub use keys::{KeyRecord, KeyRegistry, KeyStatus, Revocation};
pub use manifest::{
    build_manifest, compute_merkle_root, sign_manifest, verify_manifest_signature, FileEntry,
    Manifest,
};
pub use reducer::{
    reduce, BeliefEntry, ContestedEntry, Evidence, ReducerState, SovereignReducerV0, StateMetadata,
};
pub use sync::{
    export_delta, merge_delta, mint_fencing_token, parse_delta, union_merge, verify_fencing_token,
    DeltaHeader, FencingToken, MergeReport,
};
pub use validator::{validate_events, validate_log, validate_vault, ValidationReport, ValidatorOptions};
pub use vault::{now_timestamp, Vault, VaultLock};

#[cfg(test)]
mod conformance;
#[cfg(test)]
mod test_vectors;

/// Protocol version declared in genesis events.
pub const PROTOCOL_VERSION: &str = "1.0";
/// Conformance profile implemented by this crate.
pub const PROFILE: &str = "PROVARA-1.0_PROFILE_A";

/// A public/private keypair for Ed25519 signing
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        let verifying_key = VerifyingKey::from(&signing_key);

        KeyPair {
            signing_key,
            verifying_key,
        }
    }

    /// Create a keypair from raw seed bytes
    pub fn from_bytes(seed: &[u8; 32]) -> Result<Self, ProvaraError> {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(KeyPair {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Get the key ID (bp1_ prefix + first 16 hex chars of SHA-256(public_key))
    pub fn key_id(&self) -> Result<String, ProvaraError> {
        derive_key_id(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the raw seed bytes (32-byte private key material)
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Generate a fresh keypair from the operating system RNG.
pub fn create_key() -> Result<(KeyPair, String), ProvaraError> {
    use rand_core::OsRng;
    let keypair = KeyPair::generate(&mut OsRng);
    let key_id = keypair.key_id()?;
    Ok((keypair, key_id))
}

/// Derive a key ID from public key bytes according to Provara spec
///
/// key_id = "bp1_" + SHA-256(raw_public_key_bytes)[:16 hex chars]
pub fn derive_key_id(public_key_bytes: &[u8; 32]) -> Result<String, ProvaraError> {
    let mut hasher = Sha256::new();
    hasher.update(public_key_bytes);
    let hash = hasher.finalize();

    // Take first 8 bytes (16 hex chars)
    let hex_chars = hex::encode(&hash[0..8]);

    Ok(format!("bp1_{}", hex_chars))
}

/// Compute SHA-256 hash of bytes
pub fn sha256_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute SHA-256 hash as hex string
pub fn sha256_hash_hex(data: &[u8]) -> String {
    hex::encode(sha256_hash(data))
}

/// Import a public key from Base64-encoded bytes
pub fn import_public_key_b64(key_b64: &str) -> Result<[u8; 32], ProvaraError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(key_b64)
        .map_err(|e| ProvaraError::Encoding(format!("Base64 decode failed: {}", e)))?;

    if bytes.len() != 32 {
        return Err(ProvaraError::KeyDerivation(format!(
            "Invalid public key length: expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_key_id_derivation() {
        // Test vector from vectors.json
        let public_key_hex = "42e47a04929e14ec37c1a9bedf7107030c22804f39908456b96562a81bc2e5c7";
        let public_key_bytes = hex::decode(public_key_hex).unwrap();
        let mut key = [0u8; 32];
        key.copy_from_slice(&public_key_bytes);

        let key_id = derive_key_id(&key).unwrap();
        assert_eq!(key_id, "bp1_5c99599d178e7632");
    }

    #[test]
    fn test_keypair_round_trips_through_seed() {
        let mut rng = thread_rng();
        let keypair = KeyPair::generate(&mut rng);
        let restored = KeyPair::from_bytes(&keypair.seed_bytes()).unwrap();

        assert_eq!(restored.public_key(), keypair.public_key());
        assert_eq!(restored.key_id().unwrap(), keypair.key_id().unwrap());
    }

    #[test]
    fn test_create_key_derives_matching_id() {
        let (keypair, key_id) = create_key().unwrap();
        assert_eq!(key_id, derive_key_id(&keypair.public_key()).unwrap());
        assert!(key_id.starts_with("bp1_"));
        assert_eq!(key_id.len(), 4 + 16);
    }

    #[test]
    fn test_import_public_key_rejects_bad_length() {
        use base64::Engine as _;
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(import_public_key_b64(&short).is_err());
    }

    #[test]
    fn test_sha256_known_answer() {
        assert_eq!(
            sha256_hash_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hash_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
