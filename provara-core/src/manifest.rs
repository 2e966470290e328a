//! Vault file inventory, Merkle tree, and the signed manifest.
//!
//! The manifest covers every file under the vault root except the three
//! self-referential files, the advisory lock, and the regenerable `state/`
//! cache. Leaves are SHA-256 over the canonical `{path, sha256, size}`
//! record; parents hash the raw byte concatenation of their children.

use std::fs;
use std::path::{Component, Path};

use jcs_rs::canonicalize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ProvaraError;
use crate::event::is_valid_timestamp;
use crate::{sha256_hash, sha256_hash_hex, KeyPair, PROTOCOL_VERSION};

/// Signed file inventory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Detached Ed25519 signature over the manifest.
pub const MANIFEST_SIG_FILE: &str = "manifest.sig";
/// Single 64-hex line holding the Merkle root.
pub const MERKLE_ROOT_FILE: &str = "merkle_root.txt";
/// Advisory lock file, never part of the inventory.
pub const LOCK_FILE: &str = ".provara.lock";
/// Regenerable state cache directory, never authoritative.
pub const STATE_DIR: &str = "state";

/// One manifest entry. Paths are vault-relative with forward slashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// The `manifest.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub protocol_version: String,
    pub generated_at_utc: String,
    pub merkle_root: String,
    pub files: Vec<FileEntry>,
}

/// Walk the vault root and hash every inventoried file.
///
/// Entries come back sorted by path. Symlinks are a path-safety error:
/// a manifest must never reach outside the vault.
pub fn collect_file_entries(vault_root: &Path) -> Result<Vec<FileEntry>, ProvaraError> {
    let mut entries = Vec::new();

    for item in WalkDir::new(vault_root).follow_links(false).sort_by_file_name() {
        let item = item.map_err(|e| ProvaraError::Vault(format!("walk failed: {e}")))?;
        if item.path_is_symlink() {
            return Err(ProvaraError::PathSafety(format!(
                "symlink in vault: {}",
                item.path().display()
            )));
        }
        if !item.file_type().is_file() {
            continue;
        }

        let relative = item
            .path()
            .strip_prefix(vault_root)
            .map_err(|e| ProvaraError::PathSafety(e.to_string()))?;
        let path = relative_path_string(relative)?;
        if is_excluded(&path) {
            continue;
        }

        let bytes = fs::read(item.path())?;
        entries.push(FileEntry {
            sha256: sha256_hash_hex(&bytes),
            size: bytes.len() as u64,
            path,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(files = entries.len(), "collected manifest entries");
    Ok(entries)
}

fn is_excluded(path: &str) -> bool {
    matches!(path, MANIFEST_FILE | MANIFEST_SIG_FILE | MERKLE_ROOT_FILE | LOCK_FILE)
        || path.starts_with(&format!("{STATE_DIR}/"))
}

/// Render a relative path as a forward-slash string, rejecting traversal.
fn relative_path_string(relative: &Path) -> Result<String, ProvaraError> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| {
                        ProvaraError::PathSafety(format!(
                            "non-UTF-8 path: {}",
                            relative.display()
                        ))
                    })?
                    .to_string(),
            ),
            other => {
                return Err(ProvaraError::PathSafety(format!(
                    "illegal path component {other:?} in {}",
                    relative.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Merkle root over file entries, as 64 lowercase hex.
///
/// Entries are leaf-hashed in sorted path order; odd levels duplicate
/// their last node; parents hash raw byte concatenation. The empty tree
/// root is `SHA-256("")`.
pub fn compute_merkle_root(entries: &[FileEntry]) -> Result<String, ProvaraError> {
    if entries.is_empty() {
        return Ok(sha256_hash_hex(b""));
    }

    let mut sorted: Vec<&FileEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hashes: Vec<[u8; 32]> = Vec::with_capacity(sorted.len());
    for entry in sorted {
        let value = serde_json::to_value(entry)
            .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
        let canonical = canonicalize(&value)?;
        hashes.push(sha256_hash(&canonical));
    }

    if hashes.len() % 2 == 1 {
        hashes.push(*hashes.last().expect("non-empty"));
    }

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len() / 2);
        for chunk in hashes.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(chunk[0]);
            hasher.update(chunk[1]);
            let mut parent = [0u8; 32];
            parent.copy_from_slice(&hasher.finalize());
            next_level.push(parent);
        }
        hashes = next_level;
        if hashes.len() % 2 == 1 && hashes.len() > 1 {
            hashes.push(*hashes.last().expect("non-empty"));
        }
    }

    Ok(hex::encode(hashes[0]))
}

/// Build a manifest document for a vault root.
pub fn build_manifest(vault_root: &Path, generated_at_utc: &str) -> Result<Manifest, ProvaraError> {
    if !is_valid_timestamp(generated_at_utc) {
        return Err(ProvaraError::InvalidEvent(format!(
            "invalid generation timestamp: {generated_at_utc}"
        )));
    }
    let files = collect_file_entries(vault_root)?;
    let merkle_root = compute_merkle_root(&files)?;
    Ok(Manifest {
        protocol_version: PROTOCOL_VERSION.to_string(),
        generated_at_utc: generated_at_utc.to_string(),
        merkle_root,
        files,
    })
}

/// Signing preimage: `SHA-256(raw_root_bytes ∥ canonical(manifest))`.
fn manifest_digest(manifest: &Manifest) -> Result<[u8; 32], ProvaraError> {
    let root_bytes = hex::decode(&manifest.merkle_root)
        .map_err(|e| ProvaraError::Encoding(format!("invalid merkle root hex: {e}")))?;
    let value: Value = serde_json::to_value(manifest)
        .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
    let canonical = canonicalize(&value)?;

    let mut preimage = root_bytes;
    preimage.extend_from_slice(&canonical);
    Ok(sha256_hash(&preimage))
}

/// Detached Base64 Ed25519 signature over the manifest digest.
pub fn sign_manifest(manifest: &Manifest, keypair: &KeyPair) -> Result<String, ProvaraError> {
    let digest = manifest_digest(manifest)?;
    let signature = keypair.sign(&digest);
    use base64::Engine as _;
    Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
}

/// Verify a detached manifest signature.
pub fn verify_manifest_signature(
    manifest: &Manifest,
    sig_b64: &str,
    public_key: &[u8; 32],
) -> Result<bool, ProvaraError> {
    use base64::Engine as _;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(sig_b64.trim())
        .map_err(|e| ProvaraError::Encoding(format!("Base64 decode failed: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid signature: {e}")))?;
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid public key: {e}")))?;

    let digest = manifest_digest(manifest)?;
    Ok(verifying_key.verify(&digest, &signature).is_ok())
}

/// Write `manifest.json`, `manifest.sig`, and `merkle_root.txt`.
pub fn write_manifest_files(
    vault_root: &Path,
    manifest: &Manifest,
    sig_b64: &str,
) -> Result<(), ProvaraError> {
    let rendered = serde_json::to_string_pretty(manifest)
        .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
    fs::write(vault_root.join(MANIFEST_FILE), rendered + "\n")?;
    fs::write(vault_root.join(MANIFEST_SIG_FILE), format!("{sig_b64}\n"))?;
    fs::write(
        vault_root.join(MERKLE_ROOT_FILE),
        format!("{}\n", manifest.merkle_root),
    )?;
    Ok(())
}

/// Load `manifest.json` from a vault root.
pub fn load_manifest(vault_root: &Path) -> Result<Manifest, ProvaraError> {
    let raw = fs::read_to_string(vault_root.join(MANIFEST_FILE))?;
    serde_json::from_str(&raw).map_err(|e| ProvaraError::Serialization(e.to_string()))
}
