//! Test vector validation for Provara Protocol
//!
//! This module validates the implementation against the official
//! test vectors in test_vectors/vectors.json

use crate::event::{derive_event_id, sign_event, verify_event_signature, Event};
use crate::manifest::{compute_merkle_root, FileEntry};
use crate::reducer::reduce;
use crate::{canonical_to_string, derive_key_id, sha256_hash_hex, KeyPair};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct TestVector {
    id: String,
    #[allow(dead_code)]
    description: String,
    input: Value,
    expected: Value,
}

#[derive(Debug, Deserialize)]
struct TestVectors {
    #[allow(dead_code)]
    version: String,
    vectors: Vec<TestVector>,
}

/// Run all test vectors and return results
pub fn run_test_vectors(vectors_json: &str) -> Result<Vec<(String, bool, String)>, String> {
    let vectors: TestVectors = serde_json::from_str(vectors_json)
        .map_err(|e| format!("Failed to parse test vectors: {}", e))?;

    let mut results = Vec::new();

    for vector in vectors.vectors {
        let passed = match vector.id.as_str() {
            id if id.starts_with("canonical_json_") => {
                test_canonical_json(&vector.input, &vector.expected)
            }
            id if id.starts_with("sha256_hash_") => {
                test_sha256_hash(&vector.input, &vector.expected)
            }
            id if id.starts_with("event_id_derivation_") => {
                test_event_id_derivation(&vector.input, &vector.expected)
            }
            id if id.starts_with("key_id_derivation_") => {
                test_key_id_derivation(&vector.input, &vector.expected)
            }
            id if id.starts_with("ed25519_sign_verify_") => {
                test_ed25519_sign_verify(&vector.input, &vector.expected)
            }
            id if id.starts_with("merkle_root_") => {
                test_merkle_root(&vector.input, &vector.expected)
            }
            id if id.starts_with("reducer_determinism_") => {
                test_reducer_determinism(&vector.input, &vector.expected)
            }
            _ => Err(format!("Unknown test vector: {}", vector.id)),
        };

        let ok = passed.is_ok();
        let msg = passed.err().unwrap_or_default();
        results.push((vector.id, ok, msg));
    }

    Ok(results)
}

fn test_canonical_json(input: &Value, expected: &Value) -> Result<(), String> {
    let canonical = canonical_to_string(input)
        .map_err(|e| format!("Canonicalization failed: {}", e))?;

    let canonical_hex = hex::encode(canonical.as_bytes());
    let expected_hex = expected.as_str().ok_or("Expected value must be a string")?;

    if canonical_hex == expected_hex {
        Ok(())
    } else {
        Err(format!(
            "Canonical mismatch:\n  Expected: {}\n  Got:      {}",
            expected_hex, canonical_hex
        ))
    }
}

fn test_sha256_hash(input: &Value, expected: &Value) -> Result<(), String> {
    let input_str = input.as_str().ok_or("Input must be a string")?;

    let hash = sha256_hash_hex(input_str.as_bytes());
    let expected_hash = expected.as_str().ok_or("Expected value must be a string")?;

    if hash == expected_hash {
        Ok(())
    } else {
        Err(format!(
            "Hash mismatch:\n  Expected: {}\n  Got:      {}",
            expected_hash, hash
        ))
    }
}

fn test_event_id_derivation(input: &Value, expected: &Value) -> Result<(), String> {
    let event: Event = serde_json::from_value(input.clone())
        .map_err(|e| format!("Event parse failed: {}", e))?;

    let event_id = derive_event_id(&event)
        .map_err(|e| format!("Event ID derivation failed: {}", e))?;

    let expected_id = expected.as_str().ok_or("Expected value must be a string")?;

    if event_id == expected_id {
        Ok(())
    } else {
        Err(format!(
            "Event ID mismatch:\n  Expected: {}\n  Got:      {}",
            expected_id, event_id
        ))
    }
}

fn test_key_id_derivation(input: &Value, expected: &Value) -> Result<(), String> {
    let public_key_hex = input.as_str().ok_or("Input must be a hex string")?;

    let public_key_bytes = hex::decode(public_key_hex)
        .map_err(|e| format!("Hex decode failed: {}", e))?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&public_key_bytes);

    let key_id = derive_key_id(&key).map_err(|e| format!("Key ID derivation failed: {}", e))?;

    let expected_id = expected.as_str().ok_or("Expected value must be a string")?;

    if key_id == expected_id {
        Ok(())
    } else {
        Err(format!(
            "Key ID mismatch:\n  Expected: {}\n  Got:      {}",
            expected_id, key_id
        ))
    }
}

fn test_ed25519_sign_verify(input: &Value, expected: &Value) -> Result<(), String> {
    let seed_hex = input["seed_hex"].as_str().ok_or("Missing seed_hex")?;
    let seed_bytes = hex::decode(seed_hex).map_err(|e| format!("Hex decode failed: {}", e))?;
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&seed_bytes);

    let keypair = KeyPair::from_bytes(&seed).map_err(|e| format!("Keypair failed: {}", e))?;

    let expected_pub = expected["public_key_hex"].as_str().ok_or("Missing public_key_hex")?;
    if hex::encode(keypair.public_key()) != expected_pub {
        return Err("Public key derivation mismatch".to_string());
    }
    let expected_kid = expected["key_id"].as_str().ok_or("Missing key_id")?;
    let kid = keypair.key_id().map_err(|e| e.to_string())?;
    if kid != expected_kid {
        return Err(format!("Key ID mismatch: expected {expected_kid}, got {kid}"));
    }

    let mut event: Event = serde_json::from_value(input["event"].clone())
        .map_err(|e| format!("Event parse failed: {}", e))?;

    sign_event(&mut event, &keypair).map_err(|e| format!("Signing failed: {}", e))?;

    let expected_id = expected["event_id"].as_str().ok_or("Missing event_id")?;
    if event.event_id != expected_id {
        return Err(format!(
            "Event ID mismatch:\n  Expected: {}\n  Got:      {}",
            expected_id, event.event_id
        ));
    }

    let expected_sig = expected["sig_b64"].as_str().ok_or("Missing sig_b64")?;
    let sig = event.sig.clone().unwrap_or_default();
    if sig != expected_sig {
        return Err(format!(
            "Signature mismatch:\n  Expected: {}\n  Got:      {}",
            expected_sig, sig
        ));
    }

    let valid = verify_event_signature(&event, &keypair.public_key())
        .map_err(|e| format!("Verification failed: {}", e))?;
    if valid {
        Ok(())
    } else {
        Err("Signature verification returned false".to_string())
    }
}

fn test_merkle_root(input: &Value, expected: &Value) -> Result<(), String> {
    let entries: Vec<FileEntry> = serde_json::from_value(input.clone())
        .map_err(|e| format!("Entry parse failed: {}", e))?;

    let root = compute_merkle_root(&entries)
        .map_err(|e| format!("Merkle root computation failed: {}", e))?;

    let expected_root = expected.as_str().ok_or("Expected value must be a string")?;

    if root == expected_root {
        Ok(())
    } else {
        Err(format!(
            "Merkle root mismatch:\n  Expected: {}\n  Got:      {}",
            expected_root, root
        ))
    }
}

fn test_reducer_determinism(input: &Value, expected: &Value) -> Result<(), String> {
    let events: Vec<Event> = serde_json::from_value(input.clone())
        .map_err(|e| format!("Event parse failed: {}", e))?;

    let state = reduce(&events);
    let state_hash = state
        .metadata
        .state_hash
        .ok_or_else(|| "Reducer produced no state hash".to_string())?;

    let expected_hash = expected.as_str().ok_or("Expected value must be a string")?;

    if state_hash == expected_hash {
        Ok(())
    } else {
        Err(format!(
            "State hash mismatch:\n  Expected: {}\n  Got:      {}",
            expected_hash, state_hash
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_run_vectors() {
        // Load test vectors from file
        let vectors_json = include_str!("../../test_vectors/vectors.json");

        let results = run_test_vectors(vectors_json).unwrap();

        println!("Test Vector Results:");
        for (id, passed, message) in &results {
            if *passed {
                println!("  ✓ {}", id);
            } else {
                println!("  ✗ {}: {}", id, message);
            }
        }

        // Count passed/failed
        let passed = results.iter().filter(|(_, p, _)| *p).count();
        let total = results.len();

        println!("\nPassed: {}/{}", passed, total);

        assert_eq!(passed, total, "All test vectors must pass");
    }

    #[test]
    fn empty_log_state_hash_matches_fixture() {
        let state = reduce(&[]);
        assert_eq!(
            state.metadata.state_hash.as_deref(),
            Some("2a06a8d0ac1a5f86e1097a862066fbc5953b19885db9e1ca7625d5b2a4a8bcb9")
        );
    }
}
