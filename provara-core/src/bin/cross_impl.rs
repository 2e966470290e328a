//! Cross-implementation conformance harness.
//!
//! Drives the core through the same narrow operations other Provara
//! implementations expose, so logs and hashes can be diffed across
//! implementations: canonical hashing, vault creation, vault
//! verification, event signing, and state reduction.

use std::path::Path;

use base64::Engine as _;
use serde_json::Value;

use provara_core::{
    reduce, sign_event, validate_vault, Event, EventKind, KeyPair, Namespace, Vault,
    ValidatorOptions,
};

fn canonical_sha256(input_json: &str) -> Result<(), String> {
    let value: Value = serde_json::from_str(input_json).map_err(|e| format!("invalid json: {e}"))?;
    let hash = provara_core::canonical_hash_hex(&value).map_err(|e| e.to_string())?;
    println!("{hash}");
    Ok(())
}

fn verify_vault(path: &Path, expected_state_hash: Option<String>) -> Result<(), String> {
    let opts = ValidatorOptions {
        strict: true,
        expected_state_hash,
    };
    let report = validate_vault(path, &opts).map_err(|e| e.to_string())?;
    for error in &report.errors {
        eprintln!("{} {}", error.code.code(), error);
    }
    println!(
        "valid={} events={} actors={}",
        report.valid,
        report.event_count,
        report.actors.len()
    );
    if report.valid {
        Ok(())
    } else {
        Err(format!("{} validation errors", report.errors.len()))
    }
}

fn create_vault(path: &Path) -> Result<(), String> {
    // Fixed seed so both sides of a cross-impl diff derive the same ids.
    let seed = [7u8; 32];
    let root = KeyPair::from_bytes(&seed).map_err(|e| e.to_string())?;
    let vault = Vault::create(path, "rust_actor", &root).map_err(|e| e.to_string())?;

    vault
        .append(
            &EventKind::Observation,
            "rust_actor",
            Namespace::Local,
            serde_json::json!({
                "subject": "interop",
                "predicate": "status",
                "value": "rust-created",
            }),
            &root,
        )
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn sign_event_json(private_key_b64: &str, event_json: &str) -> Result<(), String> {
    let priv_bytes = base64::engine::general_purpose::STANDARD
        .decode(private_key_b64)
        .map_err(|e| format!("invalid private key b64: {e}"))?;
    if priv_bytes.len() != 32 {
        return Err("private key must decode to 32 bytes".to_string());
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&priv_bytes);
    let keypair = KeyPair::from_bytes(&seed).map_err(|e| e.to_string())?;

    let mut event: Event =
        serde_json::from_str(event_json).map_err(|e| format!("invalid event json: {e}"))?;
    sign_event(&mut event, &keypair).map_err(|e| e.to_string())?;
    println!("{}", event.sig.unwrap_or_default());
    Ok(())
}

fn state_hash(path: &Path) -> Result<(), String> {
    let vault = Vault::open(path).map_err(|e| e.to_string())?;
    let events = vault.load_events().map_err(|e| e.to_string())?;
    let state = reduce(&events);
    println!("{}", state.metadata.state_hash.unwrap_or_default());
    Ok(())
}

fn usage() {
    eprintln!("Usage:");
    eprintln!("  cross_impl canonical-sha256 --input-json <json>");
    eprintln!("  cross_impl verify-vault --vault <path> [--state-hash <hex>]");
    eprintln!("  cross_impl create-vault --vault <path>");
    eprintln!("  cross_impl sign-event-json --private-key-b64 <b64> --event-json <json>");
    eprintln!("  cross_impl state-hash --vault <path>");
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.windows(2)
        .find_map(|w| if w[0] == name { Some(w[1].clone()) } else { None })
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
        std::process::exit(2);
    }

    let cmd = args[1].as_str();
    let result = match cmd {
        "canonical-sha256" => arg_value(&args, "--input-json")
            .ok_or_else(|| "--input-json is required".to_string())
            .and_then(|j| canonical_sha256(&j)),
        "verify-vault" => arg_value(&args, "--vault")
            .ok_or_else(|| "--vault is required".to_string())
            .and_then(|p| verify_vault(Path::new(&p), arg_value(&args, "--state-hash"))),
        "create-vault" => arg_value(&args, "--vault")
            .ok_or_else(|| "--vault is required".to_string())
            .and_then(|p| create_vault(Path::new(&p))),
        "sign-event-json" => {
            let private_key = arg_value(&args, "--private-key-b64")
                .ok_or_else(|| "--private-key-b64 is required".to_string());
            let event_json = arg_value(&args, "--event-json")
                .ok_or_else(|| "--event-json is required".to_string());
            private_key
                .and_then(|pk| event_json.and_then(|ev| sign_event_json(&pk, &ev)))
        }
        "state-hash" => arg_value(&args, "--vault")
            .ok_or_else(|| "--vault is required".to_string())
            .and_then(|p| state_hash(Path::new(&p))),
        _ => Err(format!("unknown command: {cmd}")),
    };

    if let Err(e) = result {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
