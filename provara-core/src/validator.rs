//! Phased chain validator.
//!
//! Phase 0 parses NDJSON lines; phase 1 runs the per-event checks in spec
//! order, stopping at the first fatal code per event while accumulating
//! findings across events; phase 2 audits rotation discipline; phase 3
//! re-runs the reducer; phase 4 (vault level) recomputes the manifest and
//! Merkle root. The report carries typed errors with stable codes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::chain::ActorChain;
use crate::error::{ErrorCode, ProvaraError, ValidationError};
use crate::event::{
    is_valid_event_id, is_valid_event_type, is_valid_key_id, is_valid_sig, is_valid_timestamp,
    verify_event_signature, derive_event_id, Event, EventKind,
};
use crate::keys::{KeyRegistry, ROLE_ROOT};
use crate::manifest::{
    collect_file_entries, compute_merkle_root, load_manifest, verify_manifest_signature,
    MANIFEST_SIG_FILE, MERKLE_ROOT_FILE,
};
use crate::reducer::reduce;
use crate::PROTOCOL_VERSION;

/// Options for a verification pass.
#[derive(Debug, Clone, Default)]
pub struct ValidatorOptions {
    /// Reject events whose revocation boundary cannot be resolved.
    pub strict: bool,
    /// Compare the reduced state hash against a caller-supplied value.
    pub expected_state_hash: Option<String>,
}

/// Structured verification outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    /// Events examined, including ones that failed.
    pub event_count: u64,
    pub actors: BTreeMap<String, ActorChain>,
    /// Hash of the reduced state over the events that passed phase 1.
    pub state_hash: Option<String>,
}

/// Key material view used during validation. Built from `keys.json` plus
/// rotation events encountered in the log; inserts are idempotent so the
/// two sources can overlap.
#[derive(Debug, Default)]
struct RegistryView {
    keys: BTreeMap<String, [u8; 32]>,
    /// key id -> trust boundary event id.
    revoked: BTreeMap<String, String>,
}

impl RegistryView {
    fn from_registry(registry: &KeyRegistry) -> Result<Self, ProvaraError> {
        let mut view = RegistryView::default();
        for record in &registry.keys {
            view.keys.insert(record.key_id.clone(), record.public_key()?);
        }
        for revocation in &registry.revocations {
            view.revoked.insert(
                revocation.revoked_key_id.clone(),
                revocation.trust_boundary_event_id.clone(),
            );
        }
        Ok(view)
    }

    fn absorb_rotation(&mut self, event: &Event) {
        match event.kind() {
            Some(EventKind::KeyRevocation) => {
                if let (Some(revoked), Some(boundary)) = (
                    event.payload.get("revoked_key_id").and_then(Value::as_str),
                    event
                        .payload
                        .get("trust_boundary_event_id")
                        .and_then(Value::as_str),
                ) {
                    self.revoked
                        .insert(revoked.to_string(), boundary.to_string());
                }
            }
            Some(EventKind::KeyPromotion) => {
                if let Some(pub_b64) = event
                    .payload
                    .get("new_public_key_b64")
                    .and_then(Value::as_str)
                {
                    if let Ok(bytes) = crate::import_public_key_b64(pub_b64) {
                        if let Ok(key_id) = crate::derive_key_id(&bytes) {
                            self.keys.insert(key_id, bytes);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Phase 0: parse NDJSON into values, quarantining malformed lines.
fn parse_lines(ndjson: &str) -> (Vec<Value>, Vec<ValidationError>) {
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in ndjson.lines().enumerate() {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => values.push(value),
            Err(e) => errors.push(
                ValidationError::new(
                    ErrorCode::MalformedJson,
                    format!("line {}: {e}", idx + 1),
                )
                .with_field(format!("line {}", idx + 1)),
            ),
        }
    }
    (values, errors)
}

const REQUIRED_FIELDS: [&str; 9] = [
    "event_id",
    "type",
    "actor",
    "actor_key_id",
    "timestamp_utc",
    "prev_event_hash",
    "namespace",
    "payload",
    "sig",
];

/// Phase 1 checks for one event. Returns the first fatal finding.
fn check_event(
    value: &Value,
    view: &RegistryView,
    seen_ids: &BTreeSet<String>,
    heads: &BTreeMap<String, String>,
    actor_of: &BTreeMap<String, String>,
    timestamps: &BTreeMap<String, String>,
    strict: bool,
) -> Result<Event, ValidationError> {
    let obj = value.as_object().ok_or_else(|| {
        ValidationError::new(ErrorCode::MalformedJson, "event is not a JSON object")
    })?;
    let event_id = obj
        .get("event_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // 1. Required fields.
    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            return Err(ValidationError::new(
                ErrorCode::RequiredFieldMissing,
                format!("missing required field {field}"),
            )
            .with_event(event_id.clone())
            .with_field(field));
        }
    }

    // 2. Format checks.
    let type_name = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    if !is_valid_event_type(type_name) {
        return Err(ValidationError::new(
            ErrorCode::InvalidEventType,
            format!("invalid event type {type_name:?}"),
        )
        .with_event(event_id.clone())
        .with_field("type"));
    }
    if !is_valid_event_id(&event_id) {
        return Err(ValidationError::new(
            ErrorCode::EventIdFormat,
            format!("malformed event_id {event_id:?}"),
        )
        .with_event(event_id.clone())
        .with_field("event_id"));
    }
    let key_id = obj
        .get("actor_key_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !is_valid_key_id(key_id) {
        return Err(ValidationError::new(
            ErrorCode::KeyIdFormat,
            format!("malformed actor_key_id {key_id:?}"),
        )
        .with_event(event_id.clone())
        .with_field("actor_key_id"));
    }
    let timestamp = obj
        .get("timestamp_utc")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !is_valid_timestamp(timestamp) {
        return Err(ValidationError::new(
            ErrorCode::TimestampFormat,
            format!("malformed timestamp_utc {timestamp:?}"),
        )
        .with_event(event_id.clone())
        .with_field("timestamp_utc"));
    }
    let sig = obj.get("sig").and_then(Value::as_str).unwrap_or_default();
    if !is_valid_sig(sig) {
        return Err(ValidationError::new(
            ErrorCode::SigFormat,
            "sig is not Base64 of 64 bytes",
        )
        .with_event(event_id.clone())
        .with_field("sig"));
    }

    let event: Event = serde_json::from_value(value.clone()).map_err(|e| {
        ValidationError::new(ErrorCode::MalformedJson, format!("event shape: {e}"))
            .with_event(event_id.clone())
    })?;

    // 3. Recompute the content-addressed id.
    let derived = derive_event_id(&event).map_err(|e| {
        ValidationError::new(ErrorCode::CanonicalFormat, e.to_string()).with_event(event_id.clone())
    })?;
    if derived != event.event_id {
        return Err(ValidationError::new(
            ErrorCode::EventIdMismatch,
            format!("stored {} but derived {derived}", event.event_id),
        )
        .with_event(event.event_id.clone())
        .with_field("event_id"));
    }

    // 4. Duplicate ids.
    if seen_ids.contains(&event.event_id) {
        return Err(ValidationError::new(
            ErrorCode::DuplicateEventId,
            "event_id already present in the log",
        )
        .with_event(event.event_id.clone()));
    }

    // 5. Key resolution and revocation window.
    let public_key = view.keys.get(&event.actor_key_id).ok_or_else(|| {
        ValidationError::new(
            ErrorCode::KeyNotFound,
            format!("unknown key {}", event.actor_key_id),
        )
        .with_event(event.event_id.clone())
        .with_field("actor_key_id")
    })?;
    if let Some(boundary_id) = view.revoked.get(&event.actor_key_id) {
        match timestamps.get(boundary_id) {
            Some(boundary_ts) if event.timestamp_utc.as_str() > boundary_ts.as_str() => {
                return Err(ValidationError::new(
                    ErrorCode::RevokedKeyUse,
                    format!(
                        "key {} used after trust boundary {boundary_id}",
                        event.actor_key_id
                    ),
                )
                .with_event(event.event_id.clone()));
            }
            Some(_) => {}
            None if strict => {
                return Err(ValidationError::new(
                    ErrorCode::RevokedKeyUse,
                    format!(
                        "key {} is revoked and boundary {boundary_id} is unresolved",
                        event.actor_key_id
                    ),
                )
                .with_event(event.event_id.clone()));
            }
            None => {}
        }
    }

    // 6. Signature.
    match verify_event_signature(&event, public_key) {
        Ok(true) => {}
        Ok(false) => {
            return Err(ValidationError::new(
                ErrorCode::InvalidSignature,
                "Ed25519 signature does not verify",
            )
            .with_event(event.event_id.clone())
            .with_field("sig"));
        }
        Err(e) => {
            return Err(ValidationError::new(ErrorCode::InvalidSignature, e.to_string())
                .with_event(event.event_id.clone())
                .with_field("sig"));
        }
    }

    // 7. Chain discipline.
    match &event.prev_event_hash {
        None => {
            if heads.contains_key(&event.actor) {
                return Err(ValidationError::new(
                    ErrorCode::FirstEventPrevNotNull,
                    format!("actor {} already has a chain", event.actor),
                )
                .with_event(event.event_id.clone())
                .with_field("prev_event_hash"));
            }
        }
        Some(prev) => {
            let prev_actor = actor_of.get(prev).ok_or_else(|| {
                ValidationError::new(
                    ErrorCode::OrphanChainReference,
                    format!("prev_event_hash {prev} not found"),
                )
                .with_event(event.event_id.clone())
                .with_field("prev_event_hash")
            })?;
            if prev_actor != &event.actor {
                return Err(ValidationError::new(
                    ErrorCode::CrossActorChainReference,
                    format!("prev event belongs to {prev_actor}"),
                )
                .with_event(event.event_id.clone())
                .with_field("prev_event_hash"));
            }
            match heads.get(&event.actor) {
                Some(head) if head == prev => {}
                Some(head) => {
                    return Err(ValidationError::new(
                        ErrorCode::BrokenCausalChain,
                        format!("expected prev {head}, got {prev}"),
                    )
                    .with_event(event.event_id.clone())
                    .with_field("prev_event_hash"));
                }
                None => {
                    return Err(ValidationError::new(
                        ErrorCode::BrokenCausalChain,
                        "actor has no prior event",
                    )
                    .with_event(event.event_id.clone())
                    .with_field("prev_event_hash"));
                }
            }
        }
    }

    Ok(event)
}

/// Phase 2: rotation discipline over the validated events.
fn check_rotations(events: &[Event], errors: &mut Vec<ValidationError>) {
    let mut revocation_actors: BTreeSet<&str> = BTreeSet::new();

    for event in events {
        match event.kind() {
            Some(EventKind::KeyRevocation) => {
                let revoked = event
                    .payload
                    .get("revoked_key_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if event
                    .payload
                    .get("trust_boundary_event_id")
                    .and_then(Value::as_str)
                    .is_none()
                {
                    errors.push(
                        ValidationError::new(
                            ErrorCode::RequiredFieldMissing,
                            "KEY_REVOCATION missing trust_boundary_event_id",
                        )
                        .with_event(event.event_id.clone())
                        .with_field("trust_boundary_event_id"),
                    );
                }
                if !revoked.is_empty() && event.actor_key_id == revoked {
                    errors.push(
                        ValidationError::new(
                            ErrorCode::SelfSignedRotation,
                            format!("key {revoked} signed its own revocation"),
                        )
                        .with_event(event.event_id.clone()),
                    );
                }
                revocation_actors.insert(event.actor.as_str());
            }
            Some(EventKind::KeyPromotion) => {
                let new_key = event
                    .payload
                    .get("new_key_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !new_key.is_empty() && event.actor_key_id == new_key {
                    errors.push(
                        ValidationError::new(
                            ErrorCode::SelfSignedRotation,
                            format!("key {new_key} signed its own promotion"),
                        )
                        .with_event(event.event_id.clone()),
                    );
                }
                if !revocation_actors.contains(event.actor.as_str()) {
                    errors.push(
                        ValidationError::new(
                            ErrorCode::PromotionWithoutRevocation,
                            "KEY_PROMOTION without a prior KEY_REVOCATION by this actor",
                        )
                        .with_event(event.event_id.clone()),
                    );
                }
            }
            _ => {}
        }
    }
}

/// Validate typed events against a key registry (phases 1–3).
pub fn validate_events(
    events: &[Value],
    registry: &KeyRegistry,
    opts: &ValidatorOptions,
) -> Result<ValidationReport, ProvaraError> {
    let mut errors = Vec::new();
    let mut view = RegistryView::from_registry(registry)?;

    // Timestamps are indexed up front so a revocation boundary resolves
    // even when the boundary event sits later in the log.
    let mut timestamps: BTreeMap<String, String> = BTreeMap::new();
    for value in events {
        if let (Some(id), Some(ts)) = (
            value.get("event_id").and_then(Value::as_str),
            value.get("timestamp_utc").and_then(Value::as_str),
        ) {
            timestamps.insert(id.to_string(), ts.to_string());
        }
    }

    let mut valid_events: Vec<Event> = Vec::with_capacity(events.len());
    let mut seen_ids: BTreeSet<String> = BTreeSet::new();
    let mut heads: BTreeMap<String, String> = BTreeMap::new();
    let mut actor_of: BTreeMap<String, String> = BTreeMap::new();
    let mut actors: BTreeMap<String, ActorChain> = BTreeMap::new();

    for value in events {
        match check_event(
            value,
            &view,
            &seen_ids,
            &heads,
            &actor_of,
            &timestamps,
            opts.strict,
        ) {
            Ok(event) => {
                seen_ids.insert(event.event_id.clone());
                actor_of.insert(event.event_id.clone(), event.actor.clone());
                heads.insert(event.actor.clone(), event.event_id.clone());
                actors
                    .entry(event.actor.clone())
                    .and_modify(|c| {
                        c.event_count += 1;
                        c.head_event_id = event.event_id.clone();
                    })
                    .or_insert_with(|| ActorChain {
                        event_count: 1,
                        first_event_id: event.event_id.clone(),
                        head_event_id: event.event_id.clone(),
                    });
                view.absorb_rotation(&event);
                valid_events.push(event);
            }
            Err(err) => errors.push(err),
        }
    }

    check_rotations(&valid_events, &mut errors);

    // Phase 3: reduce and compare, when the caller pinned a hash.
    let state = reduce(&valid_events);
    let state_hash = state.metadata.state_hash.clone();
    if let Some(expected) = &opts.expected_state_hash {
        if state_hash.as_deref() != Some(expected.as_str()) {
            errors.push(ValidationError::new(
                ErrorCode::StateHashDivergence,
                format!(
                    "expected {expected}, reduced to {}",
                    state_hash.as_deref().unwrap_or("<none>")
                ),
            ));
        }
    }

    debug!(
        events = events.len(),
        errors = errors.len(),
        "validation pass complete"
    );
    Ok(ValidationReport {
        valid: errors.is_empty(),
        errors,
        event_count: events.len() as u64,
        actors,
        state_hash,
    })
}

/// Validate an NDJSON log (phase 0 + phases 1–3).
pub fn validate_log(
    ndjson: &str,
    registry: &KeyRegistry,
    opts: &ValidatorOptions,
) -> Result<ValidationReport, ProvaraError> {
    let (values, parse_errors) = parse_lines(ndjson);
    let mut report = validate_events(&values, registry, opts)?;
    report.event_count += parse_errors.len() as u64;
    if !parse_errors.is_empty() {
        report.valid = false;
        let mut errors = parse_errors;
        errors.extend(report.errors);
        report.errors = errors;
    }
    Ok(report)
}

/// Validate a whole vault directory (phases 0–4).
pub fn validate_vault(
    vault_root: &Path,
    opts: &ValidatorOptions,
) -> Result<ValidationReport, ProvaraError> {
    let registry = KeyRegistry::load(&vault_root.join("identity").join("keys.json"))?;
    let ndjson = fs::read_to_string(vault_root.join("events").join("events.ndjson"))?;
    let mut report = validate_log(&ndjson, &registry, opts)?;

    check_genesis(&ndjson, &mut report.errors);
    check_manifest(vault_root, &registry, &mut report.errors);

    report.valid = report.errors.is_empty();
    Ok(report)
}

/// Exactly one GENESIS, first in the log, carrying the supported protocol
/// version.
fn check_genesis(ndjson: &str, errors: &mut Vec<ValidationError>) {
    let mut genesis_count = 0usize;
    for (idx, line) in ndjson.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let is_genesis = value.get("type").and_then(Value::as_str) == Some("GENESIS");
        if is_genesis {
            genesis_count += 1;
            if idx != 0 {
                errors.push(ValidationError::new(
                    ErrorCode::VaultStructure,
                    "GENESIS is not the first event",
                ));
            }
            let version = value
                .pointer("/payload/protocol_version")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if version != PROTOCOL_VERSION {
                errors.push(
                    ValidationError::new(
                        ErrorCode::SpecVersionMismatch,
                        format!("genesis declares protocol {version:?}, supported {PROTOCOL_VERSION:?}"),
                    )
                    .with_field("protocol_version"),
                );
            }
        }
    }
    if genesis_count == 0 {
        errors.push(ValidationError::new(
            ErrorCode::VaultStructure,
            "vault has no GENESIS event",
        ));
    } else if genesis_count > 1 {
        errors.push(ValidationError::new(
            ErrorCode::VaultStructure,
            format!("vault has {genesis_count} GENESIS events"),
        ));
    }
}

/// Phase 4: recompute the inventory, Merkle root, and manifest signature.
fn check_manifest(vault_root: &Path, registry: &KeyRegistry, errors: &mut Vec<ValidationError>) {
    let manifest = match load_manifest(vault_root) {
        Ok(m) => m,
        Err(_) => return, // no manifest yet: nothing to cross-check
    };

    let recomputed = match collect_file_entries(vault_root) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(ValidationError::new(
                ErrorCode::VaultStructure,
                format!("inventory walk failed: {e}"),
            ));
            return;
        }
    };
    let by_path: BTreeMap<&str, &crate::manifest::FileEntry> =
        recomputed.iter().map(|e| (e.path.as_str(), e)).collect();

    for declared in &manifest.files {
        match by_path.get(declared.path.as_str()) {
            None => errors.push(
                ValidationError::new(
                    ErrorCode::ManifestFileMissing,
                    format!("{} listed in manifest but absent", declared.path),
                )
                .with_field(declared.path.clone()),
            ),
            Some(actual) if actual.sha256 != declared.sha256 || actual.size != declared.size => {
                errors.push(
                    ValidationError::new(
                        ErrorCode::ManifestHashMismatch,
                        format!("{} differs from its manifest entry", declared.path),
                    )
                    .with_field(declared.path.clone()),
                )
            }
            Some(_) => {}
        }
    }

    let root = match compute_merkle_root(&recomputed) {
        Ok(root) => root,
        Err(e) => {
            errors.push(ValidationError::new(
                ErrorCode::CanonicalFormat,
                format!("merkle computation failed: {e}"),
            ));
            return;
        }
    };
    if root != manifest.merkle_root {
        errors.push(
            ValidationError::new(
                ErrorCode::MerkleRootMismatch,
                format!("manifest root {} but recomputed {root}", manifest.merkle_root),
            )
            .with_field("merkle_root"),
        );
    }
    if let Ok(stored) = fs::read_to_string(vault_root.join(MERKLE_ROOT_FILE)) {
        if stored.trim() != root {
            errors.push(
                ValidationError::new(
                    ErrorCode::MerkleRootMismatch,
                    format!("merkle_root.txt holds {} but recomputed {root}", stored.trim()),
                )
                .with_field(MERKLE_ROOT_FILE),
            );
        }
    }

    if let Ok(sig) = fs::read_to_string(vault_root.join(MANIFEST_SIG_FILE)) {
        let verified = registry
            .keys
            .iter()
            .filter(|k| k.has_role(ROLE_ROOT))
            .filter_map(|k| k.public_key().ok())
            .any(|pk| verify_manifest_signature(&manifest, &sig, &pk).unwrap_or(false));
        if !verified {
            errors.push(ValidationError::new(
                ErrorCode::ManifestSignatureMismatch,
                "manifest.sig does not verify under any root key",
            ));
        }
    }
}
