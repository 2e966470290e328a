//! Event model: required fields, content-addressed identity, signing envelope.
//!
//! An event's identity is derived from its canonical bytes minus `event_id`
//! and `sig`; the signature covers the canonical bytes minus `sig` (so the
//! id is signed). Both follow the hash-then-sign rule from the crate root.

use jcs_rs::canonicalize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProvaraError;
use crate::{sha256_hash, KeyPair};

/// Reserved core event types, in spec order.
pub const RESERVED_TYPES: [&str; 8] = [
    "GENESIS",
    "OBSERVATION",
    "ASSERTION",
    "ATTESTATION",
    "RETRACTION",
    "KEY_REVOCATION",
    "KEY_PROMOTION",
    "REDUCER_EPOCH",
];

/// Target namespace of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Canonical,
    #[default]
    Local,
    Contested,
    Archived,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Canonical => "canonical",
            Namespace::Local => "local",
            Namespace::Contested => "contested",
            Namespace::Archived => "archived",
        }
    }
}

/// Tagged view of the `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Genesis,
    Observation,
    Assertion,
    Attestation,
    Retraction,
    KeyRevocation,
    KeyPromotion,
    ReducerEpoch,
    /// Reverse-domain custom type, e.g. `com.example.temperature_reading`.
    Custom(String),
}

impl EventKind {
    pub fn from_type(s: &str) -> Option<EventKind> {
        match s {
            "GENESIS" => Some(EventKind::Genesis),
            "OBSERVATION" => Some(EventKind::Observation),
            "ASSERTION" => Some(EventKind::Assertion),
            "ATTESTATION" => Some(EventKind::Attestation),
            "RETRACTION" => Some(EventKind::Retraction),
            "KEY_REVOCATION" => Some(EventKind::KeyRevocation),
            "KEY_PROMOTION" => Some(EventKind::KeyPromotion),
            "REDUCER_EPOCH" => Some(EventKind::ReducerEpoch),
            other if is_valid_custom_type(other) => Some(EventKind::Custom(other.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Genesis => "GENESIS",
            EventKind::Observation => "OBSERVATION",
            EventKind::Assertion => "ASSERTION",
            EventKind::Attestation => "ATTESTATION",
            EventKind::Retraction => "RETRACTION",
            EventKind::KeyRevocation => "KEY_REVOCATION",
            EventKind::KeyPromotion => "KEY_PROMOTION",
            EventKind::ReducerEpoch => "REDUCER_EPOCH",
            EventKind::Custom(s) => s,
        }
    }
}

/// Provara event structure.
///
/// `prev_event_hash` is always serialized, `null` for an actor's first
/// event. `ts_logical` and `sig` are omitted while unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Content-addressed event ID (`evt_` + 24 hex). Defaults to empty for
    /// partially built events that have not been derived yet.
    #[serde(default)]
    pub event_id: String,

    /// Event type (reserved core type or reverse-domain custom type).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Human-readable identity of the author.
    pub actor: String,

    /// Public-key id (`bp1_` + 16 hex) the event is signed under.
    pub actor_key_id: String,

    /// Monotonic per-vault logical counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_logical: Option<u64>,

    /// Informational wall clock (ISO-8601 UTC, `Z` suffix). Not a trust root.
    pub timestamp_utc: String,

    /// Author's preceding event id; null for the author's first event.
    pub prev_event_hash: Option<String>,

    /// Target namespace.
    pub namespace: Namespace,

    /// Type-specific body.
    pub payload: Value,

    /// Ed25519 signature (Base64 of 64 bytes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Event {
    /// Create an event without `event_id` or `sig` (both computed later).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: &EventKind,
        actor: &str,
        actor_key_id: &str,
        prev_event_hash: Option<String>,
        namespace: Namespace,
        timestamp_utc: &str,
        payload: Value,
    ) -> Self {
        Event {
            event_id: String::new(),
            event_type: kind.as_str().to_string(),
            actor: actor.to_string(),
            actor_key_id: actor_key_id.to_string(),
            ts_logical: None,
            timestamp_utc: timestamp_utc.to_string(),
            prev_event_hash,
            namespace,
            payload,
            sig: None,
        }
    }

    /// Tagged view of the `type` field, `None` for malformed type names.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_type(&self.event_type)
    }

    /// Full JSON object form of the event.
    pub fn to_value(&self) -> Result<Map<String, Value>, ProvaraError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ProvaraError::Serialization(
                "event did not serialize to an object".to_string(),
            )),
        }
    }

    /// Event minus `event_id` and `sig` — the identity payload (I1).
    pub fn identity_value(&self) -> Result<Value, ProvaraError> {
        let mut map = self.to_value()?;
        map.remove("event_id");
        map.remove("sig");
        Ok(Value::Object(map))
    }

    /// Event minus `sig` — the signing payload (I2).
    pub fn signing_value(&self) -> Result<Value, ProvaraError> {
        let mut map = self.to_value()?;
        map.remove("sig");
        Ok(Value::Object(map))
    }

    /// Canonical single-line NDJSON form.
    pub fn to_ndjson_line(&self) -> Result<String, ProvaraError> {
        let map = self.to_value()?;
        let bytes = canonicalize(&Value::Object(map))?;
        String::from_utf8(bytes).map_err(|e| ProvaraError::Encoding(e.to_string()))
    }
}

/// Derive the content-addressed event id.
///
/// `event_id = "evt_" + SHA-256(canonical(event ∖ {event_id, sig}))[:24 hex]`
pub fn derive_event_id(event: &Event) -> Result<String, ProvaraError> {
    let identity = event.identity_value()?;
    let bytes = canonicalize(&identity)?;
    let hash = sha256_hash(&bytes);
    Ok(format!("evt_{}", hex::encode(&hash[0..12])))
}

/// Sign an event in place: derive `event_id`, then sign the canonical bytes
/// of the event minus `sig` (hash-then-sign).
pub fn sign_event(event: &mut Event, keypair: &KeyPair) -> Result<(), ProvaraError> {
    event.event_id = derive_event_id(event)?;

    let signing = event.signing_value()?;
    let canonical_bytes = canonicalize(&signing)?;
    let digest = sha256_hash(&canonical_bytes);
    let signature = keypair.sign(&digest);

    use base64::Engine as _;
    event.sig = Some(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()));
    Ok(())
}

/// Verify an event's signature against a raw public key.
pub fn verify_event_signature(event: &Event, public_key: &[u8; 32]) -> Result<bool, ProvaraError> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let sig_b64 = event
        .sig
        .as_ref()
        .ok_or_else(|| ProvaraError::InvalidEvent("Missing signature".to_string()))?;

    use base64::Engine as _;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(sig_b64)
        .map_err(|e| ProvaraError::Encoding(format!("Base64 decode failed: {}", e)))?;

    if sig_bytes.len() != 64 {
        return Err(ProvaraError::InvalidEvent(format!(
            "Invalid signature length: expected 64, got {}",
            sig_bytes.len()
        )));
    }

    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid signature: {}", e)))?;
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid public key: {}", e)))?;

    let signing = event.signing_value()?;
    let canonical_bytes = canonicalize(&signing)?;
    let digest = sha256_hash(&canonical_bytes);

    Ok(verifying_key.verify(&digest, &signature).is_ok())
}

/// Build and sign a complete event.
#[allow(clippy::too_many_arguments)]
pub fn create_event(
    kind: &EventKind,
    actor: &str,
    keypair: &KeyPair,
    prev_event_hash: Option<String>,
    namespace: Namespace,
    timestamp_utc: &str,
    ts_logical: Option<u64>,
    payload: Value,
) -> Result<Event, ProvaraError> {
    if EventKind::from_type(kind.as_str()).is_none() {
        return Err(ProvaraError::InvalidEvent(format!(
            "invalid event type: {}",
            kind.as_str()
        )));
    }
    if !payload.is_object() {
        return Err(ProvaraError::InvalidEvent(
            "payload must be a JSON object".to_string(),
        ));
    }
    if !is_valid_timestamp(timestamp_utc) {
        return Err(ProvaraError::InvalidEvent(format!(
            "invalid timestamp_utc: {timestamp_utc}"
        )));
    }

    let key_id = keypair.key_id()?;
    let mut event = Event::new(
        kind,
        actor,
        &key_id,
        prev_event_hash,
        namespace,
        timestamp_utc,
        payload,
    );
    event.ts_logical = ts_logical;
    sign_event(&mut event, keypair)?;
    Ok(event)
}

// ---------------------------------------------------------------------------
// Field format checks
// ---------------------------------------------------------------------------

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `evt_` + 24 lowercase hex.
pub fn is_valid_event_id(s: &str) -> bool {
    match s.strip_prefix("evt_") {
        Some(rest) => rest.len() == 24 && is_lower_hex(rest),
        None => false,
    }
}

/// `bp1_` + 16 lowercase hex.
pub fn is_valid_key_id(s: &str) -> bool {
    match s.strip_prefix("bp1_") {
        Some(rest) => rest.len() == 16 && is_lower_hex(rest),
        None => false,
    }
}

/// ISO-8601 UTC wall clock ending in `Z`.
pub fn is_valid_timestamp(s: &str) -> bool {
    s.ends_with('Z') && chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

/// Base64 of exactly 64 signature bytes.
pub fn is_valid_sig(s: &str) -> bool {
    use base64::Engine as _;
    matches!(
        base64::engine::general_purpose::STANDARD.decode(s),
        Ok(bytes) if bytes.len() == 64
    )
}

/// Custom types are reverse-domain: `^[a-z0-9]+(\.[a-z0-9]+)+\.[a-z_]+$`.
pub fn is_valid_custom_type(s: &str) -> bool {
    let segments: Vec<&str> = s.split('.').collect();
    if segments.len() < 3 {
        return false;
    }
    let (last, domain) = segments.split_last().expect("non-empty segments");
    if last.is_empty() || !last.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
        return false;
    }
    domain.iter().all(|seg| {
        !seg.is_empty()
            && seg
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    })
}

/// A type name is valid when reserved or well-formed custom.
pub fn is_valid_event_type(s: &str) -> bool {
    RESERVED_TYPES.contains(&s) || is_valid_custom_type(s)
}
