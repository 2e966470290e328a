//! Key registry: active/revoked keys, roles, and the rotation ceremony.
//!
//! Rotation is a two-event pair: `KEY_REVOCATION` then `KEY_PROMOTION`,
//! each signed by a surviving authority that is not the subject key. The
//! registry keeps keys and revocations in append-only vectors; history is
//! a chain, not a graph.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ErrorCode, ProvaraError, ValidationError};
use crate::event::{Event, EventKind};
use crate::{derive_key_id, import_public_key_b64};

/// Role tag that makes a key a rotation authority.
pub const ROLE_ROOT: &str = "root";
/// Role tag for attestation keys.
pub const ROLE_ATTESTATION: &str = "attestation";
/// Role tag for quorum keys registered at bootstrap.
pub const ROLE_QUORUM: &str = "quorum";

/// Key lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

/// One registered key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub public_key_b64: String,
    pub algorithm: String,
    pub roles: BTreeSet<String>,
    pub status: KeyStatus,
    pub created_at_utc: String,
}

impl KeyRecord {
    /// Build a record from raw public key bytes, deriving the key id.
    pub fn from_public_key(
        public_key: &[u8; 32],
        roles: impl IntoIterator<Item = String>,
        created_at_utc: &str,
    ) -> Result<Self, ProvaraError> {
        use base64::Engine as _;
        Ok(KeyRecord {
            key_id: derive_key_id(public_key)?,
            public_key_b64: base64::engine::general_purpose::STANDARD.encode(public_key),
            algorithm: "Ed25519".to_string(),
            roles: roles.into_iter().collect(),
            status: KeyStatus::Active,
            created_at_utc: created_at_utc.to_string(),
        })
    }

    pub fn public_key(&self) -> Result<[u8; 32], ProvaraError> {
        import_public_key_b64(&self.public_key_b64)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// One revocation record, appended when a key leaves service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    pub revoked_key_id: String,
    /// Last event the revoked key legitimately signed.
    pub trust_boundary_event_id: String,
    pub reason: String,
    /// Authority key id that signed the revocation.
    pub revoked_by: String,
}

/// Registry of keys and revocations, serialized as `identity/keys.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRegistry {
    pub keys: Vec<KeyRecord>,
    pub revocations: Vec<Revocation>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        KeyRegistry::default()
    }

    /// Register a new key. Ids must be unique and derived from the key (K1).
    pub fn register(&mut self, record: KeyRecord) -> Result<(), ProvaraError> {
        let derived = derive_key_id(&record.public_key()?)?;
        if derived != record.key_id {
            return Err(ProvaraError::KeyDerivation(format!(
                "key id {} does not match its public key (expected {derived})",
                record.key_id
            )));
        }
        if self.get(&record.key_id).is_some() {
            return Err(ProvaraError::KeyDerivation(format!(
                "key {} already registered",
                record.key_id
            )));
        }
        debug!(key_id = %record.key_id, roles = ?record.roles, "registering key");
        self.keys.push(record);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Option<&KeyRecord> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    fn get_mut(&mut self, key_id: &str) -> Option<&mut KeyRecord> {
        self.keys.iter_mut().find(|k| k.key_id == key_id)
    }

    pub fn is_active(&self, key_id: &str) -> bool {
        matches!(self.get(key_id), Some(k) if k.status == KeyStatus::Active)
    }

    /// Revocation record for a key, if any.
    pub fn revocation_of(&self, key_id: &str) -> Option<&Revocation> {
        self.revocations.iter().find(|r| r.revoked_key_id == key_id)
    }

    /// Active keys carrying the `root` role.
    pub fn surviving_authorities(&self) -> Vec<&KeyRecord> {
        self.keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active && k.has_role(ROLE_ROOT))
            .collect()
    }

    /// No surviving authority means the vault can no longer rotate or
    /// append: identity death. Existing events stay readable.
    pub fn is_identity_dead(&self) -> bool {
        self.surviving_authorities().is_empty()
    }

    /// Apply a `KEY_REVOCATION` ceremony half. Enforces K3 (no self
    /// revocation) and requires a surviving authority as signer.
    pub fn apply_revocation(
        &mut self,
        revoked_key_id: &str,
        trust_boundary_event_id: &str,
        reason: &str,
        revoked_by: &str,
    ) -> Result<(), ProvaraError> {
        if revoked_by == revoked_key_id {
            return Err(ValidationError::new(
                ErrorCode::SelfSignedRotation,
                format!("key {revoked_key_id} cannot sign its own revocation"),
            )
            .into());
        }
        let authority = self.get(revoked_by).ok_or_else(|| {
            ValidationError::new(
                ErrorCode::KeyNotFound,
                format!("revoking authority {revoked_by} is not registered"),
            )
        })?;
        if authority.status != KeyStatus::Active || !authority.has_role(ROLE_ROOT) {
            return Err(ValidationError::new(
                ErrorCode::NoSurvivingAuthority,
                format!("{revoked_by} is not a surviving authority"),
            )
            .into());
        }
        let record = self.get_mut(revoked_key_id).ok_or_else(|| {
            ValidationError::new(
                ErrorCode::KeyNotFound,
                format!("revoked key {revoked_key_id} is not registered"),
            )
        })?;
        record.status = KeyStatus::Revoked;
        self.revocations.push(Revocation {
            revoked_key_id: revoked_key_id.to_string(),
            trust_boundary_event_id: trust_boundary_event_id.to_string(),
            reason: reason.to_string(),
            revoked_by: revoked_by.to_string(),
        });
        debug!(revoked = %revoked_key_id, by = %revoked_by, "key revoked");
        Ok(())
    }

    /// Apply a `KEY_PROMOTION` ceremony half. Enforces K3 (no self
    /// promotion) and requires a surviving authority as signer.
    pub fn apply_promotion(
        &mut self,
        new_public_key_b64: &str,
        roles: impl IntoIterator<Item = String>,
        promoted_by: &str,
        created_at_utc: &str,
    ) -> Result<String, ProvaraError> {
        let public_key = import_public_key_b64(new_public_key_b64)?;
        let new_key_id = derive_key_id(&public_key)?;
        if promoted_by == new_key_id {
            return Err(ValidationError::new(
                ErrorCode::SelfSignedRotation,
                format!("key {new_key_id} cannot sign its own promotion"),
            )
            .into());
        }
        let authority = self.get(promoted_by).ok_or_else(|| {
            ValidationError::new(
                ErrorCode::KeyNotFound,
                format!("promoting authority {promoted_by} is not registered"),
            )
        })?;
        if authority.status != KeyStatus::Active || !authority.has_role(ROLE_ROOT) {
            return Err(ValidationError::new(
                ErrorCode::NoSurvivingAuthority,
                format!("{promoted_by} is not a surviving authority"),
            )
            .into());
        }
        self.register(KeyRecord::from_public_key(
            &public_key,
            roles,
            created_at_utc,
        )?)?;
        Ok(new_key_id)
    }

    /// Fold a rotation event into the registry. Non-rotation events are
    /// ignored so callers can stream a whole log through.
    pub fn apply_event(&mut self, event: &Event) -> Result<(), ProvaraError> {
        match event.kind() {
            Some(EventKind::KeyRevocation) => {
                let p = rotation_payload(event)?;
                self.apply_revocation(
                    require_str(&p, "revoked_key_id", event)?,
                    require_str(&p, "trust_boundary_event_id", event)?,
                    p.get("reason").and_then(Value::as_str).unwrap_or("unspecified"),
                    require_str(&p, "revoked_by", event)?,
                )
            }
            Some(EventKind::KeyPromotion) => {
                let p = rotation_payload(event)?;
                let roles: Vec<String> = p
                    .get("roles")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_else(|| vec![ROLE_ROOT.to_string()]);
                self.apply_promotion(
                    require_str(&p, "new_public_key_b64", event)?,
                    roles,
                    require_str(&p, "promoted_by", event)?,
                    &event.timestamp_utc,
                )
                .map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Rebuild a registry from a genesis registry plus a log.
    pub fn from_events(base: KeyRegistry, events: &[Event]) -> Result<KeyRegistry, ProvaraError> {
        let mut registry = base;
        for event in events {
            registry.apply_event(event)?;
        }
        Ok(registry)
    }

    // -- persistence (identity/keys.json) --

    pub fn load(path: &Path) -> Result<KeyRegistry, ProvaraError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ProvaraError::Serialization(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ProvaraError> {
        let rendered = serde_json::to_string_pretty(self)
            .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
        fs::write(path, rendered + "\n")?;
        Ok(())
    }
}

/// Payload for the revocation half of a rotation ceremony.
pub fn revocation_payload(
    revoked_key_id: &str,
    trust_boundary_event_id: &str,
    reason: &str,
    revoked_by: &str,
) -> Value {
    json!({
        "revoked_key_id": revoked_key_id,
        "trust_boundary_event_id": trust_boundary_event_id,
        "reason": reason,
        "revoked_by": revoked_by,
    })
}

/// Payload for the promotion half of a rotation ceremony.
pub fn promotion_payload(
    new_key_id: &str,
    new_public_key_b64: &str,
    roles: &[String],
    promoted_by: &str,
    replaces_key_id: &str,
) -> Value {
    json!({
        "new_key_id": new_key_id,
        "new_public_key_b64": new_public_key_b64,
        "algorithm": "Ed25519",
        "roles": roles,
        "promoted_by": promoted_by,
        "replaces_key_id": replaces_key_id,
    })
}

fn rotation_payload(event: &Event) -> Result<serde_json::Map<String, Value>, ProvaraError> {
    event
        .payload
        .as_object()
        .cloned()
        .ok_or_else(|| ProvaraError::InvalidEvent("rotation payload must be an object".to_string()))
}

fn require_str<'a>(
    map: &'a serde_json::Map<String, Value>,
    field: &str,
    event: &Event,
) -> Result<&'a str, ProvaraError> {
    map.get(field).and_then(Value::as_str).ok_or_else(|| {
        ValidationError::new(
            ErrorCode::RequiredFieldMissing,
            format!("rotation payload missing {field}"),
        )
        .with_event(event.event_id.clone())
        .with_field(field)
        .into()
    })
}
