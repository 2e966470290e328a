//! Error taxonomy for the Provara core.
//!
//! Validation failures carry a stable machine-readable code. Codes are
//! grouped by concern: integrity (E001–E013), format (E100–E105), key
//! management (E200–E204), schema (E300–E303) and safety (E400). The code
//! strings are part of the wire contract and never change meaning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable validation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Integrity
    EventIdMismatch,
    InvalidSignature,
    DuplicateEventId,
    FirstEventPrevNotNull,
    OrphanChainReference,
    CrossActorChainReference,
    BrokenCausalChain,
    ForkDetected,
    StateHashDivergence,
    MerkleRootMismatch,
    ManifestHashMismatch,
    ManifestFileMissing,
    ManifestSignatureMismatch,
    // Format
    MalformedJson,
    EventIdFormat,
    KeyIdFormat,
    TimestampFormat,
    SigFormat,
    CanonicalFormat,
    // Key management
    KeyNotFound,
    RevokedKeyUse,
    SelfSignedRotation,
    PromotionWithoutRevocation,
    NoSurvivingAuthority,
    // Schema
    RequiredFieldMissing,
    InvalidEventType,
    VaultStructure,
    SpecVersionMismatch,
    // Safety
    PolicyRatchetViolation,
}

impl ErrorCode {
    /// Numeric code in the stable registry.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::EventIdMismatch => "E001",
            ErrorCode::InvalidSignature => "E002",
            ErrorCode::DuplicateEventId => "E003",
            ErrorCode::FirstEventPrevNotNull => "E004",
            ErrorCode::OrphanChainReference => "E005",
            ErrorCode::CrossActorChainReference => "E006",
            ErrorCode::BrokenCausalChain => "E007",
            ErrorCode::ForkDetected => "E008",
            ErrorCode::StateHashDivergence => "E009",
            ErrorCode::MerkleRootMismatch => "E010",
            ErrorCode::ManifestHashMismatch => "E011",
            ErrorCode::ManifestFileMissing => "E012",
            ErrorCode::ManifestSignatureMismatch => "E013",
            ErrorCode::MalformedJson => "E100",
            ErrorCode::EventIdFormat => "E101",
            ErrorCode::KeyIdFormat => "E102",
            ErrorCode::TimestampFormat => "E103",
            ErrorCode::SigFormat => "E104",
            ErrorCode::CanonicalFormat => "E105",
            ErrorCode::KeyNotFound => "E200",
            ErrorCode::RevokedKeyUse => "E201",
            ErrorCode::SelfSignedRotation => "E202",
            ErrorCode::PromotionWithoutRevocation => "E203",
            ErrorCode::NoSurvivingAuthority => "E204",
            ErrorCode::RequiredFieldMissing => "E300",
            ErrorCode::InvalidEventType => "E301",
            ErrorCode::VaultStructure => "E302",
            ErrorCode::SpecVersionMismatch => "E303",
            ErrorCode::PolicyRatchetViolation => "E400",
        }
    }

    /// Screaming-snake name, e.g. `EVENT_ID_MISMATCH`.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::EventIdMismatch => "EVENT_ID_MISMATCH",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::DuplicateEventId => "DUPLICATE_EVENT_ID",
            ErrorCode::FirstEventPrevNotNull => "FIRST_EVENT_PREV_NOT_NULL",
            ErrorCode::OrphanChainReference => "ORPHAN_CHAIN_REFERENCE",
            ErrorCode::CrossActorChainReference => "CROSS_ACTOR_CHAIN_REFERENCE",
            ErrorCode::BrokenCausalChain => "BROKEN_CAUSAL_CHAIN",
            ErrorCode::ForkDetected => "FORK_DETECTED",
            ErrorCode::StateHashDivergence => "STATE_HASH_DIVERGENCE",
            ErrorCode::MerkleRootMismatch => "MERKLE_ROOT_MISMATCH",
            ErrorCode::ManifestHashMismatch => "MANIFEST_HASH_MISMATCH",
            ErrorCode::ManifestFileMissing => "MANIFEST_FILE_MISSING",
            ErrorCode::ManifestSignatureMismatch => "MANIFEST_SIGNATURE_MISMATCH",
            ErrorCode::MalformedJson => "MALFORMED_JSON",
            ErrorCode::EventIdFormat => "EVENT_ID_FORMAT",
            ErrorCode::KeyIdFormat => "KEY_ID_FORMAT",
            ErrorCode::TimestampFormat => "TIMESTAMP_FORMAT",
            ErrorCode::SigFormat => "SIG_FORMAT",
            ErrorCode::CanonicalFormat => "CANONICAL_FORMAT",
            ErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            ErrorCode::RevokedKeyUse => "REVOKED_KEY_USE",
            ErrorCode::SelfSignedRotation => "SELF_SIGNED_ROTATION",
            ErrorCode::PromotionWithoutRevocation => "PROMOTION_WITHOUT_REVOCATION",
            ErrorCode::NoSurvivingAuthority => "NO_SURVIVING_AUTHORITY",
            ErrorCode::RequiredFieldMissing => "REQUIRED_FIELD_MISSING",
            ErrorCode::InvalidEventType => "INVALID_EVENT_TYPE",
            ErrorCode::VaultStructure => "VAULT_STRUCTURE",
            ErrorCode::SpecVersionMismatch => "SPEC_VERSION_MISMATCH",
            ErrorCode::PolicyRatchetViolation => "POLICY_RATCHET_VIOLATION",
        }
    }
}

/// A single structured validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}{}", .code.name(), .event_id.as_deref().map(|id| format!(" (event {id})")).unwrap_or_default())]
pub struct ValidationError {
    pub code: ErrorCode,
    /// Event the finding is anchored to, when applicable.
    pub event_id: Option<String>,
    /// Failing field, when applicable.
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ValidationError {
            code,
            event_id: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Errors that can occur in provara-core operations.
#[derive(Debug, Error)]
pub enum ProvaraError {
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
    #[error("Chain validation failed: {0}")]
    ChainValidation(String),
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Rotation error: {0}")]
    Rotation(String),
    #[error("Vault error: {0}")]
    Vault(String),
    #[error("Unsafe path in manifest: {0}")]
    PathSafety(String),
    #[error("Policy violation: {0}")]
    Policy(String),
    #[error("Sync error: {0}")]
    Sync(String),
    #[error("Stale fencing token: {0}")]
    StaleFencingToken(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<jcs_rs::CanonicalizeError> for ProvaraError {
    fn from(e: jcs_rs::CanonicalizeError) -> Self {
        ProvaraError::Serialization(e.to_string())
    }
}
