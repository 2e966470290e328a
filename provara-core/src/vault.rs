//! Vault directory lifecycle: genesis ceremony, locked appends, rotation,
//! merge, and manifest regeneration.
//!
//! A vault is a shared mutable resource. Writers take an exclusive
//! advisory lock for their whole operation; readers share it. The events
//! file is append-only and fsync'd per event, so a torn tail is at most
//! one partial line, detected by JSON parse failure and truncated by the
//! next writer after fencing revalidation.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, ProvaraError, ValidationError};
use crate::event::{create_event, Event, EventKind, Namespace};
use crate::keys::{promotion_payload, revocation_payload, KeyRecord, KeyRegistry, ROLE_QUORUM, ROLE_ROOT};
use crate::manifest::{build_manifest, sign_manifest, write_manifest_files, Manifest, LOCK_FILE};
use crate::reducer::{reduce, ReducerState};
use crate::sync::{merge_delta, verify_fencing_token, FencingToken, MergeReport};
use crate::validator::{validate_vault, ValidationReport, ValidatorOptions};
use crate::{derive_key_id, sha256_hash_hex, KeyPair, PROFILE, PROTOCOL_VERSION};

const IDENTITY_DIR: &str = "identity";
const EVENTS_DIR: &str = "events";
const POLICIES_DIR: &str = "policies";
const ARTIFACTS_DIR: &str = "artifacts";
const STATE_DIR: &str = "state";
const EVENTS_FILE: &str = "events.ndjson";
const KEYS_FILE: &str = "keys.json";
const GENESIS_FILE: &str = "genesis.json";
const SAFETY_POLICY_FILE: &str = "safety.json";

/// RAII advisory lock over a vault. Released on every exit path,
/// including panics, when the guard drops.
pub struct VaultLock {
    file: File,
}

impl VaultLock {
    fn exclusive(path: &Path) -> Result<VaultLock, ProvaraError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(VaultLock { file })
    }

    fn shared(path: &Path) -> Result<VaultLock, ProvaraError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_shared()?;
        Ok(VaultLock { file })
    }
}

impl Drop for VaultLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Events loaded from disk, plus any torn trailing bytes.
struct LoadedLog {
    events: Vec<Event>,
    /// Byte length of the valid prefix; shorter than the file when the
    /// last write was interrupted mid-line.
    good_len: u64,
    torn: bool,
}

/// Handle to a vault directory.
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Bootstrap a new vault: genesis ceremony, root key registration,
    /// policy defaults, and the first NDJSON line.
    pub fn create(path: &Path, actor: &str, root_key: &KeyPair) -> Result<Vault, ProvaraError> {
        Self::create_with_quorum(path, actor, root_key, None)
    }

    /// Genesis ceremony with an optional quorum key registered at
    /// bootstrap.
    pub fn create_with_quorum(
        path: &Path,
        actor: &str,
        root_key: &KeyPair,
        quorum_public_key: Option<&[u8; 32]>,
    ) -> Result<Vault, ProvaraError> {
        if path.join(EVENTS_DIR).join(EVENTS_FILE).exists() {
            return Err(ProvaraError::Vault(format!(
                "vault already exists at {}",
                path.display()
            )));
        }

        for dir in [IDENTITY_DIR, EVENTS_DIR, POLICIES_DIR, STATE_DIR, ARTIFACTS_DIR] {
            fs::create_dir_all(path.join(dir))?;
        }

        let birth_timestamp = now_timestamp();
        let root_key_id = root_key.key_id()?;
        let uid = derive_vault_uid(&root_key.public_key(), &birth_timestamp);

        let genesis = create_event(
            &EventKind::Genesis,
            actor,
            root_key,
            None,
            Namespace::Canonical,
            &birth_timestamp,
            Some(0),
            json!({
                "uid": uid,
                "birth_timestamp": birth_timestamp,
                "root_key_id": root_key_id,
                "protocol_version": PROTOCOL_VERSION,
                "profile": PROFILE,
            }),
        )?;

        let mut registry = KeyRegistry::new();
        registry.register(KeyRecord::from_public_key(
            &root_key.public_key(),
            [ROLE_ROOT.to_string()],
            &birth_timestamp,
        )?)?;
        if let Some(quorum) = quorum_public_key {
            registry.register(KeyRecord::from_public_key(
                quorum,
                [ROLE_ROOT.to_string(), ROLE_QUORUM.to_string()],
                &birth_timestamp,
            )?)?;
        }
        registry.save(&path.join(IDENTITY_DIR).join(KEYS_FILE))?;

        let snapshot = json!({
            "uid": uid,
            "root_key_id": root_key_id,
            "protocol_version": PROTOCOL_VERSION,
            "profile": PROFILE,
            "created_at_utc": birth_timestamp,
            "event": serde_json::to_value(&genesis)
                .map_err(|e| ProvaraError::Serialization(e.to_string()))?,
        });
        fs::write(
            path.join(IDENTITY_DIR).join(GENESIS_FILE),
            serde_json::to_string_pretty(&snapshot)
                .map_err(|e| ProvaraError::Serialization(e.to_string()))?
                + "\n",
        )?;

        write_default_policies(path)?;

        let mut file = File::create(path.join(EVENTS_DIR).join(EVENTS_FILE))?;
        file.write_all(genesis.to_ndjson_line()?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        info!(vault = %path.display(), %uid, "vault created");
        Ok(Vault {
            root: path.to_path_buf(),
        })
    }

    /// Open an existing vault, checking its structure.
    pub fn open(path: &Path) -> Result<Vault, ProvaraError> {
        for required in [
            path.join(IDENTITY_DIR).join(KEYS_FILE),
            path.join(EVENTS_DIR).join(EVENTS_FILE),
        ] {
            if !required.exists() {
                return Err(ValidationError::new(
                    ErrorCode::VaultStructure,
                    format!("missing {}", required.display()),
                )
                .into());
            }
        }
        Ok(Vault {
            root: path.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_DIR).join(EVENTS_FILE)
    }

    fn keys_path(&self) -> PathBuf {
        self.root.join(IDENTITY_DIR).join(KEYS_FILE)
    }

    /// Load the key registry from `identity/keys.json`.
    pub fn registry(&self) -> Result<KeyRegistry, ProvaraError> {
        KeyRegistry::load(&self.keys_path())
    }

    fn load_log(&self) -> Result<LoadedLog, ProvaraError> {
        let raw = fs::read(self.events_path())?;
        let text = String::from_utf8(raw)
            .map_err(|e| ProvaraError::Encoding(format!("events.ndjson is not UTF-8: {e}")))?;

        let mut events = Vec::new();
        let mut good_len = 0u64;
        let mut torn = false;

        for segment in text.split_inclusive('\n') {
            let line = segment.trim_end_matches('\n').trim();
            let complete = segment.ends_with('\n');
            if line.is_empty() {
                good_len += segment.len() as u64;
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => {
                    if !complete {
                        // Parsable but unterminated: still treat as torn so
                        // the next writer rewrites it with its newline.
                        torn = true;
                        break;
                    }
                    events.push(event);
                    good_len += segment.len() as u64;
                }
                Err(e) if !complete => {
                    warn!(error = %e, "torn trailing line in events.ndjson");
                    torn = true;
                    break;
                }
                Err(e) => {
                    return Err(ProvaraError::Vault(format!(
                        "corrupt event line in {}: {e}",
                        self.events_path().display()
                    )));
                }
            }
        }

        Ok(LoadedLog {
            events,
            good_len,
            torn,
        })
    }

    /// Load all events under a shared lock.
    pub fn load_events(&self) -> Result<Vec<Event>, ProvaraError> {
        let _lock = VaultLock::shared(&self.lock_path())?;
        Ok(self.load_log()?.events)
    }

    /// Append a signed event. Takes the exclusive lock, links the signer's
    /// chain head, stamps the logical counter, writes one line, fsyncs.
    pub fn append(
        &self,
        kind: &EventKind,
        actor: &str,
        namespace: Namespace,
        payload: Value,
        keypair: &KeyPair,
    ) -> Result<Event, ProvaraError> {
        self.append_inner(kind, actor, namespace, payload, keypair, None)
    }

    /// Append guarded by a caller-minted fencing token: rejected when the
    /// head the token names is no longer current.
    pub fn append_fenced(
        &self,
        kind: &EventKind,
        actor: &str,
        namespace: Namespace,
        payload: Value,
        keypair: &KeyPair,
        token: &FencingToken,
    ) -> Result<Event, ProvaraError> {
        self.append_inner(kind, actor, namespace, payload, keypair, Some(token))
    }

    fn append_inner(
        &self,
        kind: &EventKind,
        actor: &str,
        namespace: Namespace,
        payload: Value,
        keypair: &KeyPair,
        token: Option<&FencingToken>,
    ) -> Result<Event, ProvaraError> {
        let _lock = VaultLock::exclusive(&self.lock_path())?;
        self.append_locked(kind, actor, namespace, payload, keypair, token)
    }

    /// Append body; the caller holds the exclusive lock.
    fn append_locked(
        &self,
        kind: &EventKind,
        actor: &str,
        namespace: Namespace,
        payload: Value,
        keypair: &KeyPair,
        token: Option<&FencingToken>,
    ) -> Result<Event, ProvaraError> {
        let registry = self.registry()?;
        if registry.is_identity_dead() {
            return Err(ValidationError::new(
                ErrorCode::NoSurvivingAuthority,
                "identity death: no surviving authority, vault is read-only",
            )
            .into());
        }
        let key_id = keypair.key_id()?;
        if registry.get(&key_id).is_none() {
            return Err(ValidationError::new(
                ErrorCode::KeyNotFound,
                format!("key {key_id} is not registered in this vault"),
            )
            .into());
        }
        if !registry.is_active(&key_id) {
            return Err(ValidationError::new(
                ErrorCode::RevokedKeyUse,
                format!("key {key_id} is revoked"),
            )
            .into());
        }

        let log = self.load_log()?;
        let head = log.events.last().map(|e| e.event_id.clone());

        if let Some(token) = token {
            verify_fencing_token(token, head.as_deref(), &keypair.public_key())?;
        }
        if log.torn {
            // Safe now: the lock is held and the head was revalidated.
            let file = OpenOptions::new().write(true).open(self.events_path())?;
            file.set_len(log.good_len)?;
            file.sync_all()?;
            warn!(good_len = log.good_len, "truncated torn tail before append");
        }

        let actor_head = log
            .events
            .iter()
            .rev()
            .find(|e| e.actor == actor)
            .map(|e| e.event_id.clone());
        let next_logical = log
            .events
            .iter()
            .filter_map(|e| e.ts_logical)
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);

        let event = create_event(
            kind,
            actor,
            keypair,
            actor_head,
            namespace,
            &now_timestamp(),
            Some(next_logical),
            payload,
        )?;

        let mut file = OpenOptions::new().append(true).open(self.events_path())?;
        file.write_all(event.to_ndjson_line()?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        debug!(event_id = %event.event_id, kind = kind.as_str(), "event appended");
        Ok(event)
    }

    /// Two-event rotation ceremony: revoke `revoked_key_id`, promote the
    /// new public key, both signed by `authority`. Fails closed when no
    /// surviving authority remains.
    pub fn rotate(
        &self,
        actor: &str,
        revoked_key_id: &str,
        new_public_key: &[u8; 32],
        roles: &[String],
        authority: &KeyPair,
    ) -> Result<(Event, Event), ProvaraError> {
        let _lock = VaultLock::exclusive(&self.lock_path())?;

        let mut registry = self.registry()?;
        let authority_id = authority.key_id()?;
        let new_key_id = derive_key_id(new_public_key)?;

        // Boundary: the last event in the log at revocation time.
        let boundary = self
            .load_log()?
            .events
            .last()
            .map(|e| e.event_id.clone())
            .ok_or_else(|| ProvaraError::Rotation("cannot rotate an empty vault".to_string()))?;

        // Dry-run the registry transition first so the ceremony is not
        // half-applied to the log when authority checks fail.
        registry.apply_revocation(revoked_key_id, &boundary, "rotation", &authority_id)?;
        use base64::Engine as _;
        let new_pub_b64 = base64::engine::general_purpose::STANDARD.encode(new_public_key);
        registry.apply_promotion(
            &new_pub_b64,
            roles.iter().cloned(),
            &authority_id,
            &now_timestamp(),
        )?;

        let revocation = self.append_locked(
            &EventKind::KeyRevocation,
            actor,
            Namespace::Canonical,
            revocation_payload(revoked_key_id, &boundary, "rotation", &authority_id),
            authority,
            None,
        )?;
        let promotion = self.append_locked(
            &EventKind::KeyPromotion,
            actor,
            Namespace::Canonical,
            promotion_payload(&new_key_id, &new_pub_b64, roles, &authority_id, revoked_key_id),
            authority,
            None,
        )?;

        registry.save(&self.keys_path())?;
        info!(revoked = revoked_key_id, promoted = %new_key_id, "key rotated");
        Ok((revocation, promotion))
    }

    /// Merge a delta bundle into the log under the exclusive lock. The
    /// merged, totally ordered log replaces `events.ndjson` atomically.
    pub fn merge(&self, delta: &str) -> Result<MergeReport, ProvaraError> {
        let _lock = VaultLock::exclusive(&self.lock_path())?;

        let local = self.load_log()?.events;
        let (merged, report) = merge_delta(&local, delta)?;

        let tmp_path = self.root.join(EVENTS_DIR).join(format!("{EVENTS_FILE}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            for event in &merged {
                tmp.write_all(event.to_ndjson_line()?.as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, self.events_path())?;

        info!(
            merged = report.merged_events,
            new = report.new_events,
            rejected = report.rejected.len(),
            "delta merged"
        );
        Ok(report)
    }

    /// Reduce the current log to its belief state.
    pub fn reduce(&self) -> Result<ReducerState, ProvaraError> {
        Ok(reduce(&self.load_events()?))
    }

    /// Run the full verification pass (phases 0–4).
    pub fn verify(&self, opts: &ValidatorOptions) -> Result<ValidationReport, ProvaraError> {
        let _lock = VaultLock::shared(&self.lock_path())?;
        validate_vault(&self.root, opts)
    }

    /// Regenerate and sign `manifest.json`, `manifest.sig`, and
    /// `merkle_root.txt`.
    pub fn write_manifest(&self, signer: &KeyPair) -> Result<Manifest, ProvaraError> {
        let _lock = VaultLock::exclusive(&self.lock_path())?;
        let manifest = build_manifest(&self.root, &now_timestamp())?;
        let sig = sign_manifest(&manifest, signer)?;
        write_manifest_files(&self.root, &manifest, &sig)?;
        Ok(manifest)
    }

    /// Replace the safety policy. The ratchet version may never regress.
    pub fn set_safety_policy(&self, policy: &Value) -> Result<(), ProvaraError> {
        let _lock = VaultLock::exclusive(&self.lock_path())?;
        let path = self.root.join(POLICIES_DIR).join(SAFETY_POLICY_FILE);

        let next_version = policy
            .get("ratchet_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProvaraError::Policy("policy missing ratchet_version".to_string()))?;
        if let Ok(raw) = fs::read_to_string(&path) {
            let current: Value = serde_json::from_str(&raw)
                .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
            let current_version = current
                .get("ratchet_version")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if next_version < current_version {
                return Err(ValidationError::new(
                    ErrorCode::PolicyRatchetViolation,
                    format!("ratchet_version {next_version} < current {current_version}"),
                )
                .into());
            }
        }

        fs::write(
            &path,
            serde_json::to_string_pretty(policy)
                .map_err(|e| ProvaraError::Serialization(e.to_string()))?
                + "\n",
        )?;
        Ok(())
    }
}

fn write_default_policies(path: &Path) -> Result<(), ProvaraError> {
    let defaults = [
        (SAFETY_POLICY_FILE, json!({"ratchet_version": 0, "rules": {}})),
        ("retention.json", json!({"mode": "keep_forever"})),
        ("sync.json", json!({"mode": "manual"})),
    ];
    for (name, value) in defaults {
        fs::write(
            path.join(POLICIES_DIR).join(name),
            serde_json::to_string_pretty(&value)
                .map_err(|e| ProvaraError::Serialization(e.to_string()))?
                + "\n",
        )?;
    }
    Ok(())
}

/// Stable vault identifier derived from the root key and birth time.
fn derive_vault_uid(root_public_key: &[u8; 32], birth_timestamp: &str) -> String {
    let mut preimage = root_public_key.to_vec();
    preimage.extend_from_slice(birth_timestamp.as_bytes());
    format!("vault_{}", &sha256_hash_hex(&preimage)[..16])
}

/// Current wall clock in the event timestamp format.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
