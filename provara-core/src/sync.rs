//! Union-merge sync: delta bundles, fencing tokens, fork surfacing.
//!
//! Merging never destroys events: C = dedup(A ∪ B), totally ordered by
//! `(timestamp_utc, event_id)`. Forks survive the merge; the reducer
//! contests their downstream evidence. State is always re-derived from
//! the merged log, never patched.

use std::collections::BTreeSet;

use jcs_rs::canonicalize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::chain::{detect_forks, Fork};
use crate::error::{ErrorCode, ProvaraError};
use crate::event::Event;
use crate::{sha256_hash, sha256_hash_hex, KeyPair};

/// Wire tag of the delta header line.
pub const DELTA_TYPE: &str = "provara_delta_v1";

/// First line of a delta bundle; NDJSON events follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaHeader {
    #[serde(rename = "type")]
    pub kind: String,
    /// Head the sender last saw, if any.
    pub since_hash: Option<String>,
    pub event_count: u64,
    /// Key ids the sender believes the receiver needs.
    pub keys: Vec<String>,
}

/// One quarantined delta line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLine {
    /// 1-based line number within the bundle.
    pub line: usize,
    pub code: ErrorCode,
    pub message: String,
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Events in the merged log.
    pub merged_events: u64,
    /// Events newly admitted from the delta.
    pub new_events: u64,
    /// Delta events already present locally.
    pub duplicates: u64,
    pub rejected: Vec<RejectedLine>,
    pub forks: Vec<Fork>,
}

/// Dedup key: `event_id` when present, canonical content hash otherwise.
fn dedup_key(event: &Event) -> Result<String, ProvaraError> {
    if !event.event_id.is_empty() {
        return Ok(event.event_id.clone());
    }
    let map = event.to_value()?;
    let bytes = canonicalize(&Value::Object(map))?;
    Ok(sha256_hash_hex(&bytes))
}

/// C = dedup(A ∪ B), totally ordered by `(timestamp_utc, event_id)`.
///
/// The caller re-runs the reducer on the result; merged state is never
/// derived incrementally.
pub fn union_merge(a: &[Event], b: &[Event]) -> Result<Vec<Event>, ProvaraError> {
    let mut seen = BTreeSet::new();
    let mut merged = Vec::with_capacity(a.len() + b.len());

    for event in a.iter().chain(b.iter()) {
        let key = dedup_key(event)?;
        if seen.insert(key) {
            merged.push(event.clone());
        }
    }

    merged.sort_by(|x, y| {
        (x.timestamp_utc.as_str(), x.event_id.as_str())
            .cmp(&(y.timestamp_utc.as_str(), y.event_id.as_str()))
    });
    Ok(merged)
}

/// Serialize events as a delta bundle: header line plus NDJSON events.
pub fn export_delta(events: &[Event], since_hash: Option<&str>) -> Result<String, ProvaraError> {
    let keys: BTreeSet<String> = events.iter().map(|e| e.actor_key_id.clone()).collect();
    let header = DeltaHeader {
        kind: DELTA_TYPE.to_string(),
        since_hash: since_hash.map(str::to_string),
        event_count: events.len() as u64,
        keys: keys.into_iter().collect(),
    };

    let mut out = serde_json::to_string(&header)
        .map_err(|e| ProvaraError::Serialization(e.to_string()))?;
    out.push('\n');
    for event in events {
        out.push_str(&event.to_ndjson_line()?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a delta bundle. Malformed event lines are quarantined one by one
/// and reported; the batch itself still parses.
pub fn parse_delta(
    input: &str,
) -> Result<(DeltaHeader, Vec<Event>, Vec<RejectedLine>), ProvaraError> {
    let mut lines = input.lines().enumerate();

    let (_, header_line) = lines
        .next()
        .ok_or_else(|| ProvaraError::Sync("empty delta bundle".to_string()))?;
    let header: DeltaHeader = serde_json::from_str(header_line)
        .map_err(|e| ProvaraError::Sync(format!("invalid delta header: {e}")))?;
    if header.kind != DELTA_TYPE {
        return Err(ProvaraError::Sync(format!(
            "unsupported delta type: {}",
            header.kind
        )));
    }

    let mut events = Vec::new();
    let mut rejected = Vec::new();
    for (idx, line) in lines {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(raw) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = idx + 1, error = %e, "quarantined delta line");
                rejected.push(RejectedLine {
                    line: idx + 1,
                    code: ErrorCode::MalformedJson,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok((header, events, rejected))
}

/// Merge a delta bundle into a local log.
pub fn merge_delta(
    local: &[Event],
    delta: &str,
) -> Result<(Vec<Event>, MergeReport), ProvaraError> {
    let (header, incoming, rejected) = parse_delta(delta)?;
    debug!(
        declared = header.event_count,
        parsed = incoming.len(),
        rejected = rejected.len(),
        "merging delta bundle"
    );

    let mut known = BTreeSet::new();
    for event in local {
        known.insert(dedup_key(event)?);
    }
    let mut new_events = 0u64;
    let mut duplicates = 0u64;
    for event in &incoming {
        if known.contains(&dedup_key(event)?) {
            duplicates += 1;
        } else {
            new_events += 1;
        }
    }

    let merged = union_merge(local, &incoming)?;
    let forks = detect_forks(&merged);
    if !forks.is_empty() {
        warn!(forks = forks.len(), "merge preserved forked branches");
    }

    let report = MergeReport {
        merged_events: merged.len() as u64,
        new_events,
        duplicates,
        rejected,
        forks,
    };
    Ok((merged, report))
}

// ---------------------------------------------------------------------------
// Fencing tokens
// ---------------------------------------------------------------------------

/// A signed claim that the writer observed a specific log head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingToken {
    /// Head event id the writer saw; empty string for an empty log.
    pub latest_event_id: String,
    pub timestamp_utc: String,
    pub nonce: String,
    /// `SHA-256(latest ∥ ":" ∥ timestamp ∥ ":" ∥ nonce)` as hex.
    pub token_hash: String,
    pub key_id: String,
    /// Ed25519 over the raw token hash bytes, Base64.
    pub sig: String,
}

fn fencing_digest(latest_event_id: &str, timestamp_utc: &str, nonce: &str) -> [u8; 32] {
    sha256_hash(format!("{latest_event_id}:{timestamp_utc}:{nonce}").as_bytes())
}

/// Mint a fencing token over the observed head.
pub fn mint_fencing_token(
    latest_event_id: &str,
    timestamp_utc: &str,
    nonce: &str,
    keypair: &KeyPair,
) -> Result<FencingToken, ProvaraError> {
    let digest = fencing_digest(latest_event_id, timestamp_utc, nonce);
    let signature = keypair.sign(&digest);
    use base64::Engine as _;
    Ok(FencingToken {
        latest_event_id: latest_event_id.to_string(),
        timestamp_utc: timestamp_utc.to_string(),
        nonce: nonce.to_string(),
        token_hash: hex::encode(digest),
        key_id: keypair.key_id()?,
        sig: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
    })
}

/// Accept a token iff its signature verifies and the head it names is
/// still current. A superseded head means a lost-update hazard: reject.
pub fn verify_fencing_token(
    token: &FencingToken,
    current_head: Option<&str>,
    public_key: &[u8; 32],
) -> Result<(), ProvaraError> {
    use base64::Engine as _;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let digest = fencing_digest(&token.latest_event_id, &token.timestamp_utc, &token.nonce);
    if hex::encode(digest) != token.token_hash {
        return Err(ProvaraError::Crypto(
            "fencing token hash does not match its fields".to_string(),
        ));
    }

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&token.sig)
        .map_err(|e| ProvaraError::Encoding(format!("Base64 decode failed: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid signature: {e}")))?;
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| ProvaraError::Crypto(format!("Invalid public key: {e}")))?;
    verifying_key
        .verify(&digest, &signature)
        .map_err(|_| ProvaraError::Crypto("fencing token signature invalid".to_string()))?;

    let head = current_head.unwrap_or("");
    if token.latest_event_id != head {
        return Err(ProvaraError::StaleFencingToken(format!(
            "token names head {:?} but the log is at {:?}",
            token.latest_event_id, head
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{create_event, EventKind, Namespace};
    use crate::reducer::reduce;
    use rand::thread_rng;
    use serde_json::json;

    fn observation(kp: &KeyPair, actor: &str, prev: Option<String>, ts: &str, value: &str) -> Event {
        create_event(
            &EventKind::Observation,
            actor,
            kp,
            prev,
            Namespace::Local,
            ts,
            None,
            json!({"subject": "door", "predicate": "status", "value": value, "confidence": 0.9}),
        )
        .unwrap()
    }

    #[test]
    fn union_merge_dedups_and_orders() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let kb = KeyPair::generate(&mut rng);

        let a1 = observation(&ka, "alice", None, "2026-01-01T00:00:01Z", "open");
        let b1 = observation(&kb, "bob", None, "2026-01-01T00:00:02Z", "closed");
        let shared = observation(&ka, "alice", Some(a1.event_id.clone()), "2026-01-01T00:00:03Z", "open");

        let left = vec![a1.clone(), shared.clone()];
        let right = vec![b1.clone(), shared.clone()];
        let merged = union_merge(&left, &right).unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].event_id, a1.event_id);
        assert_eq!(merged[1].event_id, b1.event_id);
        assert_eq!(merged[2].event_id, shared.event_id);
    }

    #[test]
    fn merge_order_ties_break_on_event_id() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let kb = KeyPair::generate(&mut rng);

        let ts = "2026-01-01T00:00:01Z";
        let a = observation(&ka, "alice", None, ts, "open");
        let b = observation(&kb, "bob", None, ts, "closed");

        let merged = union_merge(&[a.clone()], &[b.clone()]).unwrap();
        let expected_first = if a.event_id < b.event_id { &a } else { &b };
        assert_eq!(merged[0].event_id, expected_first.event_id);
    }

    #[test]
    fn merged_logs_reduce_identically_from_either_side() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let kb = KeyPair::generate(&mut rng);

        let a1 = observation(&ka, "alice", None, "2026-01-01T00:00:01Z", "open");
        let b1 = observation(&kb, "bob", None, "2026-01-01T00:00:02Z", "closed");

        let left = union_merge(&[a1.clone()], &[b1.clone()]).unwrap();
        let right = union_merge(&[b1], &[a1]).unwrap();
        assert_eq!(
            reduce(&left).metadata.state_hash,
            reduce(&right).metadata.state_hash
        );
    }

    #[test]
    fn delta_round_trip() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let a1 = observation(&ka, "alice", None, "2026-01-01T00:00:01Z", "open");
        let a2 = observation(&ka, "alice", Some(a1.event_id.clone()), "2026-01-01T00:00:02Z", "open");

        let bundle = export_delta(&[a1.clone(), a2.clone()], Some(&a1.event_id)).unwrap();
        let (header, events, rejected) = parse_delta(&bundle).unwrap();

        assert_eq!(header.kind, DELTA_TYPE);
        assert_eq!(header.event_count, 2);
        assert_eq!(header.since_hash.as_deref(), Some(a1.event_id.as_str()));
        assert_eq!(header.keys, vec![ka.key_id().unwrap()]);
        assert_eq!(events, vec![a1, a2]);
        assert!(rejected.is_empty());
    }

    #[test]
    fn malformed_delta_lines_are_quarantined_not_fatal() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let good = observation(&ka, "alice", None, "2026-01-01T00:00:01Z", "open");

        let mut bundle = export_delta(&[good.clone()], None).unwrap();
        bundle.push_str("this is not json\n");
        bundle.push_str("{\"also\": \"not an event\"}\n");

        let (local_merged, report) = merge_delta(&[], &bundle).unwrap();
        assert_eq!(local_merged.len(), 1);
        assert_eq!(report.new_events, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].code, ErrorCode::MalformedJson);
        assert_eq!(report.rejected[0].line, 2);
    }

    #[test]
    fn merge_reports_duplicates_and_forks() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);

        let a1 = observation(&ka, "alice", None, "2026-01-01T00:00:01Z", "open");
        let a2 = observation(&ka, "alice", Some(a1.event_id.clone()), "2026-01-01T00:00:02Z", "open");
        // Divergent sibling of a2: same parent, different content.
        let a2b = observation(&ka, "alice", Some(a1.event_id.clone()), "2026-01-01T00:00:03Z", "closed");

        let local = vec![a1.clone(), a2.clone()];
        let bundle = export_delta(&[a1, a2b], None).unwrap();
        let (merged, report) = merge_delta(&local, &bundle).unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.new_events, 1);
        assert_eq!(report.forks.len(), 1);
        assert_eq!(report.forks[0].actor, "alice");
    }

    #[test]
    fn fencing_token_round_trip_and_staleness() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let head = "evt_0123456789abcdef01234567";

        let token =
            mint_fencing_token(head, "2026-01-01T00:00:01Z", "nonce-1", &ka).unwrap();
        verify_fencing_token(&token, Some(head), &ka.public_key()).unwrap();

        // Head moved on: the token is stale.
        let err = verify_fencing_token(
            &token,
            Some("evt_ffffffffffffffffffffffff"),
            &ka.public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, ProvaraError::StaleFencingToken(_)));
    }

    #[test]
    fn tampered_fencing_token_is_rejected() {
        let mut rng = thread_rng();
        let ka = KeyPair::generate(&mut rng);
        let head = "evt_0123456789abcdef01234567";

        let mut token =
            mint_fencing_token(head, "2026-01-01T00:00:01Z", "nonce-1", &ka).unwrap();
        token.latest_event_id = "evt_ffffffffffffffffffffffff".to_string();

        let err = verify_fencing_token(
            &token,
            Some("evt_ffffffffffffffffffffffff"),
            &ka.public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, ProvaraError::Crypto(_)));
    }
}
