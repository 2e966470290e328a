//! Deterministic four-namespace belief reducer.
//!
//! `reduce(events)` folds a log into `{canonical, local, contested,
//! archived}` plus metadata. The reducer is pure and tolerant of unknown
//! event types; it performs no signature checks and trusts the validator
//! to have filtered invalid events (validate, then reduce).
//!
//! Belief entries, contested groups and archived records are typed; the
//! `state_hash` is the SHA-256 of the canonical JSON of all namespaces
//! plus the metadata block minus the hash field itself.

use std::collections::{BTreeMap, BTreeSet};

use jcs_rs::{canonical_hash_hex, canonical_to_string};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{Event, EventKind};

pub const REDUCER_NAME: &str = "SovereignReducerV0";
pub const REDUCER_VERSION: &str = "1.0.0";
const DEFAULT_CONFLICT_CONFIDENCE_THRESHOLD: f64 = 0.50;
const DEFAULT_OBSERVATION_CONFIDENCE: f64 = 1.0;
const DEFAULT_ASSERTION_CONFIDENCE: f64 = 0.35;

/// One observation or assertion backing a belief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub event_id: String,
    pub actor: String,
    pub value: Value,
    pub confidence: f64,
    pub timestamp: String,
}

/// A belief held in `canonical` or `local`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefEntry {
    pub value: Value,
    pub confidence: f64,
    pub actor: String,
    pub source_event_id: String,
    pub timestamp: String,
    pub evidence: Vec<Evidence>,
}

/// A superseded or retracted belief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEntry {
    #[serde(flatten)]
    pub entry: BeliefEntry,
    pub retracted: bool,
    pub superseded_by: String,
}

/// Evidence sharing one value inside a contested key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceGroup {
    pub value: Value,
    pub evidence: Vec<Evidence>,
}

/// A key with conflicting evidence, parked until resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestedEntry {
    pub evidence_groups: Vec<EvidenceGroup>,
    pub awaiting_resolution: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerConfig {
    pub conflict_confidence_threshold: f64,
    pub default_observation_confidence: f64,
    pub default_assertion_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerInfo {
    pub name: String,
    pub version: String,
    pub config: ReducerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub event_count: u64,
    pub last_event_id: Option<String>,
    pub current_epoch: Option<String>,
    pub reducer: ReducerInfo,
    #[serde(rename = "_ignored_types")]
    pub ignored_types: BTreeMap<String, u64>,
    /// Excluded from its own hash preimage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

/// Reducer output: four namespaces plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerState {
    pub canonical: BTreeMap<String, BeliefEntry>,
    pub local: BTreeMap<String, BeliefEntry>,
    pub contested: BTreeMap<String, ContestedEntry>,
    pub archived: BTreeMap<String, Vec<ArchivedEntry>>,
    pub metadata: StateMetadata,
}

impl ReducerState {
    pub fn state_hash(&self) -> Option<&str> {
        self.metadata.state_hash.as_deref()
    }
}

/// The Profile A reducer.
pub struct SovereignReducerV0 {
    pub state: ReducerState,
    /// First event id seen per (actor, prev_event_hash) link.
    chain_links: BTreeMap<(String, Option<String>), String>,
    /// Events on a forked branch: fork heads and their descendants.
    forked: BTreeSet<String>,
    /// Belief key each event contributed to, for retroactive contesting.
    contributions: BTreeMap<String, String>,
}

impl SovereignReducerV0 {
    pub fn new(conflict_confidence_threshold: Option<f64>) -> Self {
        let threshold =
            conflict_confidence_threshold.unwrap_or(DEFAULT_CONFLICT_CONFIDENCE_THRESHOLD);

        let mut reducer = SovereignReducerV0 {
            state: ReducerState {
                canonical: BTreeMap::new(),
                local: BTreeMap::new(),
                contested: BTreeMap::new(),
                archived: BTreeMap::new(),
                metadata: StateMetadata {
                    event_count: 0,
                    last_event_id: None,
                    current_epoch: None,
                    reducer: ReducerInfo {
                        name: REDUCER_NAME.to_string(),
                        version: REDUCER_VERSION.to_string(),
                        config: ReducerConfig {
                            conflict_confidence_threshold: threshold,
                            default_observation_confidence: DEFAULT_OBSERVATION_CONFIDENCE,
                            default_assertion_confidence: DEFAULT_ASSERTION_CONFIDENCE,
                        },
                    },
                    ignored_types: BTreeMap::new(),
                    state_hash: None,
                },
            },
            chain_links: BTreeMap::new(),
            forked: BTreeSet::new(),
            contributions: BTreeMap::new(),
        };

        reducer.update_state_hash();
        reducer
    }

    fn threshold(&self) -> f64 {
        self.state
            .metadata
            .reducer
            .config
            .conflict_confidence_threshold
    }

    pub fn apply_events(&mut self, events: &[Event]) {
        for event in events {
            self.apply_event_internal(event);
        }
        self.update_state_hash();
    }

    pub fn apply_event(&mut self, event: &Event) {
        self.apply_event_internal(event);
        self.update_state_hash();
    }

    fn apply_event_internal(&mut self, event: &Event) {
        let forked = self.track_fork(event);

        match event.kind() {
            Some(EventKind::Observation) => self.handle_observation(event, false, forked),
            Some(EventKind::Assertion) => self.handle_observation(event, true, forked),
            Some(EventKind::Attestation) => self.handle_attestation(event),
            Some(EventKind::Retraction) => self.handle_retraction(event),
            Some(EventKind::ReducerEpoch) => self.handle_reducer_epoch(event),
            // Registry events and genesis change no belief state.
            Some(EventKind::Genesis)
            | Some(EventKind::KeyRevocation)
            | Some(EventKind::KeyPromotion) => {}
            Some(EventKind::Custom(name)) => {
                *self.state.metadata.ignored_types.entry(name).or_insert(0) += 1;
            }
            None => {
                *self
                    .state
                    .metadata
                    .ignored_types
                    .entry(event.event_type.clone())
                    .or_insert(0) += 1;
            }
        }

        self.state.metadata.last_event_id = Some(event.event_id.clone());
        self.state.metadata.event_count += 1;
    }

    /// Track `(actor, prev)` links; returns whether this event sits on a
    /// forked branch. When a fork is first detected, the earlier sibling's
    /// contribution is retroactively contested.
    fn track_fork(&mut self, event: &Event) -> bool {
        if let Some(prev) = &event.prev_event_hash {
            if self.forked.contains(prev) {
                self.forked.insert(event.event_id.clone());
                return true;
            }
        }

        let link = (event.actor.clone(), event.prev_event_hash.clone());
        match self.chain_links.get(&link) {
            None => {
                self.chain_links.insert(link, event.event_id.clone());
                false
            }
            Some(first) if *first == event.event_id => self.forked.contains(&event.event_id),
            Some(first) => {
                let first = first.clone();
                self.forked.insert(first.clone());
                self.forked.insert(event.event_id.clone());
                if let Some(key) = self.contributions.get(&first).cloned() {
                    self.contest_key(&key);
                }
                true
            }
        }
    }

    fn handle_observation(&mut self, event: &Event, is_assertion: bool, forked: bool) {
        let Some(payload) = event.payload.as_object() else {
            return;
        };
        let Some(key) = belief_key(payload) else {
            return;
        };

        let threshold = self.threshold();
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        let default_confidence = if is_assertion {
            self.state.metadata.reducer.config.default_assertion_confidence
        } else {
            self.state
                .metadata
                .reducer
                .config
                .default_observation_confidence
        };
        let confidence = payload
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(default_confidence);

        let ev = Evidence {
            event_id: event.event_id.clone(),
            actor: event.actor.clone(),
            value: value.clone(),
            confidence,
            timestamp: event.timestamp_utc.clone(),
        };

        self.contributions
            .insert(event.event_id.clone(), key.clone());

        if forked {
            self.contest_key(&key);
            self.add_contested_evidence(&key, ev, false);
            return;
        }

        // Canonical wins: record as evidence only.
        if let Some(entry) = self.state.canonical.get_mut(&key) {
            entry.evidence.push(ev);
            return;
        }

        if let Some(existing) = self.state.local.get_mut(&key) {
            if existing.value == value {
                if confidence > existing.confidence {
                    existing.confidence = confidence;
                    existing.actor = ev.actor.clone();
                    existing.source_event_id = ev.event_id.clone();
                    existing.timestamp = ev.timestamp.clone();
                }
                existing.evidence.push(ev);
            } else if existing.confidence.max(confidence) >= threshold {
                let entry = self.state.local.remove(&key).expect("entry present");
                let mut items = entry.evidence;
                items.push(ev);
                self.insert_contested(&key, items);
            } else {
                // Low-confidence disagreement: the newer value takes local,
                // the full evidence trail is carried over.
                let mut evidence = existing.evidence.clone();
                evidence.push(ev.clone());
                self.state.local.insert(
                    key,
                    BeliefEntry {
                        value,
                        confidence,
                        actor: ev.actor,
                        source_event_id: ev.event_id,
                        timestamp: ev.timestamp,
                        evidence,
                    },
                );
            }
            return;
        }

        if self.state.contested.contains_key(&key) {
            self.add_contested_evidence(&key, ev, true);
            return;
        }

        self.state.local.insert(
            key,
            BeliefEntry {
                value,
                confidence,
                actor: ev.actor.clone(),
                source_event_id: ev.event_id.clone(),
                timestamp: ev.timestamp.clone(),
                evidence: vec![ev],
            },
        );
    }

    fn handle_attestation(&mut self, event: &Event) {
        let Some(payload) = event.payload.as_object() else {
            return;
        };
        let Some(key) = belief_key(payload) else {
            return;
        };

        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        let target = payload
            .get("target_event_id")
            .and_then(Value::as_str)
            .unwrap_or(&event.event_id)
            .to_string();

        if let Some(prior) = self.state.canonical.remove(&key) {
            self.state
                .archived
                .entry(key.clone())
                .or_default()
                .push(ArchivedEntry {
                    entry: prior,
                    retracted: false,
                    superseded_by: event.event_id.clone(),
                });
        }

        self.state.canonical.insert(
            key.clone(),
            BeliefEntry {
                value: value.clone(),
                confidence: 1.0,
                actor: event.actor.clone(),
                source_event_id: event.event_id.clone(),
                timestamp: event.timestamp_utc.clone(),
                evidence: vec![Evidence {
                    event_id: target,
                    actor: event.actor.clone(),
                    value,
                    confidence: 1.0,
                    timestamp: event.timestamp_utc.clone(),
                }],
            },
        );

        self.state.local.remove(&key);
        self.state.contested.remove(&key);
    }

    fn handle_retraction(&mut self, event: &Event) {
        let Some(payload) = event.payload.as_object() else {
            return;
        };
        let Some(key) = belief_key(payload) else {
            return;
        };

        self.state.local.remove(&key);
        self.state.contested.remove(&key);

        if let Some(prior) = self.state.canonical.remove(&key) {
            self.state
                .archived
                .entry(key)
                .or_default()
                .push(ArchivedEntry {
                    entry: prior,
                    retracted: true,
                    superseded_by: event.event_id.clone(),
                });
        }
    }

    fn handle_reducer_epoch(&mut self, event: &Event) {
        let epoch = event
            .payload
            .get("epoch_id")
            .and_then(Value::as_str)
            .unwrap_or(&event.event_id)
            .to_string();
        self.state.metadata.current_epoch = Some(epoch);
    }

    /// Move any local entry for `key` into contested, preserving evidence.
    fn contest_key(&mut self, key: &str) {
        if let Some(entry) = self.state.local.remove(key) {
            self.insert_contested(key, entry.evidence);
        } else if let Some(existing) = self.state.contested.get_mut(key) {
            existing.awaiting_resolution = true;
        }
    }

    /// Group evidence items by value and fold them into the contested entry.
    fn insert_contested(&mut self, key: &str, items: Vec<Evidence>) {
        let entry = self
            .state
            .contested
            .entry(key.to_string())
            .or_insert_with(|| ContestedEntry {
                evidence_groups: Vec::new(),
                awaiting_resolution: true,
            });
        for ev in items {
            push_group_evidence(&mut entry.evidence_groups, ev);
        }
        entry.awaiting_resolution = true;
    }

    /// Append evidence to an existing contested key. With `gate` set, a new
    /// value group is only opened at or above the conflict threshold;
    /// weaker conflicting evidence is dropped (the key is already parked).
    fn add_contested_evidence(&mut self, key: &str, ev: Evidence, gate: bool) {
        let threshold = self.threshold();
        let Some(entry) = self.state.contested.get_mut(key) else {
            self.insert_contested(key, vec![ev]);
            return;
        };
        let matches_existing = entry.evidence_groups.iter().any(|g| g.value == ev.value);
        if matches_existing || !gate || ev.confidence >= threshold {
            push_group_evidence(&mut entry.evidence_groups, ev);
        }
        entry.awaiting_resolution = true;
    }

    fn update_state_hash(&mut self) {
        self.state.metadata.state_hash = None;
        let value = serde_json::to_value(&self.state).unwrap_or(Value::Null);
        self.state.metadata.state_hash = Some(canonical_hash_hex(&value).unwrap_or_default());
    }
}

/// Fold a log into its belief state. Pure and deterministic: the same
/// event list always yields the same `state_hash`.
pub fn reduce(events: &[Event]) -> ReducerState {
    let mut reducer = SovereignReducerV0::new(None);
    reducer.apply_events(events);
    reducer.state
}

fn belief_key(payload: &Map<String, Value>) -> Option<String> {
    let subject = payload.get("subject").and_then(Value::as_str)?;
    let predicate = payload.get("predicate").and_then(Value::as_str)?;
    Some(format!("{subject}:{predicate}"))
}

/// Insert into the group holding `ev.value`, creating it at its sorted
/// position (groups are ordered by the canonical form of their value so
/// the state hashes identically regardless of arrival order).
fn push_group_evidence(groups: &mut Vec<EvidenceGroup>, ev: Evidence) {
    if let Some(group) = groups.iter_mut().find(|g| g.value == ev.value) {
        group.evidence.push(ev);
        return;
    }
    let rendered = canonical_to_string(&ev.value).unwrap_or_default();
    let position = groups
        .iter()
        .position(|g| canonical_to_string(&g.value).unwrap_or_default() > rendered)
        .unwrap_or(groups.len());
    groups.insert(
        position,
        EvidenceGroup {
            value: ev.value.clone(),
            evidence: vec![ev],
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Namespace;
    use serde_json::json;

    fn event(id: &str, actor: &str, kind: &str, prev: Option<&str>, payload: Value) -> Event {
        Event {
            event_id: id.to_string(),
            event_type: kind.to_string(),
            actor: actor.to_string(),
            actor_key_id: "bp1_0000000000000000".to_string(),
            ts_logical: None,
            timestamp_utc: "2026-01-01T00:00:00Z".to_string(),
            prev_event_hash: prev.map(str::to_string),
            namespace: Namespace::Local,
            payload,
            sig: None,
        }
    }

    fn observation(id: &str, actor: &str, prev: Option<&str>, value: &str, confidence: f64) -> Event {
        event(
            id,
            actor,
            "OBSERVATION",
            prev,
            json!({"subject": "door", "predicate": "status", "value": value, "confidence": confidence}),
        )
    }

    #[test]
    fn empty_state_hash_is_reproducible() {
        let a = SovereignReducerV0::new(None);
        let b = SovereignReducerV0::new(None);
        assert!(a.state.metadata.state_hash.is_some());
        assert_eq!(a.state.metadata.state_hash, b.state.metadata.state_hash);
    }

    #[test]
    fn observation_lands_in_local() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.9));

        let entry = &reducer.state.local["door:status"];
        assert_eq!(entry.value, json!("open"));
        assert_eq!(entry.confidence, 0.9);
        assert_eq!(entry.evidence.len(), 1);
        assert_eq!(reducer.state.metadata.event_count, 1);
        assert_eq!(reducer.state.metadata.last_event_id.as_deref(), Some("evt_a"));
    }

    #[test]
    fn default_confidences_differ_by_kind() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "alice",
            "OBSERVATION",
            None,
            json!({"subject": "s", "predicate": "p", "value": 1}),
        ));
        reducer.apply_event(&event(
            "evt_b",
            "bob",
            "ASSERTION",
            None,
            json!({"subject": "s", "predicate": "q", "value": 1}),
        ));

        assert_eq!(reducer.state.local["s:p"].confidence, 1.0);
        assert_eq!(reducer.state.local["s:q"].confidence, 0.35);
    }

    #[test]
    fn same_value_higher_confidence_promotes() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.4));
        reducer.apply_event(&observation("evt_b", "bob", None, "open", 0.8));

        let entry = &reducer.state.local["door:status"];
        assert_eq!(entry.confidence, 0.8);
        assert_eq!(entry.source_event_id, "evt_b");
        assert_eq!(entry.evidence.len(), 2);
    }

    #[test]
    fn same_value_lower_confidence_appends_evidence_only() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.8));
        reducer.apply_event(&observation("evt_b", "bob", None, "open", 0.4));

        let entry = &reducer.state.local["door:status"];
        assert_eq!(entry.confidence, 0.8);
        assert_eq!(entry.source_event_id, "evt_a");
        assert_eq!(entry.evidence.len(), 2);
    }

    #[test]
    fn conflicting_observations_become_contested() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.9));
        reducer.apply_event(&observation("evt_b", "bob", None, "closed", 0.8));

        assert!(!reducer.state.local.contains_key("door:status"));
        let contested = &reducer.state.contested["door:status"];
        assert!(contested.awaiting_resolution);
        assert_eq!(contested.evidence_groups.len(), 2);
    }

    #[test]
    fn weak_conflict_stays_local() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.3));
        reducer.apply_event(&observation("evt_b", "bob", None, "closed", 0.2));

        assert!(!reducer.state.contested.contains_key("door:status"));
        let entry = &reducer.state.local["door:status"];
        assert_eq!(entry.value, json!("closed"));
        assert_eq!(entry.evidence.len(), 2);
    }

    #[test]
    fn attestation_overrides_contested_and_local() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.9));
        reducer.apply_event(&observation("evt_b", "bob", None, "closed", 0.8));
        reducer.apply_event(&event(
            "evt_c",
            "authority",
            "ATTESTATION",
            None,
            json!({"subject": "door", "predicate": "status", "value": "open", "target_event_id": "evt_a"}),
        ));

        assert!(reducer.state.local.is_empty());
        assert!(reducer.state.contested.is_empty());
        let entry = &reducer.state.canonical["door:status"];
        assert_eq!(entry.value, json!("open"));
        assert_eq!(entry.evidence[0].event_id, "evt_a");
    }

    #[test]
    fn attestation_archives_prior_canonical() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "authority",
            "ATTESTATION",
            None,
            json!({"subject": "door", "predicate": "status", "value": "open"}),
        ));
        reducer.apply_event(&event(
            "evt_b",
            "authority",
            "ATTESTATION",
            Some("evt_a"),
            json!({"subject": "door", "predicate": "status", "value": "closed"}),
        ));

        assert_eq!(reducer.state.canonical["door:status"].value, json!("closed"));
        let archived = &reducer.state.archived["door:status"];
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].entry.value, json!("open"));
        assert!(!archived[0].retracted);
        assert_eq!(archived[0].superseded_by, "evt_b");
    }

    #[test]
    fn retraction_archives_canonical_with_flag() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "authority",
            "ATTESTATION",
            None,
            json!({"subject": "door", "predicate": "status", "value": "open"}),
        ));
        reducer.apply_event(&event(
            "evt_b",
            "authority",
            "RETRACTION",
            Some("evt_a"),
            json!({"subject": "door", "predicate": "status"}),
        ));

        assert!(reducer.state.canonical.is_empty());
        let archived = &reducer.state.archived["door:status"];
        assert_eq!(archived.len(), 1);
        assert!(archived[0].retracted);
        assert_eq!(archived[0].superseded_by, "evt_b");
    }

    #[test]
    fn canonical_wins_over_later_observations() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "authority",
            "ATTESTATION",
            None,
            json!({"subject": "door", "predicate": "status", "value": "open"}),
        ));
        reducer.apply_event(&observation("evt_b", "bob", None, "closed", 0.95));

        let entry = &reducer.state.canonical["door:status"];
        assert_eq!(entry.value, json!("open"));
        // Recorded as evidence only.
        assert_eq!(entry.evidence.len(), 2);
        assert!(!reducer.state.local.contains_key("door:status"));
    }

    #[test]
    fn unknown_types_are_counted_not_applied() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "alice",
            "com.example.note",
            None,
            json!({"text": "hi"}),
        ));
        reducer.apply_event(&event(
            "evt_b",
            "alice",
            "com.example.note",
            Some("evt_a"),
            json!({"text": "again"}),
        ));

        assert!(reducer.state.local.is_empty());
        assert_eq!(reducer.state.metadata.ignored_types["com.example.note"], 2);
        assert_eq!(reducer.state.metadata.event_count, 2);
    }

    #[test]
    fn reducer_epoch_updates_metadata() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&event(
            "evt_a",
            "alice",
            "REDUCER_EPOCH",
            None,
            json!({"epoch_id": "epoch-2"}),
        ));
        assert_eq!(reducer.state.metadata.current_epoch.as_deref(), Some("epoch-2"));
    }

    #[test]
    fn forked_branches_contest_their_evidence() {
        let mut reducer = SovereignReducerV0::new(None);
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.9));
        // Two children of evt_a by the same actor: a fork.
        reducer.apply_event(&observation("evt_b", "alice", Some("evt_a"), "open", 0.9));
        reducer.apply_event(&observation("evt_c", "alice", Some("evt_a"), "closed", 0.9));

        let contested = &reducer.state.contested["door:status"];
        assert!(contested.awaiting_resolution);
        assert!(contested.evidence_groups.len() >= 2);
        assert!(!reducer.state.local.contains_key("door:status"));
    }

    #[test]
    fn state_hash_changes_with_state() {
        let mut reducer = SovereignReducerV0::new(None);
        let empty = reducer.state.metadata.state_hash.clone();
        reducer.apply_event(&observation("evt_a", "alice", None, "open", 0.9));
        assert_ne!(reducer.state.metadata.state_hash, empty);
    }

    #[test]
    fn reduce_is_deterministic() {
        let events = vec![
            observation("evt_a", "alice", None, "open", 0.9),
            observation("evt_b", "bob", None, "closed", 0.8),
        ];
        let a = reduce(&events);
        let b = reduce(&events);
        assert_eq!(a.metadata.state_hash, b.metadata.state_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let events = vec![
            observation("evt_a", "alice", None, "open", 0.9),
            observation("evt_b", "bob", None, "closed", 0.8),
        ];
        let state = reduce(&events);
        let rendered = serde_json::to_string(&state).unwrap();
        let back: ReducerState = serde_json::from_str(&rendered).unwrap();
        assert_eq!(back, state);
    }
}
