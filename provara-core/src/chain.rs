//! Per-actor causal chains: `prev_event_hash` linkage and fork detection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProvaraError, ValidationError};
use crate::event::Event;

/// Per-actor summary of a verified chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorChain {
    pub event_count: u64,
    pub first_event_id: String,
    pub head_event_id: String,
}

/// Two events by the same actor sharing one `prev_event_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub actor: String,
    /// Shared parent; `None` when two first events collide.
    pub prev_event_hash: Option<String>,
    pub event_ids: Vec<String>,
}

/// Verify causal chain integrity across a log, in log order.
///
/// Checks, per event:
/// - first event by an actor carries a null `prev_event_hash` (E004);
/// - a non-null `prev_event_hash` names a known event (E005) by the same
///   actor (E006) that is the actor's immediately preceding event (E007).
pub fn verify_causal_chain(events: &[Event]) -> Result<BTreeMap<String, ActorChain>, ProvaraError> {
    let mut chains: BTreeMap<String, ActorChain> = BTreeMap::new();
    let mut actor_of: BTreeMap<&str, &str> = BTreeMap::new();

    for event in events {
        let actor = event.actor.as_str();
        match &event.prev_event_hash {
            None => {
                if chains.contains_key(actor) {
                    return Err(ValidationError::new(
                        ErrorCode::FirstEventPrevNotNull,
                        format!("actor {actor} has a second event with null prev_event_hash"),
                    )
                    .with_event(event.event_id.clone())
                    .into());
                }
            }
            Some(prev) => {
                let prev_actor = actor_of.get(prev.as_str()).copied().ok_or_else(|| {
                    ValidationError::new(
                        ErrorCode::OrphanChainReference,
                        format!("prev_event_hash {prev} does not exist in the log"),
                    )
                    .with_event(event.event_id.clone())
                })?;
                if prev_actor != actor {
                    return Err(ValidationError::new(
                        ErrorCode::CrossActorChainReference,
                        format!("prev_event_hash {prev} belongs to actor {prev_actor}, not {actor}"),
                    )
                    .with_event(event.event_id.clone())
                    .into());
                }
                let head = chains
                    .get(actor)
                    .map(|c| c.head_event_id.as_str())
                    .unwrap_or_default();
                if head != prev {
                    return Err(ValidationError::new(
                        ErrorCode::BrokenCausalChain,
                        format!("expected prev {head}, got {prev}"),
                    )
                    .with_event(event.event_id.clone())
                    .into());
                }
            }
        }

        actor_of.insert(&event.event_id, actor);
        chains
            .entry(actor.to_string())
            .and_modify(|c| {
                c.event_count += 1;
                c.head_event_id = event.event_id.clone();
            })
            .or_insert_with(|| ActorChain {
                event_count: 1,
                first_event_id: event.event_id.clone(),
                head_event_id: event.event_id.clone(),
            });
    }

    Ok(chains)
}

/// Find forks without rejecting the log. Merged logs keep forked branches;
/// the reducer contests their downstream evidence.
pub fn detect_forks(events: &[Event]) -> Vec<Fork> {
    let mut by_parent: BTreeMap<(String, Option<String>), Vec<String>> = BTreeMap::new();
    for event in events {
        by_parent
            .entry((event.actor.clone(), event.prev_event_hash.clone()))
            .or_default()
            .push(event.event_id.clone());
    }

    by_parent
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|((actor, prev), event_ids)| Fork {
            actor,
            prev_event_hash: prev,
            event_ids,
        })
        .collect()
}

/// Event ids on any forked branch: the fork heads plus every descendant.
pub fn forked_event_ids(events: &[Event]) -> BTreeSet<String> {
    let mut forked: BTreeSet<String> = detect_forks(events)
        .into_iter()
        .flat_map(|f| f.event_ids)
        .collect();

    // Descendants inherit the taint; the log is in append order, so one
    // forward pass suffices.
    for event in events {
        if let Some(prev) = &event.prev_event_hash {
            if forked.contains(prev) {
                forked.insert(event.event_id.clone());
            }
        }
    }
    forked
}

/// Current head event id per actor, in log order.
pub fn actor_heads(events: &[Event]) -> BTreeMap<String, String> {
    let mut heads = BTreeMap::new();
    for event in events {
        heads.insert(event.actor.clone(), event.event_id.clone());
    }
    heads
}

/// Head of the whole log: the id of its last event.
pub fn log_head(events: &[Event]) -> Option<&str> {
    events.last().map(|e| e.event_id.as_str())
}
