//! Relay status: mirror a lone destination's status onto the source object.
//!
//! The reducer is level-triggered. Given the wish, the destination set, what
//! the destination reports and what the source currently shows, [`decide`]
//! names the single write (or none) that brings the source in line.

#![forbid(unsafe_code)]

pub mod writer;

use std::collections::BTreeSet;

use relay_core::{Condition, ObjectId, RelayResult};
use serde_json::Value as Json;
use tracing::debug;

pub use writer::{KubeStatusWriter, MemoryStatusWriter, StatusWriter};

pub const READY_CONDITION: &str = "Ready";
pub const WRAPPED_CONDITION: &str = "Wrapped";

/// Condition types the engine sets on workload objects. They share
/// `status.conditions` with whatever is mirrored but are neither copied from a
/// destination nor removed when the mirror is cleared.
pub const OWNED_OBJECT_CONDITIONS: &[&str] = &[WRAPPED_CONDITION];

fn is_owned(condition: &Json) -> bool {
    condition
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| OWNED_OBJECT_CONDITIONS.contains(&t))
        .unwrap_or(false)
}

/// Split a status into its mirrorable part and the engine-owned conditions.
/// A status left empty after the split counts as absent.
pub fn split_owned(status: Option<&Json>) -> (Option<Json>, Vec<Json>) {
    let map = match status {
        Some(Json::Object(map)) => map,
        Some(Json::Null) | None => return (None, Vec::new()),
        Some(other) => return (Some(other.clone()), Vec::new()),
    };
    let mut rest = map.clone();
    let mut owned = Vec::new();
    match rest.remove("conditions") {
        Some(Json::Array(list)) => {
            let (mine, theirs): (Vec<Json>, Vec<Json>) = list.into_iter().partition(is_owned);
            owned = mine;
            if !theirs.is_empty() {
                rest.insert("conditions".into(), Json::Array(theirs));
            }
        }
        Some(other) => {
            rest.insert("conditions".into(), other);
        }
        None => {}
    }
    let mirrored = if rest.is_empty() { None } else { Some(Json::Object(rest)) };
    (mirrored, owned)
}

/// Lay owned conditions back over a mirrored status.
pub fn join_owned(mirrored: Option<&Json>, owned: &[Json]) -> Option<Json> {
    if owned.is_empty() {
        return mirrored.cloned();
    }
    let mut map = match mirrored {
        Some(Json::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    };
    let mut list: Vec<Json> = match map.remove("conditions") {
        Some(Json::Array(l)) => l.into_iter().filter(|c| !is_owned(c)).collect(),
        _ => Vec::new(),
    };
    list.extend(owned.iter().cloned());
    map.insert("conditions".into(), Json::Array(list));
    Some(Json::Object(map))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingletonState {
    /// No binding that includes the object asks for reported state.
    Disabled,
    Mirroring { cluster: String },
    /// Wanted, but the object has zero or several destinations.
    Suppressed,
}

pub fn reduce(want: bool, destinations: &BTreeSet<String>) -> SingletonState {
    if !want {
        return SingletonState::Disabled;
    }
    let mut it = destinations.iter();
    match (it.next(), it.next()) {
        (Some(only), None) => SingletonState::Mirroring { cluster: only.clone() },
        _ => SingletonState::Suppressed,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusAction {
    Write(Json),
    Clear,
    Keep,
}

/// `previously_mirrored` says the engine itself put the current status there.
pub fn decide(state: &SingletonState, reported: Option<&Json>, current: Option<&Json>, previously_mirrored: bool) -> StatusAction {
    match state {
        SingletonState::Mirroring { .. } => match reported {
            Some(r) if current == Some(r) => StatusAction::Keep,
            Some(r) => StatusAction::Write(r.clone()),
            // Destination has not reported yet; drop whatever an earlier destination left.
            None if current.is_some() && previously_mirrored => StatusAction::Clear,
            None => StatusAction::Keep,
        },
        SingletonState::Suppressed if current.is_some() => StatusAction::Clear,
        SingletonState::Disabled if current.is_some() && previously_mirrored => StatusAction::Clear,
        _ => StatusAction::Keep,
    }
}

/// Read, decide and write for one object. Returns the action taken.
/// Only the mirrorable part of the status takes part; owned conditions are
/// carried through every write.
pub async fn sync_singleton(
    writer: &dyn StatusWriter,
    id: &ObjectId,
    state: &SingletonState,
    reported: Option<&Json>,
    previously_mirrored: bool,
) -> RelayResult<StatusAction> {
    let current = writer.current_status(id).await?;
    let (mirrored, owned) = split_owned(current.as_ref());
    let reported = reported.and_then(|r| split_owned(Some(r)).0);
    let action = decide(state, reported.as_ref(), mirrored.as_ref(), previously_mirrored);
    match &action {
        StatusAction::Write(v) => {
            writer.write_status(id, join_owned(Some(v), &owned).as_ref()).await?;
            metrics::counter!("status_writes_total", 1u64, "op" => "write");
            debug!(object = %id, ?state, "status mirrored");
        }
        StatusAction::Clear => {
            writer.write_status(id, join_owned(None, &owned).as_ref()).await?;
            metrics::counter!("status_writes_total", 1u64, "op" => "clear");
            debug!(object = %id, ?state, "status cleared");
        }
        StatusAction::Keep => {}
    }
    Ok(action)
}

/// Merge patch turning `current` into `desired`: removed keys become `null`.
pub fn merge_patch(current: &Json, desired: &Json) -> Json {
    match (current, desired) {
        (Json::Object(cur), Json::Object(want)) => {
            let mut out = serde_json::Map::new();
            for (k, v) in want {
                match cur.get(k) {
                    Some(c) if c == v => {}
                    Some(c) => {
                        out.insert(k.clone(), merge_patch(c, v));
                    }
                    None => {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            for k in cur.keys() {
                if !want.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        _ => desired.clone(),
    }
}

/// Insert, replace or remove the condition of type `type_` in a raw condition list.
/// `lastTransitionTime` is kept when the status value does not change.
/// Returns whether the list changed.
pub fn upsert_condition(list: &mut Vec<Json>, type_: &str, condition: Option<&Condition>) -> RelayResult<bool> {
    let pos = list.iter().position(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_));
    match (pos, condition) {
        (None, None) => Ok(false),
        (Some(i), None) => {
            list.remove(i);
            Ok(true)
        }
        (None, Some(c)) => {
            list.push(serde_json::to_value(c)?);
            Ok(true)
        }
        (Some(i), Some(c)) => {
            let mut next = c.clone();
            let old: Option<Condition> = serde_json::from_value(list[i].clone()).ok();
            if let Some(old) = &old {
                if old.status == next.status {
                    next.last_transition_time = old.last_transition_time.clone();
                }
            }
            if old.as_ref() == Some(&next) {
                return Ok(false);
            }
            list[i] = serde_json::to_value(&next)?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dests(names: &[&str]) -> BTreeSet<String> { names.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn reduce_covers_each_state() {
        assert_eq!(reduce(false, &dests(&["c1"])), SingletonState::Disabled);
        assert_eq!(reduce(true, &dests(&["c1"])), SingletonState::Mirroring { cluster: "c1".into() });
        assert_eq!(reduce(true, &dests(&["c1", "c2"])), SingletonState::Suppressed);
        assert_eq!(reduce(true, &dests(&[])), SingletonState::Suppressed);
    }

    #[test]
    fn decide_is_level_triggered() {
        let m = SingletonState::Mirroring { cluster: "c1".into() };
        let s = json!({"readyReplicas": 1});
        assert_eq!(decide(&m, Some(&s), None, false), StatusAction::Write(s.clone()));
        assert_eq!(decide(&m, Some(&s), Some(&s), true), StatusAction::Keep);
        assert_eq!(decide(&m, None, Some(&s), true), StatusAction::Clear);
        assert_eq!(decide(&m, None, None, false), StatusAction::Keep);

        assert_eq!(decide(&SingletonState::Suppressed, Some(&s), Some(&s), true), StatusAction::Clear);
        assert_eq!(decide(&SingletonState::Suppressed, None, None, false), StatusAction::Keep);

        assert_eq!(decide(&SingletonState::Disabled, None, Some(&s), true), StatusAction::Clear);
        assert_eq!(decide(&SingletonState::Disabled, None, Some(&s), false), StatusAction::Keep);
    }

    #[test]
    fn owned_conditions_split_from_mirrored_status() {
        let status = json!({
            "readyReplicas": 1,
            "conditions": [
                {"type": "Available", "status": "True"},
                {"type": "Wrapped", "status": "False", "reason": "ObjectTooLarge"}
            ]
        });
        let (mirrored, owned) = split_owned(Some(&status));
        assert_eq!(mirrored, Some(json!({"readyReplicas": 1, "conditions": [{"type": "Available", "status": "True"}]})));
        assert_eq!(owned.len(), 1);
        assert_eq!(join_owned(mirrored.as_ref(), &owned), Some(status));

        let only_owned = json!({"conditions": [{"type": "Wrapped", "status": "False"}]});
        let (mirrored, owned) = split_owned(Some(&only_owned));
        assert!(mirrored.is_none());
        assert_eq!(join_owned(None, &owned), Some(only_owned));
        assert_eq!(join_owned(None, &[]), None);
        assert_eq!(split_owned(Some(&json!(null))), (None, Vec::new()));
    }

    #[tokio::test]
    async fn clearing_a_suppressed_status_keeps_owned_conditions() {
        let w = MemoryStatusWriter::new();
        let id = ObjectId::new("apps", "Deployment", "ns", "big");
        w.seed_status(&id, json!({"readyReplicas": 3}));
        let c = Condition::failing(WRAPPED_CONDITION, "ObjectTooLarge", "too big");
        w.set_condition(&relay_core::ConditionTarget::Object(id.clone()), WRAPPED_CONDITION, Some(&c)).await.unwrap();

        let action = sync_singleton(&w, &id, &SingletonState::Suppressed, None, true).await.unwrap();
        assert_eq!(action, StatusAction::Clear);
        let left = w.status_of(&id).unwrap();
        assert!(left.get("readyReplicas").is_none());
        assert_eq!(left["conditions"][0]["type"], "Wrapped");

        // Nothing mirrorable is left, so a second pass is a no-op.
        let action = sync_singleton(&w, &id, &SingletonState::Suppressed, None, false).await.unwrap();
        assert_eq!(action, StatusAction::Keep);
    }

    #[tokio::test]
    async fn mirroring_keeps_owned_conditions_and_ignores_reported_ones() {
        let w = MemoryStatusWriter::new();
        let id = ObjectId::new("apps", "Deployment", "ns", "big");
        let target = relay_core::ConditionTarget::Object(id.clone());
        let c = Condition::failing(WRAPPED_CONDITION, "ObjectTooLarge", "too big");
        w.set_condition(&target, WRAPPED_CONDITION, Some(&c)).await.unwrap();

        let m = SingletonState::Mirroring { cluster: "c1".into() };
        let reported = json!({"readyReplicas": 1, "conditions": [{"type": "Wrapped", "status": "True"}]});
        let action = sync_singleton(&w, &id, &m, Some(&reported), false).await.unwrap();
        assert_eq!(action, StatusAction::Write(json!({"readyReplicas": 1})));
        assert_eq!(w.status_of(&id).unwrap()["readyReplicas"], 1);
        let conds = w.conditions_of(&target);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0]["reason"], "ObjectTooLarge");

        let action = sync_singleton(&w, &id, &m, Some(&reported), true).await.unwrap();
        assert_eq!(action, StatusAction::Keep);
    }

    #[test]
    fn merge_patch_nulls_removed_keys() {
        let cur = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": [1]});
        let want = json!({"a": 1, "b": {"x": 2}, "d": true});
        assert_eq!(merge_patch(&cur, &want), json!({"b": {"x": 2, "y": null}, "c": null, "d": true}));
        assert_eq!(merge_patch(&json!(null), &want), want);
    }

    #[test]
    fn conditions_upsert_keeps_transition_time() {
        let mut list = vec![json!({"type": "Other", "status": "True"})];
        let mut c = Condition::failing("Ready", "InvalidSelector", "bad key");
        c.last_transition_time = "2024-01-01T00:00:00Z".into();
        assert!(upsert_condition(&mut list, "Ready", Some(&c)).unwrap());
        assert_eq!(list.len(), 2);

        let mut again = Condition::failing("Ready", "InvalidSelector", "bad key");
        again.last_transition_time = "2025-01-01T00:00:00Z".into();
        assert!(!upsert_condition(&mut list, "Ready", Some(&again)).unwrap());
        assert_eq!(list[1]["lastTransitionTime"], "2024-01-01T00:00:00Z");

        assert!(upsert_condition(&mut list, "Ready", None).unwrap());
        assert!(!upsert_condition(&mut list, "Ready", None).unwrap());
        assert_eq!(list, vec![json!({"type": "Other", "status": "True"})]);
    }
}
