//! Conflict resolution strategies
//!
//! When a locally cached record and the server's version of the same record
//! have diverged, a [`ConflictStrategy`] decides the surviving value. The
//! default (`Prompt`) persists the divergence for a human to resolve and
//! keeps the local value authoritative in the meantime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::store::{now_ms, LocalStore};

/// Field consulted when merging divergent values.
const LAST_MODIFIED: &str = "lastModified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local version unchanged
    Local,
    /// Adopt the remote version unchanged
    Remote,
    /// Field-by-field deep merge (see [`deep_merge`])
    Merge,
    /// Persist the divergence for manual resolution; local stays
    /// authoritative until then
    #[default]
    Prompt,
}

/// One detected divergence, persisted until a human resolves it.
///
/// At most one open conflict exists per key; a newer conflict for the same
/// key overwrites the pending one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Composite `module:key`, matches the cached record
    pub key: String,
    pub module: String,
    pub record_key: String,
    pub local_data: Value,
    pub remote_data: Value,
    pub last_local_update: u64,
    pub last_remote_update: u64,
    pub detected_at: u64,
}

#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
    events: EventBus,
}

impl ConflictResolver {
    pub fn new(store: LocalStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Decide the surviving value for a diverged record.
    ///
    /// `Local`, `Remote` and `Merge` return immediately; `Prompt` persists a
    /// [`Conflict`] (overwriting any pending one for the key), publishes
    /// `ConflictDetected` and returns the local value as the interim answer.
    pub fn handle_sync_conflict(
        &self,
        module: &str,
        key: &str,
        local: &Value,
        remote: &Value,
        strategy: ConflictStrategy,
    ) -> SyncResult<Value> {
        match strategy {
            ConflictStrategy::Local => Ok(local.clone()),
            ConflictStrategy::Remote => Ok(remote.clone()),
            ConflictStrategy::Merge => Ok(deep_merge(local, remote)),
            ConflictStrategy::Prompt => {
                let conflict = Conflict {
                    key: LocalStore::composite_key(module, key),
                    module: module.to_string(),
                    record_key: key.to_string(),
                    local_data: local.clone(),
                    remote_data: remote.clone(),
                    last_local_update: last_modified(local).unwrap_or(0),
                    last_remote_update: last_modified(remote).unwrap_or(0),
                    detected_at: now_ms(),
                };
                self.store.put_conflict(&conflict)?;
                tracing::info!("conflict detected for '{}', awaiting resolution", conflict.key);
                self.events
                    .publish(SyncEvent::ConflictDetected { conflict });
                Ok(local.clone())
            }
        }
    }

    /// Apply a human decision: delete the conflict and write the resolved
    /// value back into the local store, atomically.
    pub fn resolve_conflict(&self, composite_key: &str, resolved: &Value) -> SyncResult<()> {
        self.store.resolve_conflict_record(composite_key, resolved)?;
        tracing::info!("conflict '{}' resolved", composite_key);
        self.events.publish(SyncEvent::ConflictResolved {
            key: composite_key.to_string(),
            resolved: resolved.clone(),
        });
        Ok(())
    }

    /// All unresolved conflicts, for UI surfacing.
    pub fn pending_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.store.list_conflicts()
    }
}

fn last_modified(value: &Value) -> Option<u64> {
    value.get(LAST_MODIFIED).and_then(Value::as_u64)
}

/// Recursive field-by-field merge of two divergent values.
///
/// Rules, applied per recursion level:
/// - either side not an object: the side with the larger `lastModified`
///   wins, ties going to remote;
/// - a remote field with a non-null value that is absent locally is adopted;
/// - two arrays are unioned, local elements first, duplicates removed;
/// - two objects recurse;
/// - any other disagreement goes to the side with the larger `lastModified`;
/// - the result's `lastModified` is the maximum of the two inputs'.
pub fn deep_merge(local: &Value, remote: &Value) -> Value {
    let local_ts = last_modified(local);
    let remote_ts = last_modified(remote);
    let remote_wins = remote_ts.unwrap_or(0) >= local_ts.unwrap_or(0);

    let (local_map, remote_map) = match (local, remote) {
        (Value::Object(l), Value::Object(r)) => (l, r),
        _ => {
            return if remote_wins {
                remote.clone()
            } else {
                local.clone()
            }
        }
    };

    let mut merged = local_map.clone();
    for (field, remote_value) in remote_map {
        if remote_value.is_null() {
            continue;
        }
        match local_map.get(field) {
            None => {
                merged.insert(field.clone(), remote_value.clone());
            }
            Some(local_value) => match (local_value, remote_value) {
                (Value::Array(local_items), Value::Array(remote_items)) => {
                    let mut union = local_items.clone();
                    for item in remote_items {
                        if !union.contains(item) {
                            union.push(item.clone());
                        }
                    }
                    merged.insert(field.clone(), Value::Array(union));
                }
                (Value::Object(_), Value::Object(_)) => {
                    merged.insert(field.clone(), deep_merge(local_value, remote_value));
                }
                _ => {
                    if remote_wins {
                        merged.insert(field.clone(), remote_value.clone());
                    }
                }
            },
        }
    }

    if let Some(max_ts) = match (local_ts, remote_ts) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (ts, None) | (None, ts) => ts,
    } {
        merged.insert(LAST_MODIFIED.to_string(), Value::from(max_ts));
    }

    Value::Object(merged)
}
