//! In-process MVCC engine.
//!
//! The engine is the node-local state machine: a revisioned key space with
//! watch fan-out. The in-memory store wraps it directly; the replicated
//! store applies committed log commands to it. Watch events are emitted
//! under the write lock, so a single subscription always observes changes
//! in revision order.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Command;
use crate::types::CommandOutcome;
use crate::types::Compare;
use crate::types::EventKind;
use crate::types::Op;
use crate::types::OpResult;
use crate::types::SortOrder;
use crate::types::StoreEntry;
use crate::types::Txn;
use crate::types::TxnOutcome;
use crate::types::WatchEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionedValue {
    value: String,
    create_revision: u64,
    mod_revision: u64,
    version: u64,
}

impl VersionedValue {
    fn entry(&self, key: &str) -> StoreEntry {
        StoreEntry {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
        }
    }
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct EngineState {
    data: BTreeMap<String, VersionedValue>,
    revision: u64,
    watchers: Vec<Watcher>,
}

/// Serialized engine contents, used for consensus snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    revision: u64,
    data: BTreeMap<String, VersionedValue>,
}

/// Ordered stream of changes under one watched prefix.
pub struct WatchStream {
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// Next event, or `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}

/// Revisioned key space with watch fan-out.
pub struct MvccEngine {
    state: RwLock<EngineState>,
}

impl Default for MvccEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccEngine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Current store-wide revision.
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    pub fn get(&self, key: &str) -> Option<StoreEntry> {
        self.read().data.get(key).map(|v| v.entry(key))
    }

    pub fn list(&self, prefix: &str, order: SortOrder) -> Vec<StoreEntry> {
        let state = self.read();
        let mut entries: Vec<StoreEntry> = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| v.entry(k))
            .collect();
        if matches!(order, SortOrder::Descending) {
            entries.reverse();
        }
        entries
    }

    /// Register a watch over a key prefix.
    pub fn subscribe(&self, prefix: &str) -> WatchStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.write().watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });
        WatchStream { receiver }
    }

    /// Apply a write command, emitting watch events for every change.
    pub fn apply(&self, command: &Command) -> CommandOutcome {
        let mut state = self.write();
        match command {
            Command::Put { key, value } => {
                state.revision += 1;
                let revision = state.revision;
                state.put(key, value, revision);
                CommandOutcome {
                    revision,
                    ..CommandOutcome::default()
                }
            }
            Command::Delete { key } => {
                if state.data.contains_key(key) {
                    state.revision += 1;
                    let revision = state.revision;
                    state.remove(key, revision);
                    CommandOutcome {
                        revision,
                        deleted: true,
                        ..CommandOutcome::default()
                    }
                } else {
                    CommandOutcome {
                        revision: state.revision,
                        deleted: false,
                        ..CommandOutcome::default()
                    }
                }
            }
            Command::DeletePrefix { prefix } => {
                let keys = state.keys_with_prefix(prefix);
                if keys.is_empty() {
                    return CommandOutcome {
                        revision: state.revision,
                        ..CommandOutcome::default()
                    };
                }
                state.revision += 1;
                let revision = state.revision;
                let mut prev_entries = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(entry) = state.remove(&key, revision) {
                        prev_entries.push(entry);
                    }
                }
                CommandOutcome {
                    revision,
                    prev_entries,
                    ..CommandOutcome::default()
                }
            }
            Command::Txn(txn) => {
                let outcome = state.apply_txn(txn);
                CommandOutcome {
                    revision: outcome.revision,
                    txn: Some(outcome),
                    ..CommandOutcome::default()
                }
            }
        }
    }

    /// Export the full key space for a consensus snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.read();
        EngineSnapshot {
            revision: state.revision,
            data: state.data.clone(),
        }
    }

    /// Replace the key space from a snapshot.
    ///
    /// No watch events are emitted; after a snapshot install the consumers
    /// re-subscribe with an initial replay instead.
    pub fn restore(&self, snapshot: EngineSnapshot) {
        let mut state = self.write();
        state.revision = snapshot.revision;
        state.data = snapshot.data;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EngineState {
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn put(&mut self, key: &str, value: &str, revision: u64) {
        let (versioned, previous) = match self.data.get(key) {
            Some(existing) => (
                VersionedValue {
                    value: value.to_string(),
                    create_revision: existing.create_revision,
                    mod_revision: revision,
                    version: existing.version + 1,
                },
                Some(existing.entry(key)),
            ),
            None => (
                VersionedValue {
                    value: value.to_string(),
                    create_revision: revision,
                    mod_revision: revision,
                    version: 1,
                },
                None,
            ),
        };

        let entry = versioned.entry(key);
        self.data.insert(key.to_string(), versioned);

        let kind = if previous.is_some() { EventKind::Modified } else { EventKind::Created };
        self.emit(WatchEvent {
            kind,
            key: key.to_string(),
            revision,
            entry,
            previous,
        });
    }

    fn remove(&mut self, key: &str, revision: u64) -> Option<StoreEntry> {
        let removed = self.data.remove(key)?;
        let entry = removed.entry(key);
        self.emit(WatchEvent {
            kind: EventKind::Deleted,
            key: key.to_string(),
            revision,
            entry: entry.clone(),
            previous: None,
        });
        Some(entry)
    }

    fn compare_holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::ModRevisionEquals { key, revision } => {
                self.data.get(key).map(|v| v.mod_revision) == Some(*revision)
            }
            Compare::KeyExists { key } => self.data.contains_key(key),
            Compare::KeyMissing { key } => !self.data.contains_key(key),
            Compare::ValueEquals { key, value } => self.data.get(key).map(|v| v.value.as_str()) == Some(value.as_str()),
        }
    }

    fn apply_txn(&mut self, txn: &Txn) -> TxnOutcome {
        let succeeded = txn.compares.iter().all(|c| self.compare_holds(c));
        let ops = if succeeded { &txn.then_ops } else { &txn.else_ops };

        // The whole branch commits under a single revision, bumped only when
        // at least one operation will actually change state.
        let mutates = ops.iter().any(|op| match op {
            Op::Put { .. } => true,
            Op::Delete { key } => self.data.contains_key(key),
            Op::DeletePrefix { prefix } => !self.keys_with_prefix(prefix).is_empty(),
            Op::Get { .. } | Op::Range { .. } => false,
        });
        if mutates {
            self.revision += 1;
        }
        let revision = self.revision;

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                Op::Put { key, value } => {
                    self.put(key, value, revision);
                    OpResult::Put { revision }
                }
                Op::Delete { key } => OpResult::Deleted {
                    entries: self.remove(key, revision).into_iter().collect(),
                },
                Op::DeletePrefix { prefix } => {
                    let mut entries = Vec::new();
                    for key in self.keys_with_prefix(prefix) {
                        entries.extend(self.remove(&key, revision));
                    }
                    OpResult::Deleted { entries }
                }
                Op::Get { key } => OpResult::Kvs {
                    entries: self.data.get(key).map(|v| v.entry(key)).into_iter().collect(),
                },
                Op::Range { prefix } => OpResult::Kvs {
                    entries: self
                        .data
                        .range(prefix.to_string()..)
                        .take_while(|(k, _)| k.starts_with(prefix))
                        .map(|(k, v)| v.entry(k))
                        .collect(),
                },
            };
            results.push(result);
        }

        TxnOutcome {
            succeeded,
            revision,
            results,
        }
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|watcher| !event.key.starts_with(&watcher.prefix) || watcher.sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_tracks_revisions_and_versions() {
        let engine = MvccEngine::new();
        engine.apply(&Command::Put {
            key: "users-alice".into(),
            value: "a".into(),
        });
        engine.apply(&Command::Put {
            key: "users-alice".into(),
            value: "b".into(),
        });

        let entry = engine.get("users-alice").unwrap();
        assert_eq!(entry.value, "b");
        assert_eq!(entry.create_revision, 1);
        assert_eq!(entry.mod_revision, 2);
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn delete_of_missing_key_does_not_bump_revision() {
        let engine = MvccEngine::new();
        let outcome = engine.apply(&Command::Delete { key: "ghost".into() });
        assert!(!outcome.deleted);
        assert_eq!(engine.revision(), 0);
    }

    #[test]
    fn list_respects_prefix_and_order() {
        let engine = MvccEngine::new();
        for key in ["devices-alice-10.0.0.1", "devices-alice-10.0.0.2", "devices-bob-10.0.0.3"] {
            engine.apply(&Command::Put {
                key: key.into(),
                value: "{}".into(),
            });
        }

        let ascending = engine.list("devices-alice-", SortOrder::Ascending);
        assert_eq!(ascending.len(), 2);
        assert_eq!(ascending[0].key, "devices-alice-10.0.0.1");

        let descending = engine.list("devices-alice-", SortOrder::Descending);
        assert_eq!(descending[0].key, "devices-alice-10.0.0.2");
    }

    #[test]
    fn delete_prefix_reports_previous_values() {
        let engine = MvccEngine::new();
        engine.apply(&Command::Put {
            key: "tokens-a".into(),
            value: "1".into(),
        });
        engine.apply(&Command::Put {
            key: "tokens-b".into(),
            value: "2".into(),
        });

        let outcome = engine.apply(&Command::DeletePrefix { prefix: "tokens-".into() });
        assert_eq!(outcome.prev_entries.len(), 2);
        assert!(engine.list("tokens-", SortOrder::Ascending).is_empty());
    }

    #[test]
    fn txn_compare_picks_branch() {
        let engine = MvccEngine::new();
        engine.apply(&Command::Put {
            key: "k".into(),
            value: "v".into(),
        });
        let observed = engine.get("k").unwrap().mod_revision;

        // Stale revision: the else branch runs and returns the current kv.
        let outcome = engine.apply(&Command::Txn(Txn {
            compares: vec![Compare::ModRevisionEquals {
                key: "k".into(),
                revision: observed + 7,
            }],
            then_ops: vec![Op::Put {
                key: "k".into(),
                value: "clobbered".into(),
            }],
            else_ops: vec![Op::Get { key: "k".into() }],
        }));
        let txn = outcome.txn.unwrap();
        assert!(!txn.succeeded);
        assert_eq!(engine.get("k").unwrap().value, "v");

        // Matching revision: the then branch commits.
        let outcome = engine.apply(&Command::Txn(Txn {
            compares: vec![Compare::ModRevisionEquals {
                key: "k".into(),
                revision: observed,
            }],
            then_ops: vec![Op::Put {
                key: "k".into(),
                value: "v2".into(),
            }],
            else_ops: vec![],
        }));
        assert!(outcome.txn.unwrap().succeeded);
        assert_eq!(engine.get("k").unwrap().value, "v2");
    }

    #[test]
    fn txn_key_missing_guard() {
        let engine = MvccEngine::new();
        let outcome = engine.apply(&Command::Txn(Txn {
            compares: vec![Compare::KeyMissing { key: "seed".into() }],
            then_ops: vec![Op::Put {
                key: "seed".into(),
                value: "1".into(),
            }],
            else_ops: vec![],
        }));
        assert!(outcome.txn.unwrap().succeeded);

        // Second attempt is a no-op.
        let outcome = engine.apply(&Command::Txn(Txn {
            compares: vec![Compare::KeyMissing { key: "seed".into() }],
            then_ops: vec![Op::Put {
                key: "seed".into(),
                value: "2".into(),
            }],
            else_ops: vec![],
        }));
        assert!(!outcome.txn.unwrap().succeeded);
        assert_eq!(engine.get("seed").unwrap().value, "1");
    }

    #[tokio::test]
    async fn watch_sees_changes_in_revision_order() {
        let engine = MvccEngine::new();
        let mut stream = engine.subscribe("devices-");

        engine.apply(&Command::Put {
            key: "devices-alice-10.0.0.1".into(),
            value: "a".into(),
        });
        engine.apply(&Command::Put {
            key: "users-alice".into(),
            value: "ignored".into(),
        });
        engine.apply(&Command::Put {
            key: "devices-alice-10.0.0.1".into(),
            value: "b".into(),
        });
        engine.apply(&Command::Delete {
            key: "devices-alice-10.0.0.1".into(),
        });

        let created = stream.next().await.unwrap();
        assert_eq!(created.kind, EventKind::Created);
        let modified = stream.next().await.unwrap();
        assert_eq!(modified.kind, EventKind::Modified);
        assert_eq!(modified.previous.as_ref().unwrap().value, "a");
        let deleted = stream.next().await.unwrap();
        assert_eq!(deleted.kind, EventKind::Deleted);
        // Deleted events carry the last known value.
        assert_eq!(deleted.entry.value, "b");
        assert!(deleted.previous.is_none());

        assert!(created.revision < modified.revision);
        assert!(modified.revision < deleted.revision);
    }

    #[test]
    fn snapshot_restore_preserves_revisions() {
        let engine = MvccEngine::new();
        engine.apply(&Command::Put {
            key: "a".into(),
            value: "1".into(),
        });
        engine.apply(&Command::Put {
            key: "b".into(),
            value: "2".into(),
        });

        let other = MvccEngine::new();
        other.restore(engine.snapshot());
        assert_eq!(other.revision(), engine.revision());
        assert_eq!(other.get("a").unwrap().mod_revision, 1);
    }
}
