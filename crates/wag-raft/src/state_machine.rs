//! Raft state machine over the MVCC engine.
//!
//! Committed log entries are store commands; applying one mutates the
//! shared engine, which in turn feeds every local watch subscription. The
//! engine's snapshot/restore pair backs consensus snapshots, and the
//! latest snapshot is persisted in the node's store directory so a
//! restarted node comes back with its data instead of an empty key space.

use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use openraft::storage::RaftStateMachine;
use openraft::storage::Snapshot;
use openraft::AnyError;
use openraft::BasicNode;
use openraft::Entry;
use openraft::EntryPayload;
use openraft::ErrorSubject;
use openraft::ErrorVerb;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::RaftSnapshotBuilder;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::StoredMembership;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use wag_store::CommandOutcome;
use wag_store::EngineSnapshot;
use wag_store::MvccEngine;

use crate::NodeId;
use crate::TypeConfig;

const SNAPSHOT_FILE: &str = "state.snap";

#[derive(Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

#[derive(Default)]
struct Applied {
    last_applied: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, BasicNode>,
    snapshot_idx: u64,
    current_snapshot: Option<StoredSnapshot>,
}

/// State machine applying committed commands to the engine.
pub struct StateMachine {
    engine: Arc<MvccEngine>,
    applied: Mutex<Applied>,
    snapshot_path: Option<PathBuf>,
}

impl StateMachine {
    /// Build the state machine, restoring the persisted snapshot from the
    /// store directory when one exists.
    pub fn new(engine: Arc<MvccEngine>, dir: Option<&Path>) -> Arc<Self> {
        let snapshot_path = dir.map(|dir| dir.join(SNAPSHOT_FILE));
        let mut applied = Applied::default();

        if let Some(stored) = snapshot_path.as_deref().and_then(read_snapshot_file) {
            match serde_json::from_slice::<EngineSnapshot>(&stored.data) {
                Ok(engine_snapshot) => {
                    info!(up_to = ?stored.meta.last_log_id, "restored store snapshot");
                    engine.restore(engine_snapshot);
                    applied.last_applied = stored.meta.last_log_id;
                    applied.membership = stored.meta.last_membership.clone();
                    applied.current_snapshot = Some(stored);
                }
                Err(err) => {
                    warn!(error = %err, "ignoring undecodable store snapshot");
                }
            }
        }

        Arc::new(Self {
            engine,
            applied: Mutex::new(applied),
            snapshot_path,
        })
    }

    /// Log position of the restored snapshot, if any. The log store uses
    /// it as its purge baseline.
    pub fn restored_log_id(&self) -> Option<LogId<NodeId>> {
        self.with(|applied| applied.current_snapshot.as_ref().and_then(|stored| stored.meta.last_log_id))
    }

    fn persist(&self, stored: &StoredSnapshot) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let result = serde_json::to_vec(stored)
            .map_err(std::io::Error::other)
            .and_then(|encoded| atomic_write(path, &encoded));
        if let Err(err) = result {
            // Replication still holds the data; only restart durability is
            // degraded until the next snapshot succeeds.
            warn!(path = %path.display(), error = %err, "unable to persist store snapshot");
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Applied) -> T) -> T {
        let mut applied = self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut applied)
    }
}

fn read_snapshot_file(path: &Path) -> Option<StoredSnapshot> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(stored) => Some(stored),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable snapshot file");
            None
        }
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("snap.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

fn snapshot_error(verb: ErrorVerb, err: &serde_json::Error) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Snapshot(None), verb, AnyError::new(err)).into()
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachine> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let engine_snapshot = self.engine.snapshot();
        let data = serde_json::to_vec(&engine_snapshot).map_err(|err| snapshot_error(ErrorVerb::Write, &err))?;

        let stored = self.with(|applied| {
            applied.snapshot_idx += 1;
            let snapshot_id = match applied.last_applied {
                Some(last) => format!("{}-{}-{}", last.leader_id, last.index, applied.snapshot_idx),
                None => format!("--{}", applied.snapshot_idx),
            };
            let stored = StoredSnapshot {
                meta: SnapshotMeta {
                    last_log_id: applied.last_applied,
                    last_membership: applied.membership.clone(),
                    snapshot_id,
                },
                data: data.clone(),
            };
            applied.current_snapshot = Some(stored.clone());
            stored
        });
        self.persist(&stored);

        Ok(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>> {
        Ok(self.with(|applied| (applied.last_applied, applied.membership.clone())))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut outcomes = Vec::new();
        for entry in entries {
            let outcome = match &entry.payload {
                EntryPayload::Blank => CommandOutcome::default(),
                EntryPayload::Normal(command) => self.engine.apply(command),
                EntryPayload::Membership(membership) => {
                    self.with(|applied| {
                        applied.membership = StoredMembership::new(Some(entry.log_id), membership.clone());
                    });
                    CommandOutcome::default()
                }
            };
            self.with(|applied| applied.last_applied = Some(entry.log_id));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let engine_snapshot: EngineSnapshot =
            serde_json::from_slice(&data).map_err(|err| snapshot_error(ErrorVerb::Read, &err))?;

        self.engine.restore(engine_snapshot);
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.with(|applied| {
            applied.last_applied = meta.last_log_id;
            applied.membership = meta.last_membership.clone();
            applied.current_snapshot = Some(stored.clone());
        });
        self.persist(&stored);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.with(|applied| {
            applied.current_snapshot.as_ref().map(|stored| Snapshot {
                meta: stored.meta.clone(),
                snapshot: Box::new(Cursor::new(stored.data.clone())),
            })
        }))
    }
}
