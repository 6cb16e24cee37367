//! Raft log storage.
//!
//! Log entries live in memory: the configuration plane is small and fully
//! reconstructable from a state-machine snapshot, so durability comes from
//! replication and the persisted snapshot rather than fsynced entries. The
//! vote is persisted in the node's store directory so an election term
//! never regresses across a restart.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use openraft::storage::LogFlushed;
use openraft::storage::LogState;
use openraft::storage::RaftLogStorage;
use openraft::AnyError;
use openraft::Entry;
use openraft::ErrorSubject;
use openraft::ErrorVerb;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::RaftLogReader;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::Vote;
use tracing::warn;

use crate::NodeId;
use crate::TypeConfig;

const VOTE_FILE: &str = "vote.json";

#[derive(Default)]
struct LogStoreInner {
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    vote: Option<Vote<NodeId>>,
}

/// Shared log store with an on-disk vote.
#[derive(Clone, Default)]
pub struct LogStore {
    inner: Arc<Mutex<LogStoreInner>>,
    vote_path: Option<PathBuf>,
}

impl LogStore {
    /// Create a log store, restoring the persisted vote when a store
    /// directory is given.
    pub fn new(dir: Option<&Path>) -> Self {
        let vote_path = dir.map(|dir| dir.join(VOTE_FILE));
        let vote = vote_path.as_deref().and_then(read_vote_file);
        Self {
            inner: Arc::new(Mutex::new(LogStoreInner {
                vote,
                ..LogStoreInner::default()
            })),
            vote_path,
        }
    }

    /// Record that everything up to `log_id` lives in a restored snapshot.
    ///
    /// Called once at startup after the state machine loaded its persisted
    /// snapshot; the log is volatile, so the snapshot is the baseline.
    pub fn set_purged_baseline(&self, log_id: LogId<NodeId>) {
        self.with(|inner| inner.last_purged = Some(log_id));
    }

    fn with<T>(&self, f: impl FnOnce(&mut LogStoreInner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }
}

fn read_vote_file(path: &Path) -> Option<Vote<NodeId>> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(vote) => Some(vote),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable vote file");
            None
        }
    }
}

fn vote_write_error(err: &dyn std::error::Error) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Vote, ErrorVerb::Write, AnyError::new(&std::io::Error::other(err.to_string())))
        .into()
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.with(|inner| inner.log.range(range).map(|(_, entry)| entry.clone()).collect()))
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        Ok(self.with(|inner| {
            let last = inner
                .log
                .iter()
                .next_back()
                .map(|(_, entry)| entry.log_id)
                .or(inner.last_purged);
            LogState {
                last_purged_log_id: inner.last_purged,
                last_log_id: last,
            }
        }))
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> Result<(), StorageError<NodeId>> {
        self.with(|inner| inner.committed = committed);
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.with(|inner| inner.committed))
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        if let Some(path) = &self.vote_path {
            let encoded = serde_json::to_vec(vote).map_err(|err| vote_write_error(&err))?;
            std::fs::write(path, encoded).map_err(|err| vote_write_error(&err))?;
        }
        self.with(|inner| inner.vote = Some(*vote));
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.with(|inner| inner.vote))
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        self.with(|inner| {
            for entry in entries {
                inner.log.insert(entry.log_id.index, entry);
            }
        });
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.with(|inner| {
            let keys: Vec<u64> = inner.log.range(log_id.index..).map(|(k, _)| *k).collect();
            for key in keys {
                inner.log.remove(&key);
            }
        });
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.with(|inner| {
            inner.last_purged = Some(log_id);
            let keys: Vec<u64> = inner.log.range(..=log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                inner.log.remove(&key);
            }
        });
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
