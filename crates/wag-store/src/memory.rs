//! Deterministic in-process store.
//!
//! Wraps the MVCC engine without any replication. This backs unit and
//! integration tests across the workspace and doubles as the state-machine
//! half of the replicated store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::MvccEngine;
use crate::engine::WatchStream;
use crate::error::StoreError;
use crate::types::Command;
use crate::types::SortOrder;
use crate::types::StoreEntry;
use crate::types::Txn;
use crate::types::TxnOutcome;
use crate::Store;

/// Single-process [`Store`] over the MVCC engine.
#[derive(Default)]
pub struct MemoryStore {
    engine: Arc<MvccEngine>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(MvccEngine::new()),
        })
    }

    /// The underlying engine, shared with the consensus state machine.
    pub fn engine(&self) -> Arc<MvccEngine> {
        self.engine.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        Ok(self.engine.get(key))
    }

    async fn list(&self, prefix: &str, order: SortOrder) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self.engine.list(prefix, order))
    }

    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let outcome = self.engine.apply(&Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(outcome.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let outcome = self.engine.apply(&Command::Delete { key: key.to_string() });
        Ok(outcome.deleted)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let outcome = self.engine.apply(&Command::DeletePrefix {
            prefix: prefix.to_string(),
        });
        Ok(outcome.prev_entries)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnOutcome, StoreError> {
        let outcome = self.engine.apply(&Command::Txn(txn));
        Ok(outcome.txn.unwrap_or_default())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        self.engine.subscribe(prefix)
    }
}
