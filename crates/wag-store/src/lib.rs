//! Store interface for the wag configuration plane.
//!
//! Defines the [`Store`] trait every component programs against, the
//! in-process [`MemoryStore`] used for tests and as the node-local state
//! machine, and the [`safe_update`] optimistic read-modify-write primitive.
//! The replicated backing lives in `wag-raft`.

pub mod engine;

mod error;
mod memory;
mod safe_update;
mod types;

use async_trait::async_trait;

pub use engine::EngineSnapshot;
pub use engine::MvccEngine;
pub use engine::WatchStream;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use safe_update::safe_update;
pub use safe_update::Mutation;
pub use types::Command;
pub use types::CommandOutcome;
pub use types::Compare;
pub use types::EventKind;
pub use types::Op;
pub use types::OpResult;
pub use types::SortOrder;
pub use types::StoreEntry;
pub use types::Txn;
pub use types::TxnOutcome;
pub use types::WatchEvent;

/// Replicated, watched key-value store.
///
/// Writes are linearisable; reads may lag slightly on follower nodes.
/// Within a single watch, events arrive in monotonic revision order.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Read every key under a prefix.
    async fn list(&self, prefix: &str, order: SortOrder) -> Result<Vec<StoreEntry>, StoreError>;

    /// Write a key, returning the store revision of the write.
    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Delete a key; `false` if it was absent.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every key under a prefix, returning the previous values.
    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError>;

    /// Run an atomic compare/then/else transaction.
    async fn txn(&self, txn: Txn) -> Result<TxnOutcome, StoreError>;

    /// Subscribe to changes under a prefix.
    fn watch(&self, prefix: &str) -> WatchStream;
}

#[async_trait]
impl<T: Store + ?Sized> Store for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        (**self).get(key).await
    }

    async fn list(&self, prefix: &str, order: SortOrder) -> Result<Vec<StoreEntry>, StoreError> {
        (**self).list(prefix, order).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError> {
        (**self).delete_prefix(prefix).await
    }

    async fn txn(&self, txn: Txn) -> Result<TxnOutcome, StoreError> {
        (**self).txn(txn).await
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        (**self).watch(prefix)
    }
}
