//! Operation types for the replicated configuration store.
//!
//! Writes are expressed as [`Command`] values so that every mutation has a
//! single serializable form: the in-process engine applies them directly and
//! the replicated store ships the same values through the consensus log.

use serde::Deserialize;
use serde::Serialize;

/// A stored key-value pair with revision metadata.
///
/// `mod_revision` is the store-wide revision of the last write to this key
/// and is the compare target for optimistic concurrency. `version` counts
/// writes to this key and starts at 1 on creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
    /// Store revision when this key was first created; stable across writes.
    pub create_revision: u64,
    /// Store revision of the most recent write to this key.
    pub mod_revision: u64,
    /// Per-key write counter, 1 on creation.
    pub version: u64,
}

/// Key ordering for prefix reads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// A replicated write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    /// Delete every key under a prefix, reporting the previous values.
    DeletePrefix { prefix: String },
    /// Atomic multi-operation transaction with compare guards.
    Txn(Txn),
}

/// Compare/then/else transaction, the only conditional write form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Txn {
    /// All guards must hold for the `then_ops` branch to run.
    pub compares: Vec<Compare>,
    pub then_ops: Vec<Op>,
    pub else_ops: Vec<Op>,
}

/// A transaction guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Compare {
    /// The key's `mod_revision` equals the observed revision.
    ModRevisionEquals { key: String, revision: u64 },
    KeyExists { key: String },
    KeyMissing { key: String },
    ValueEquals { key: String, value: String },
}

/// An operation inside a transaction branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
    Get { key: String },
    Range { prefix: String },
}

/// Result of one transaction branch operation, index-aligned with the ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpResult {
    Put { revision: u64 },
    Deleted { entries: Vec<StoreEntry> },
    Kvs { entries: Vec<StoreEntry> },
}

/// Result of a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnOutcome {
    /// Whether every compare held and `then_ops` ran.
    pub succeeded: bool,
    /// Store revision after the transaction (unchanged if nothing mutated).
    pub revision: u64,
    pub results: Vec<OpResult>,
}

/// Result of applying any [`Command`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Store revision after the command.
    pub revision: u64,
    /// Whether a plain `Delete` removed a key.
    pub deleted: bool,
    /// Previous values removed by `DeletePrefix`.
    pub prev_entries: Vec<StoreEntry>,
    /// Present when the command was a transaction.
    pub txn: Option<TxnOutcome>,
}

/// How a watched key changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A change observed by a watch.
///
/// For `Deleted` events `entry` carries the last known value of the key and
/// `previous` is `None`; consumers treat the payload as the final state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Store revision of the change; monotonic within one subscription.
    pub revision: u64,
    pub entry: StoreEntry,
    pub previous: Option<StoreEntry>,
}
