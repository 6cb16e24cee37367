//! Replicated backing for the configuration store.
//!
//! Each gateway node embeds a Raft instance over the shared MVCC engine.
//! Writes are replicated as [`wag_store::Command`] log entries; reads and
//! watches are served from the local engine (serial at the leader, possibly
//! a little stale on followers, which the control plane tolerates outside
//! the auth hot path). Peers speak length-prefixed JSON over TCP using the
//! static peer list from the node configuration.

pub mod health;
pub mod network;
pub mod node;

mod log_store;
mod state_machine;

pub use health::ClusterHealth;
pub use health::ClusterStatus;
pub use health::HealthMonitor;
pub use node::NodeAddresses;
pub use node::RaftNode;
pub use node::RaftStore;

use std::io::Cursor;
use wag_store::Command;
use wag_store::CommandOutcome;

/// Raft node identifier; the rank of the node name in the sorted member
/// name list, starting at 1.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Consensus type configuration: store commands in, command outcomes out.
    pub TypeConfig:
        D = Command,
        R = CommandOutcome,
);
