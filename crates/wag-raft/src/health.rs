//! Cluster health monitoring.
//!
//! Derives a coarse health state from the Raft metrics stream and notifies
//! listeners on transitions only. The reconciler couples the dataplane
//! lifecycle to these transitions: teardown on `Dead`, rebuild on return to
//! `Healthy`.

use std::sync::Arc;
use std::sync::Mutex;

use openraft::metrics::RaftMetrics;
use openraft::BasicNode;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::NodeId;

/// Coarse cluster state as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    /// Quorum holds and this node is an active member.
    Healthy,
    /// Quorum holds but replication to some voter is behind.
    Degraded,
    /// Quorum lost, or this node is not a member.
    Dead,
}

/// Snapshot of the facts health is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    pub leader: Option<NodeId>,
    pub voters: Vec<NodeId>,
    /// Voters the leader has no acknowledged replication for. Only the
    /// leader can observe this; elsewhere it is empty.
    pub unacked_voters: usize,
}

impl ClusterStatus {
    /// Health of `self_id` given this status.
    pub fn health_of(&self, self_id: NodeId) -> ClusterHealth {
        if self.leader.is_none() || !self.voters.contains(&self_id) {
            return ClusterHealth::Dead;
        }
        if self.unacked_voters > 0 {
            return ClusterHealth::Degraded;
        }
        ClusterHealth::Healthy
    }
}

fn status_from_metrics(metrics: &RaftMetrics<NodeId, BasicNode>) -> ClusterStatus {
    let voters: Vec<NodeId> = metrics.membership_config.membership().voter_ids().collect();
    let unacked_voters = metrics
        .replication
        .as_ref()
        .map(|replication| {
            voters
                .iter()
                .filter(|id| replication.get(id).map(|acked| acked.is_none()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0);

    ClusterStatus {
        leader: metrics.current_leader,
        voters,
        unacked_voters,
    }
}

/// Republish Raft metrics as [`ClusterStatus`] values.
pub(crate) fn publish_status(
    mut metrics: watch::Receiver<RaftMetrics<NodeId, BasicNode>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> watch::Receiver<ClusterStatus> {
    let initial = status_from_metrics(&metrics.borrow());
    let (tx, rx) = watch::channel(initial);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = metrics.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let status = status_from_metrics(&metrics.borrow());
                    if tx.send(status).is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

type HealthListener = Box<dyn Fn(ClusterHealth) + Send + Sync>;

/// Watches the status channel and fires listeners on health transitions.
pub struct HealthMonitor {
    self_id: NodeId,
    status_rx: watch::Receiver<ClusterStatus>,
    listeners: Mutex<Vec<HealthListener>>,
    current: Mutex<ClusterHealth>,
}

impl HealthMonitor {
    pub fn new(self_id: NodeId, status_rx: watch::Receiver<ClusterStatus>) -> Arc<Self> {
        let current = status_rx.borrow().health_of(self_id);
        Arc::new(Self {
            self_id,
            status_rx,
            listeners: Mutex::new(Vec::new()),
            current: Mutex::new(current),
        })
    }

    /// Register a transition callback. Fires on change only, never on
    /// steady state.
    pub fn register_listener(&self, listener: impl Fn(ClusterHealth) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(listener));
    }

    pub fn current(&self) -> ClusterHealth {
        *self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume status updates until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut status_rx = self.status_rx.clone();
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let health = status_rx.borrow().health_of(self.self_id);
                    self.transition(health);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn transition(&self, health: ClusterHealth) {
        {
            let mut current = self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == health {
                return;
            }
            match health {
                ClusterHealth::Dead => warn!(from = ?*current, "cluster health is dead"),
                _ => info!(from = ?*current, to = ?health, "cluster health changed"),
            }
            *current = health;
        }
        let listeners = self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener(health);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn status(leader: Option<NodeId>, voters: &[NodeId], unacked: usize) -> ClusterStatus {
        ClusterStatus {
            leader,
            voters: voters.to_vec(),
            unacked_voters: unacked,
        }
    }

    #[test]
    fn health_derivation() {
        assert_eq!(status(Some(1), &[1, 2, 3], 0).health_of(2), ClusterHealth::Healthy);
        assert_eq!(status(Some(1), &[1, 2, 3], 1).health_of(1), ClusterHealth::Degraded);
        assert_eq!(status(None, &[1, 2, 3], 0).health_of(1), ClusterHealth::Dead);
        // Not a member: dead even with a leader present.
        assert_eq!(status(Some(1), &[1, 3], 0).health_of(2), ClusterHealth::Dead);
    }

    #[tokio::test]
    async fn listeners_fire_on_transitions_only() {
        let (status_tx, status_rx) = watch::channel(status(Some(1), &[1, 2], 0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(2, status_rx);
        let transitions = Arc::new(AtomicUsize::new(0));
        {
            let transitions = transitions.clone();
            monitor.register_listener(move |_| {
                transitions.fetch_add(1, Ordering::SeqCst);
            });
        }

        let task = tokio::spawn(monitor.clone().run(shutdown_rx));

        // Steady state: same health twice, no callback.
        status_tx.send(status(Some(1), &[1, 2], 0)).unwrap();
        status_tx.send(status(Some(1), &[1, 2], 0)).unwrap();
        // Quorum loss, then recovery: two transitions.
        status_tx.send(status(None, &[1, 2], 0)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        status_tx.send(status(Some(1), &[1, 2], 0)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(transitions.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.current(), ClusterHealth::Healthy);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
