//! Store-to-dataplane reconciliation.
//!
//! Subscribes to device, user, group, membership, ACL, and timeout changes
//! and translates each into dataplane operations. Every subscription
//! replays the current key space as synthetic `Created` events, so a
//! freshly started or rejoined node rebuilds the full dataplane state; all
//! actions are therefore idempotent. Action errors are logged and counted,
//! never fatal to the loop.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use wag_core::keys;
use wag_core::Acl;
use wag_core::Device;
use wag_core::User;
use wag_raft::ClusterHealth;
use wag_registry::EventDispatcher;
use wag_registry::ListenerHandle;
use wag_registry::ListenerOptions;
use wag_registry::Registry;
use wag_registry::RegistryError;
use wag_store::EventKind;

use crate::dataplane::Dataplane;
use crate::dataplane::DataplaneError;
use crate::sessions::user_forces_deauth;
use crate::sessions::SessionTracker;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dataplane(#[from] DataplaneError),
}

/// Counters surfacing repeated reconcile failures.
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    action_failures: AtomicU64,
    teardowns: AtomicU64,
    rebuilds: AtomicU64,
}

impl ReconcilerMetrics {
    pub fn action_failures(&self) -> u64 {
        self.action_failures.load(Ordering::Relaxed)
    }

    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }
}

/// Drives the external dataplane from store events.
pub struct Reconciler {
    registry: Arc<Registry>,
    dispatcher: Arc<EventDispatcher>,
    dataplane: Arc<dyn Dataplane>,
    sessions: Arc<SessionTracker>,
    metrics: Arc<ReconcilerMetrics>,
    handles: Mutex<Vec<ListenerHandle>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Arc<EventDispatcher>,
        dataplane: Arc<dyn Dataplane>,
        sessions: Arc<SessionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dispatcher,
            dataplane,
            sessions,
            metrics: Arc::new(ReconcilerMetrics::default()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn metrics(&self) -> Arc<ReconcilerMetrics> {
        self.metrics.clone()
    }

    /// Bring the dataplane up and subscribe to every watched prefix.
    pub async fn start(self: &Arc<Self>) -> Result<(), ReconcilerError> {
        self.dataplane.setup(false).await?;
        self.subscribe_all().await?;
        Ok(())
    }

    /// Couple the dataplane lifecycle to cluster health transitions.
    ///
    /// `Dead` tears the dataplane down exactly once and pauses event
    /// consumption; the next `Healthy` rebuilds from a fresh snapshot
    /// replay and resubscribes.
    pub async fn run_health_gate(
        self: Arc<Self>,
        mut health_rx: mpsc::UnboundedReceiver<ClusterHealth>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut gated = false;
        loop {
            tokio::select! {
                health = health_rx.recv() => {
                    let Some(health) = health else { return };
                    match health {
                        ClusterHealth::Dead if !gated => {
                            warn!("cluster dead, tearing the dataplane down");
                            gated = true;
                            self.unsubscribe_all();
                            self.metrics.teardowns.fetch_add(1, Ordering::Relaxed);
                            if let Err(err) = self.dataplane.tear_down(false).await {
                                warn!(error = %err, "dataplane teardown failed");
                            }
                        }
                        ClusterHealth::Healthy if gated => {
                            info!("cluster healthy again, rebuilding the dataplane");
                            gated = false;
                            self.metrics.rebuilds.fetch_add(1, Ordering::Relaxed);
                            if let Err(err) = self.dataplane.setup(true).await {
                                warn!(error = %err, "dataplane rebuild failed");
                            }
                            if let Err(err) = self.subscribe_all().await {
                                warn!(error = %err, "resubscription failed");
                            }
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Graceful shutdown path.
    pub async fn stop(&self) {
        self.unsubscribe_all();
        if let Err(err) = self.dataplane.tear_down(true).await {
            warn!(error = %err, "graceful dataplane teardown failed");
        }
    }

    fn unsubscribe_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for handle in &handles {
            handle.cancel();
        }
    }

    async fn subscribe_all(self: &Arc<Self>) -> Result<(), ReconcilerError> {
        let replay = ListenerOptions {
            replay_existing: true,
            ..ListenerOptions::default()
        };
        let mut handles = Vec::new();

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<Device, _, _>(keys::DEVICES_PREFIX, replay, move |key, current, previous, kind| {
                    let this = this.clone();
                    async move { this.on_device(key, current, previous, kind).await.map_err(Into::into) }
                })
                .await?,
        );

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<User, _, _>(keys::USERS_PREFIX, replay, move |key, current, previous, kind| {
                    let this = this.clone();
                    async move { this.on_user(key, current, previous, kind).await.map_err(Into::into) }
                })
                .await?,
        );

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<Vec<String>, _, _>(
                    keys::GROUPS_PREFIX,
                    replay,
                    move |key, current, previous, kind| {
                        let this = this.clone();
                        async move { this.on_group(key, current, previous, kind).await.map_err(Into::into) }
                    },
                )
                .await?,
        );

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<Vec<String>, _, _>(
                    keys::MEMBERSHIP_PREFIX,
                    replay,
                    move |key, current, previous, kind| {
                        let this = this.clone();
                        async move { this.on_membership(key, current, previous, kind).await.map_err(Into::into) }
                    },
                )
                .await?,
        );

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<Acl, _, _>(keys::ACLS_PREFIX, replay, move |key, current, previous, kind| {
                    let this = this.clone();
                    async move { this.on_acl(key, current, previous, kind).await.map_err(Into::into) }
                })
                .await?,
        );

        let this = self.clone();
        handles.push(
            self.dispatcher
                .register_listener::<i64, _, _>(
                    keys::INACTIVITY_TIMEOUT_KEY,
                    replay,
                    move |key, current, previous, kind| {
                        let this = this.clone();
                        async move { this.on_inactivity_timeout(key, current, previous, kind).await.map_err(Into::into) }
                    },
                )
                .await?,
        );

        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
        Ok(())
    }

    fn count_failure(&self, err: ReconcilerError) -> ReconcilerError {
        self.metrics.action_failures.fetch_add(1, Ordering::Relaxed);
        err
    }

    async fn on_device(
        &self,
        _key: String,
        current: Device,
        previous: Device,
        kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        match kind {
            EventKind::Created => {
                self.dataplane
                    .add_peer(&current.public_key, &current.username, &current.address, &current.preshared_key)
                    .await
                    .map_err(|err| self.count_failure(err.into()))?;
                info!(address = %current.address, "added peer");

                // Replay of an already-authorised device (startup, rejoin)
                // restores its forwarding session as well.
                if current.is_authorised() {
                    if let Some(node) = current.associated_node {
                        self.dataplane
                            .set_authorized(&current.address, &current.username, node)
                            .await
                            .map_err(|err| self.count_failure(err.into()))?;
                    }
                }
                self.sessions.observe_device(&current);
            }
            EventKind::Deleted => {
                self.sessions.forget(&current.address);
                self.dataplane
                    .remove_peer(&current.public_key, &current.address)
                    .await
                    .map_err(|err| self.count_failure(err.into()))?;
                info!(address = %current.address, "removed peer");
            }
            EventKind::Modified => {
                if current.public_key != previous.public_key {
                    self.dataplane
                        .replace_peer(&previous, &current.public_key)
                        .await
                        .map_err(|err| self.count_failure(err.into()))?;
                    info!(address = %current.address, "replaced peer public key");
                }

                let lockout = self.registry.get_lockout().await?;

                // Deauthorising conditions win over authorising ones.
                let locked_out = current.attempts > lockout;
                if locked_out
                    || current.endpoint != previous.endpoint
                    || current.associated_node != previous.associated_node
                    || !current.is_authorised()
                {
                    if locked_out && current.is_authorised() {
                        // Persist the forced deauthorisation so every node
                        // agrees the session is gone.
                        self.registry.deauthorise(&current.username, &current.address).await?;
                    }
                    self.sessions.forget(&current.address);
                    self.dataplane
                        .deauthenticate(&current.address)
                        .await
                        .map_err(|err| self.count_failure(err.into()))?;
                    info!(address = %current.address, "deauthenticated device");
                }

                // Deauthorisation always lands before a new authorise
                // action; a session is pinned to its node and endpoint.
                if current.authorised != previous.authorised
                    && current.is_authorised()
                    && !locked_out
                    && current.associated_node == previous.associated_node
                {
                    if let Some(node) = current.associated_node {
                        self.dataplane
                            .set_authorized(&current.address, &current.username, node)
                            .await
                            .map_err(|err| self.count_failure(err.into()))?;
                        self.sessions.observe_device(&current);
                        info!(address = %current.address, "authorised device");
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_user(
        &self,
        _key: String,
        current: User,
        previous: User,
        kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        match kind {
            EventKind::Created => {
                let acl = self.registry.get_effective_acl(&current.username).await?;
                self.dataplane
                    .add_user(&current.username, acl)
                    .await
                    .map_err(|err| self.count_failure(err.into()))?;
            }
            EventKind::Deleted => {
                self.dataplane
                    .remove_user(&current.username)
                    .await
                    .map_err(|err| self.count_failure(err.into()))?;
            }
            EventKind::Modified => {
                if current.locked != previous.locked || current.locked {
                    self.dataplane
                        .set_lock_account(&current.username, current.locked)
                        .await
                        .map_err(|err| self.count_failure(err.into()))?;
                }

                if user_forces_deauth(&current, &previous) {
                    // Clear the stored sessions first so the invariant
                    // "locked user has no authorised devices" holds in the
                    // store, then drop the dataplane state.
                    for device in self.registry.get_devices_by_user(&current.username).await? {
                        if device.is_authorised() {
                            self.registry.deauthorise(&current.username, &device.address).await?;
                        }
                        self.sessions.forget(&device.address);
                    }
                    self.dataplane
                        .deauthenticate_all_devices(&current.username)
                        .await
                        .map_err(|err| self.count_failure(err.into()))?;
                    info!(user = %current.username, "deauthenticated all devices");
                }
            }
        }
        Ok(())
    }

    /// Group changes refresh the union of previous and current members, so
    /// users removed from a group lose its ACL entries too.
    async fn on_group(
        &self,
        _key: String,
        current: Vec<String>,
        previous: Vec<String>,
        _kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        let mut members: Vec<&String> = current.iter().chain(previous.iter()).collect();
        members.sort();
        members.dedup();

        for username in members {
            self.dataplane
                .refresh_user_acls(username)
                .await
                .map_err(|err| self.count_failure(err.into()))?;
        }
        Ok(())
    }

    async fn on_membership(
        &self,
        key: String,
        _current: Vec<String>,
        _previous: Vec<String>,
        kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        if matches!(kind, EventKind::Created | EventKind::Modified) {
            let username = key.trim_start_matches(keys::MEMBERSHIP_PREFIX);
            self.dataplane
                .refresh_user_acls(username)
                .await
                .map_err(|err| self.count_failure(err.into()))?;
        }
        Ok(())
    }

    async fn on_acl(
        &self,
        _key: String,
        _current: Acl,
        _previous: Acl,
        _kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        self.dataplane
            .refresh_configuration()
            .await
            .map_err(|err| self.count_failure(err.into()))?;
        Ok(())
    }

    async fn on_inactivity_timeout(
        &self,
        _key: String,
        current: i64,
        _previous: i64,
        kind: EventKind,
    ) -> Result<(), ReconcilerError> {
        if matches!(kind, EventKind::Created | EventKind::Modified) {
            self.dataplane
                .set_inactivity_timeout(current)
                .await
                .map_err(|err| self.count_failure(err.into()))?;
            info!(minutes = current, "inactivity timeout changed");
        }
        Ok(())
    }
}
