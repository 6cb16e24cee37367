//! Authorisation state and session expiry.
//!
//! A device's forwarding permission is time-bounded twice over: by
//! inactivity since the last observed packet and by an absolute session
//! lifetime. The tracker sweeps once per second (precision ±1s) and clears
//! expired sessions through the registry, which feeds the change back to
//! the reconciler as an ordinary device event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use wag_core::Device;
use wag_core::MfaType;
use wag_core::User;
use wag_registry::Registry;

/// Where a device sits in the authorisation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No primary key exists.
    Unknown,
    /// Registered but holding no session.
    Known,
    /// Session active and inside both time windows.
    Authorised,
    /// Was authorised; a time window ran out.
    Expired,
    /// Lockout threshold exceeded or the owner is locked.
    Locked,
}

/// Classify a device against its owner and the current limits.
///
/// Lock conditions dominate: a device past the attempt threshold is
/// `Locked` even while its session windows are still open.
pub fn classify(
    device: &Device,
    user: &User,
    lockout: u32,
    inactivity: Duration,
    max_lifetime: Duration,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DeviceState {
    if device.attempts > lockout || user.locked {
        return DeviceState::Locked;
    }

    let Some(authorised_at) = device.authorised else {
        return DeviceState::Known;
    };

    let lifetime_ok = now.signed_duration_since(authorised_at).to_std().map(|d| d <= max_lifetime).unwrap_or(true);
    let activity_ok = match last_seen {
        Some(seen) => now.signed_duration_since(seen).to_std().map(|d| d <= inactivity).unwrap_or(true),
        None => now.signed_duration_since(authorised_at).to_std().map(|d| d <= inactivity).unwrap_or(true),
    };

    if lifetime_ok && activity_ok {
        DeviceState::Authorised
    } else {
        DeviceState::Expired
    }
}

/// Whether a user's account state forces every session down.
///
/// MFA removal, a method change, enforcement being switched off, and an
/// account lock all invalidate existing sessions.
pub fn user_forces_deauth(current: &User, previous: &User) -> bool {
    current.locked
        || current.mfa != previous.mfa
        || current.mfa_type != previous.mfa_type
        || !current.enforcing
        || current.mfa_type == MfaType::Unset
}

struct Session {
    username: String,
    authorised_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Per-second sweep over live sessions.
pub struct SessionTracker {
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTracker {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Fold a device change into the session table.
    pub fn observe_device(&self, device: &Device) {
        let mut sessions = self.lock();
        match device.authorised {
            Some(authorised_at) => {
                let session = sessions.entry(device.address.clone()).or_insert_with(|| Session {
                    username: device.username.clone(),
                    authorised_at,
                    last_seen: authorised_at,
                });
                if session.authorised_at != authorised_at {
                    // Re-authorisation restarts both windows.
                    session.authorised_at = authorised_at;
                    session.last_seen = authorised_at;
                }
            }
            None => {
                sessions.remove(&device.address);
            }
        }
    }

    pub fn forget(&self, address: &str) {
        self.lock().remove(address);
    }

    /// Record traffic from a device ("packet observed").
    pub fn touch(&self, address: &str) {
        if let Some(session) = self.lock().get_mut(address) {
            session.last_seen = Utc::now();
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Run the expiry sweep until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let (inactivity, lifetime) = match (
            self.registry.get_session_inactivity_timeout_minutes().await,
            self.registry.get_session_lifetime_minutes().await,
        ) {
            (Ok(inactivity), Ok(lifetime)) => (
                Duration::from_secs(inactivity.max(0) as u64 * 60),
                Duration::from_secs(lifetime.max(0) as u64 * 60),
            ),
            _ => return, // limits not seeded yet
        };

        let now = Utc::now();
        let expired: Vec<(String, String)> = {
            let sessions = self.lock();
            sessions
                .iter()
                .filter(|(_, session)| {
                    let idle = now.signed_duration_since(session.last_seen).to_std().unwrap_or_default();
                    let age = now.signed_duration_since(session.authorised_at).to_std().unwrap_or_default();
                    idle > inactivity || age > lifetime
                })
                .map(|(address, session)| (address.clone(), session.username.clone()))
                .collect()
        };

        for (address, username) in expired {
            info!(address = %address, user = %username, "session expired");
            if let Err(err) = self.registry.deauthorise(&username, &address).await {
                warn!(address = %address, error = %err, "unable to clear expired session");
                continue;
            }
            self.forget(&address);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
