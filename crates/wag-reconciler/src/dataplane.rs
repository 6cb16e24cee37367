//! Dataplane seam.
//!
//! The packet-forwarding dataplane (kernel filter and NAT rules, per-peer
//! counters) lives outside this repository; the reconciler drives it
//! through this trait. Every operation must be idempotent: after a cluster
//! rejoin the whole key space is replayed against it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use wag_core::Acl;
use wag_core::Device;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataplaneError {
    #[error("no dataplane state for '{address}'")]
    UnknownAddress { address: String },

    #[error("no dataplane state for user '{username}'")]
    UnknownUser { username: String },

    #[error("dataplane failure: {reason}")]
    Failed { reason: String },
}

/// An authorised forwarding session as the dataplane sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub address: String,
    pub username: String,
    pub node_id: u64,
    pub authorised_at: DateTime<Utc>,
}

/// One user's installed rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    pub username: String,
    pub policy: Acl,
    pub devices: Vec<String>,
}

/// Operations the reconciler issues against the packet-forwarding plane.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn setup(&self, rejoin: bool) -> Result<(), DataplaneError>;
    async fn tear_down(&self, graceful: bool) -> Result<(), DataplaneError>;

    async fn add_peer(&self, public_key: &str, username: &str, address: &str, preshared_key: &str)
        -> Result<(), DataplaneError>;
    async fn remove_peer(&self, public_key: &str, address: &str) -> Result<(), DataplaneError>;
    async fn replace_peer(&self, previous: &Device, new_public_key: &str) -> Result<(), DataplaneError>;

    async fn set_authorized(&self, address: &str, username: &str, node_id: u64) -> Result<(), DataplaneError>;
    async fn deauthenticate(&self, address: &str) -> Result<(), DataplaneError>;
    async fn deauthenticate_all_devices(&self, username: &str) -> Result<(), DataplaneError>;

    async fn set_lock_account(&self, username: &str, locked: bool) -> Result<(), DataplaneError>;
    async fn add_user(&self, username: &str, acl: Acl) -> Result<(), DataplaneError>;
    async fn remove_user(&self, username: &str) -> Result<(), DataplaneError>;
    async fn refresh_user_acls(&self, username: &str) -> Result<(), DataplaneError>;
    async fn refresh_configuration(&self) -> Result<(), DataplaneError>;
    async fn set_inactivity_timeout(&self, minutes: i64) -> Result<(), DataplaneError>;

    async fn get_all_allowed(&self) -> Result<Vec<SessionRecord>, DataplaneError>;
    async fn get_rules(&self) -> Result<Vec<RuleRecord>, DataplaneError>;
}

/// Call log entry recorded by [`TrackingDataplane`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataplaneCall {
    Setup { rejoin: bool },
    TearDown { graceful: bool },
    AddPeer { public_key: String, username: String, address: String },
    RemovePeer { public_key: String, address: String },
    ReplacePeer { previous_key: String, new_key: String, address: String },
    SetAuthorized { address: String, username: String, node_id: u64 },
    Deauthenticate { address: String },
    DeauthenticateAllDevices { username: String },
    SetLockAccount { username: String, locked: bool },
    AddUser { username: String },
    RemoveUser { username: String },
    RefreshUserAcls { username: String },
    RefreshConfiguration,
    SetInactivityTimeout { minutes: i64 },
}

#[derive(Debug, Clone)]
struct PeerState {
    public_key: String,
    username: String,
}

#[derive(Default)]
struct TrackingState {
    peers: HashMap<String, PeerState>,
    sessions: HashMap<String, SessionRecord>,
    users: HashMap<String, Acl>,
    locked: HashMap<String, bool>,
    inactivity_minutes: i64,
    up: bool,
}

/// Control-plane-side model of the dataplane.
///
/// Tracks peers, sessions, and per-user rules without programming any
/// kernel state. The daemon runs on it when no packet-forwarding driver is
/// wired in, and tests use it (with recording enabled) to assert on the
/// exact call sequence.
#[derive(Default)]
pub struct TrackingDataplane {
    state: Mutex<TrackingState>,
    calls: Mutex<Option<Vec<DataplaneCall>>>,
}

impl TrackingDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable call recording (tests only; the log grows unbounded).
    pub fn recording() -> Self {
        Self {
            state: Mutex::new(TrackingState::default()),
            calls: Mutex::new(Some(Vec::new())),
        }
    }

    /// Drain the recorded call log.
    pub fn take_calls(&self) -> Vec<DataplaneCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn record(&self, call: DataplaneCall) {
        debug!(?call, "dataplane");
        if let Some(calls) = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).as_mut() {
            calls.push(call);
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut TrackingState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl Dataplane for TrackingDataplane {
    async fn setup(&self, rejoin: bool) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::Setup { rejoin });
        self.with(|state| state.up = true);
        Ok(())
    }

    async fn tear_down(&self, graceful: bool) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::TearDown { graceful });
        self.with(|state| *state = TrackingState::default());
        Ok(())
    }

    async fn add_peer(
        &self,
        public_key: &str,
        username: &str,
        address: &str,
        _preshared_key: &str,
    ) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::AddPeer {
            public_key: public_key.to_string(),
            username: username.to_string(),
            address: address.to_string(),
        });
        self.with(|state| {
            state.peers.insert(
                address.to_string(),
                PeerState {
                    public_key: public_key.to_string(),
                    username: username.to_string(),
                },
            );
        });
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str, address: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::RemovePeer {
            public_key: public_key.to_string(),
            address: address.to_string(),
        });
        self.with(|state| {
            state.peers.remove(address);
            state.sessions.remove(address);
        });
        Ok(())
    }

    async fn replace_peer(&self, previous: &Device, new_public_key: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::ReplacePeer {
            previous_key: previous.public_key.clone(),
            new_key: new_public_key.to_string(),
            address: previous.address.clone(),
        });
        self.with(|state| {
            if let Some(peer) = state.peers.get_mut(&previous.address) {
                peer.public_key = new_public_key.to_string();
            }
            // A key swap invalidates any running session.
            state.sessions.remove(&previous.address);
        });
        Ok(())
    }

    async fn set_authorized(&self, address: &str, username: &str, node_id: u64) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::SetAuthorized {
            address: address.to_string(),
            username: username.to_string(),
            node_id,
        });
        self.with(|state| {
            state.sessions.insert(
                address.to_string(),
                SessionRecord {
                    address: address.to_string(),
                    username: username.to_string(),
                    node_id,
                    authorised_at: Utc::now(),
                },
            );
        });
        Ok(())
    }

    async fn deauthenticate(&self, address: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::Deauthenticate {
            address: address.to_string(),
        });
        self.with(|state| {
            if !state.peers.contains_key(address) {
                return Err(DataplaneError::UnknownAddress {
                    address: address.to_string(),
                });
            }
            state.sessions.remove(address);
            Ok(())
        })
    }

    async fn deauthenticate_all_devices(&self, username: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::DeauthenticateAllDevices {
            username: username.to_string(),
        });
        self.with(|state| {
            state.sessions.retain(|_, session| session.username != username);
        });
        Ok(())
    }

    async fn set_lock_account(&self, username: &str, locked: bool) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::SetLockAccount {
            username: username.to_string(),
            locked,
        });
        self.with(|state| {
            state.locked.insert(username.to_string(), locked);
            if locked {
                state.sessions.retain(|_, session| session.username != username);
            }
        });
        Ok(())
    }

    async fn add_user(&self, username: &str, acl: Acl) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::AddUser {
            username: username.to_string(),
        });
        self.with(|state| {
            state.users.insert(username.to_string(), acl);
        });
        Ok(())
    }

    async fn remove_user(&self, username: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::RemoveUser {
            username: username.to_string(),
        });
        self.with(|state| {
            state.users.remove(username);
            state.locked.remove(username);
            state.sessions.retain(|_, session| session.username != username);
        });
        Ok(())
    }

    async fn refresh_user_acls(&self, username: &str) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::RefreshUserAcls {
            username: username.to_string(),
        });
        Ok(())
    }

    async fn refresh_configuration(&self) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::RefreshConfiguration);
        Ok(())
    }

    async fn set_inactivity_timeout(&self, minutes: i64) -> Result<(), DataplaneError> {
        self.record(DataplaneCall::SetInactivityTimeout { minutes });
        self.with(|state| state.inactivity_minutes = minutes);
        Ok(())
    }

    async fn get_all_allowed(&self) -> Result<Vec<SessionRecord>, DataplaneError> {
        Ok(self.with(|state| {
            let mut sessions: Vec<SessionRecord> = state.sessions.values().cloned().collect();
            sessions.sort_by(|a, b| a.address.cmp(&b.address));
            sessions
        }))
    }

    async fn get_rules(&self) -> Result<Vec<RuleRecord>, DataplaneError> {
        Ok(self.with(|state| {
            let mut rules: Vec<RuleRecord> = state
                .users
                .iter()
                .map(|(username, acl)| RuleRecord {
                    username: username.clone(),
                    policy: acl.clone(),
                    devices: state
                        .peers
                        .iter()
                        .filter(|(_, peer)| peer.username == *username)
                        .map(|(address, _)| address.clone())
                        .collect(),
                })
                .collect();
            rules.sort_by(|a, b| a.username.cmp(&b.username));
            rules
        }))
    }
}
