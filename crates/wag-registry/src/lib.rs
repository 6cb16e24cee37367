//! Typed access to the configuration plane.
//!
//! The [`Registry`] wraps the shared store handle and exposes entity
//! repositories: devices, users, admin users, registration tokens, groups
//! and ACLs, and settings. Cross-key invariants (device reference keys,
//! the group membership reverse index) are enforced with multi-operation
//! transactions; single-key mutations go through the safe-update
//! primitive. The typed event dispatcher and first-start bootstrap also
//! live here.

pub mod bootstrap;
pub mod events;

mod admins;
mod devices;
mod error;
mod groups;
mod settings;
mod tokens;
mod users;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use wag_store::Store;
use wag_store::StoreError;

pub use error::RegistryError;
pub use events::DispatcherMetrics;
pub use events::EventDispatcher;
pub use events::ListenerHandle;
pub use events::ListenerOptions;

/// Shared, typed view of the store.
///
/// Constructed once at startup and threaded into every component; there are
/// no module-level store handles.
pub struct Registry {
    store: Arc<dyn Store>,
    node_id: u64,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, node_id: u64) -> Arc<Self> {
        Arc::new(Self { store, node_id })
    }

    /// The raw store handle, shared with the dispatcher.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Id of the local cluster node, recorded on authorised devices.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, RegistryError> {
        let entry = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound { key: key.to_string() })?;
        decode(key, &entry.value)
    }

    pub(crate) async fn get_json_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RegistryError> {
        match self.store.get(key).await? {
            Some(entry) => Ok(Some(decode(key, &entry.value)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        self.store.put(key, &encode(value)).await?;
        Ok(())
    }
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, RegistryError> {
    serde_json::from_str(value).map_err(|err| RegistryError::Decode {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

/// JSON-encode a value that has no non-serializable states.
pub(crate) fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| panic!("entity failed to serialize: {err}"))
}
