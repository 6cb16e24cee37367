//! Device repository.
//!
//! A device owns three keys: the primary under
//! `devices-<username>-<address>` and one reference each for the address
//! and the public key. Every operation that moves a device keeps the three
//! keys consistent inside a single transaction; a reference that resolves
//! to a missing primary is an invariant violation and is reported.

use std::net::IpAddr;

use chrono::Utc;
use wag_core::keys;
use wag_core::Device;
use wag_store::safe_update;
use wag_store::Compare;
use wag_store::Mutation;
use wag_store::Op;
use wag_store::SortOrder;
use wag_store::StoreEntry;
use wag_store::Txn;

use crate::decode;
use crate::encode;
use crate::Registry;
use crate::RegistryError;

impl Registry {
    /// Register a device, creating the primary and both reference keys
    /// atomically. Fails if any of the three keys already exists.
    pub async fn add_device(
        &self,
        username: &str,
        address: &str,
        public_key: &str,
        preshared_key: &str,
    ) -> Result<Device, RegistryError> {
        if address.parse::<IpAddr>().is_err() {
            return Err(RegistryError::Validation(format!(
                "address '{address}' cannot be parsed as an IP"
            )));
        }

        let device = Device {
            address: address.to_string(),
            public_key: public_key.to_string(),
            preshared_key: preshared_key.to_string(),
            username: username.to_string(),
            ..Device::default()
        };

        let primary = keys::device(username, address);
        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![
                    Compare::KeyMissing { key: primary.clone() },
                    Compare::KeyMissing {
                        key: keys::device_ref(address),
                    },
                    Compare::KeyMissing {
                        key: keys::device_ref(public_key),
                    },
                ],
                then_ops: vec![
                    Op::Put {
                        key: primary.clone(),
                        value: encode(&device),
                    },
                    Op::Put {
                        key: keys::device_ref(address),
                        value: primary.clone(),
                    },
                    Op::Put {
                        key: keys::device_ref(public_key),
                        value: primary,
                    },
                ],
                else_ops: vec![],
            })
            .await?;

        if !outcome.succeeded {
            return Err(RegistryError::AlreadyExists {
                entity: "device",
                id: address.to_string(),
            });
        }
        Ok(device)
    }

    pub async fn get_device(&self, username: &str, address: &str) -> Result<Device, RegistryError> {
        let key = keys::device(username, address);
        self.get_json(&key).await.map_err(|err| match err {
            RegistryError::NotFound { .. } => RegistryError::NotFound {
                entity: "device",
                id: address.to_string(),
            },
            other => other,
        })
    }

    /// Look a device up by address or public key through its reference key.
    pub async fn get_device_by_id(&self, id: &str) -> Result<Device, RegistryError> {
        let (_, entry) = self.resolve_device_ref(id).await?;
        decode(&entry.key, &entry.value)
    }

    pub async fn get_all_devices(&self) -> Result<Vec<Device>, RegistryError> {
        let entries = self.store().list(keys::DEVICES_PREFIX, SortOrder::Descending).await?;
        entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    pub async fn get_devices_by_user(&self, username: &str) -> Result<Vec<Device>, RegistryError> {
        let entries = self
            .store()
            .list(&keys::devices_of(username), SortOrder::Descending)
            .await?;
        entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    /// Remove a device by address or public key: primary and both
    /// references go in one transaction.
    pub async fn delete_device(&self, id: &str) -> Result<(), RegistryError> {
        let (primary_key, entry) = self.resolve_device_ref(id).await?;
        let device: Device = decode(&entry.key, &entry.value)?;

        let other_ref = if device.public_key == id {
            keys::device_ref(&device.address)
        } else {
            keys::device_ref(&device.public_key)
        };

        self.store()
            .txn(Txn {
                compares: vec![],
                then_ops: vec![
                    Op::Delete { key: primary_key },
                    Op::Delete {
                        key: keys::device_ref(id),
                    },
                    Op::Delete { key: other_ref },
                ],
                else_ops: vec![],
            })
            .await?;
        Ok(())
    }

    /// Remove every device a user owns.
    ///
    /// Two phases: prefix-delete the primaries, then delete the reference
    /// keys recovered from the previous values. A crash between the phases
    /// leaves orphan references that the startup repair pass removes.
    pub async fn delete_devices(&self, username: &str) -> Result<(), RegistryError> {
        let removed = self.store().delete_prefix(&keys::devices_of(username)).await?;
        if removed.is_empty() {
            return Ok(());
        }

        let mut ops = Vec::with_capacity(removed.len() * 2);
        for entry in &removed {
            let device: Device = decode(&entry.key, &entry.value)?;
            ops.push(Op::Delete {
                key: keys::device_ref(&device.public_key),
            });
            ops.push(Op::Delete {
                key: keys::device_ref(&device.address),
            });
        }

        self.store()
            .txn(Txn {
                compares: vec![],
                then_ops: ops,
                else_ops: vec![],
            })
            .await?;
        Ok(())
    }

    /// Rotate a device's public key: safe-update the primary, retire the
    /// old key reference, publish the new one.
    ///
    /// The reference steps are deliberately separate writes; should the
    /// node die between them the reference is derivable from the primary
    /// and the startup repair pass republishes it.
    pub async fn update_device_public_key(
        &self,
        username: &str,
        address: &str,
        new_public_key: &str,
    ) -> Result<(), RegistryError> {
        let before = self.get_device(username, address).await?;
        let primary = keys::device(username, address);

        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.public_key = new_public_key.to_string();
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await?;

        self.store().delete(&keys::device_ref(&before.public_key)).await?;
        self.store().put(&keys::device_ref(new_public_key), &primary).await?;
        Ok(())
    }

    /// Record the last observed UDP remote of a device.
    pub async fn update_device_endpoint(
        &self,
        address: &str,
        endpoint: std::net::SocketAddr,
    ) -> Result<(), RegistryError> {
        let (primary, _) = self.resolve_device_ref(address).await?;
        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.endpoint = Some(endpoint);
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await
        .map(|_| ())
    }

    pub async fn set_device_authentication_attempts(
        &self,
        username: &str,
        address: &str,
        attempts: u32,
    ) -> Result<(), RegistryError> {
        let primary = keys::device(username, address);
        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.attempts = attempts;
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await
        .map(|_| ())
    }

    /// Bump the failure counter after a rejected authentication.
    pub async fn increment_device_attempts(&self, username: &str, address: &str) -> Result<u32, RegistryError> {
        let primary = keys::device(username, address);
        let mut attempts = 0;
        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.attempts += 1;
            attempts = device.attempts;
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await?;
        Ok(attempts)
    }

    /// Record an MFA success against this node.
    ///
    /// The verification itself happens in the external authenticator; this
    /// only records the outcome, refusing when the account state forbids a
    /// session.
    pub async fn authorise_device(&self, username: &str, address: &str) -> Result<(), RegistryError> {
        let user = self.get_user(username).await?;
        if user.locked {
            return Err(RegistryError::AuthDenied {
                reason: format!("account '{username}' is locked"),
            });
        }
        if user.enforcing && user.mfa_type == wag_core::MfaType::Unset {
            return Err(RegistryError::AuthDenied {
                reason: format!("account '{username}' has no MFA method configured"),
            });
        }

        let device = self.get_device(username, address).await?;
        let lockout = self.get_lockout().await?;
        if device.attempts > lockout {
            return Err(RegistryError::AuthDenied {
                reason: format!("device '{address}' is locked out"),
            });
        }

        self.set_authorised(username, address, self.node_id()).await
    }

    /// Mark a device authorised now, pinned to the given node.
    pub async fn set_authorised(&self, username: &str, address: &str, node: u64) -> Result<(), RegistryError> {
        let primary = keys::device(username, address);
        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.authorised = Some(Utc::now());
            device.attempts = 0;
            device.associated_node = Some(node);
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await
        .map(|_| ())
    }

    /// Clear a device's session.
    pub async fn deauthorise(&self, username: &str, address: &str) -> Result<(), RegistryError> {
        let primary = keys::device(username, address);
        safe_update(&*self.store(), &primary, |entry| {
            let mut device: Device = decode(&primary, &entry.value)?;
            device.authorised = None;
            Ok::<_, RegistryError>(Mutation::Put(encode(&device)))
        })
        .await
        .map(|_| ())
    }

    /// Resolve a reference key to the primary entry it points at.
    async fn resolve_device_ref(&self, id: &str) -> Result<(String, StoreEntry), RegistryError> {
        let reference = self
            .store()
            .get(&keys::device_ref(id))
            .await?
            .ok_or_else(|| RegistryError::NoReferenceFound { id: id.to_string() })?;

        let primary_key = reference.value;
        let entry = self
            .store()
            .get(&primary_key)
            .await?
            .ok_or_else(|| RegistryError::DanglingReference {
                id: id.to_string(),
                key: primary_key.clone(),
            })?;
        Ok((primary_key, entry))
    }
}
