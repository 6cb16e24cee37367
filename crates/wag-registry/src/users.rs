//! User account repository.

use wag_core::keys;
use wag_core::MfaType;
use wag_core::User;
use wag_store::safe_update;
use wag_store::Compare;
use wag_store::Mutation;
use wag_store::Op;
use wag_store::OpResult;
use wag_store::SortOrder;
use wag_store::Txn;

use crate::decode;
use crate::encode;
use crate::Registry;
use crate::RegistryError;

impl Registry {
    pub async fn create_user(&self, username: &str) -> Result<User, RegistryError> {
        if username.is_empty() {
            return Err(RegistryError::Validation("username must not be empty".into()));
        }

        let user = User {
            username: username.to_string(),
            ..User::default()
        };
        let key = keys::user(username);

        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![Compare::KeyMissing { key: key.clone() }],
                then_ops: vec![Op::Put {
                    key,
                    value: encode(&user),
                }],
                else_ops: vec![],
            })
            .await?;

        if !outcome.succeeded {
            return Err(RegistryError::AlreadyExists {
                entity: "user",
                id: username.to_string(),
            });
        }
        Ok(user)
    }

    pub async fn get_user(&self, username: &str) -> Result<User, RegistryError> {
        self.get_json(&keys::user(username)).await.map_err(|err| match err {
            RegistryError::NotFound { .. } => RegistryError::NotFound {
                entity: "user",
                id: username.to_string(),
            },
            other => other,
        })
    }

    pub async fn get_all_users(&self) -> Result<Vec<User>, RegistryError> {
        let entries = self.store().list(keys::USERS_PREFIX, SortOrder::Descending).await?;
        entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    /// Record a fresh MFA enrolment for a user.
    pub async fn set_user_mfa(&self, username: &str, mfa: &str, mfa_type: MfaType) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| {
            user.mfa = mfa.to_string();
            user.mfa_type = mfa_type;
        })
        .await
    }

    /// The user's opaque MFA secret blob, handed to the external verifier.
    pub async fn get_user_mfa(&self, username: &str) -> Result<String, RegistryError> {
        Ok(self.get_user(username).await?.mfa)
    }

    /// Switch the MFA method without touching the stored secret.
    pub async fn set_mfa_type(&self, username: &str, mfa_type: MfaType) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| user.mfa_type = mfa_type).await
    }

    /// Clear MFA entirely; every active session for the user is torn down
    /// by the reconciler when it sees the type change to unset.
    pub async fn reset_user_mfa(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| {
            user.mfa = String::new();
            user.mfa_type = MfaType::Unset;
        })
        .await
    }

    pub async fn set_user_lock(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| user.locked = true).await
    }

    pub async fn set_user_unlock(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| user.locked = false).await
    }

    pub async fn set_enforce_mfa_on(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| user.enforcing = true).await
    }

    pub async fn set_enforce_mfa_off(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_user(username, |user| user.enforcing = false).await
    }

    pub async fn is_enforcing(&self, username: &str) -> Result<bool, RegistryError> {
        Ok(self.get_user(username).await?.enforcing)
    }

    /// Delete a user and cascade to every device they own.
    ///
    /// The account key and the device primaries go in one transaction; the
    /// device reference keys follow in a best-effort second pass (repaired
    /// at startup if interrupted).
    pub async fn delete_user(&self, username: &str) -> Result<(), RegistryError> {
        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![],
                then_ops: vec![
                    Op::Delete {
                        key: keys::user(username),
                    },
                    Op::DeletePrefix {
                        prefix: keys::devices_of(username),
                    },
                ],
                else_ops: vec![],
            })
            .await?;

        let mut ops = Vec::new();
        if let Some(OpResult::Deleted { entries }) = outcome.results.get(1) {
            for entry in entries {
                let device: wag_core::Device = decode(&entry.key, &entry.value)?;
                ops.push(Op::Delete {
                    key: keys::device_ref(&device.address),
                });
                ops.push(Op::Delete {
                    key: keys::device_ref(&device.public_key),
                });
            }
        }
        if !ops.is_empty() {
            self.store()
                .txn(Txn {
                    compares: vec![],
                    then_ops: ops,
                    else_ops: vec![],
                })
                .await?;
        }
        Ok(())
    }

    async fn mutate_user(&self, username: &str, mutate: impl Fn(&mut User) + Send + Sync) -> Result<(), RegistryError> {
        let key = keys::user(username);
        safe_update(&*self.store(), &key, |entry| {
            let mut user: User = decode(&key, &entry.value)?;
            mutate(&mut user);
            Ok::<_, RegistryError>(Mutation::Put(encode(&user)))
        })
        .await
        .map(|_| ())
        .map_err(|err| match err {
            RegistryError::Store(wag_store::StoreError::NotFound { .. }) => RegistryError::NotFound {
                entity: "user",
                id: username.to_string(),
            },
            other => other,
        })
    }
}
