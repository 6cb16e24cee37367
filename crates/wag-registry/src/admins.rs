//! Admin UI account repository.

use wag_core::entities::ADMIN_LOCKOUT_ATTEMPTS;
use wag_core::keys;
use wag_core::AdminUser;
use wag_store::safe_update;
use wag_store::Compare;
use wag_store::Mutation;
use wag_store::Op;
use wag_store::SortOrder;
use wag_store::Txn;

use crate::decode;
use crate::encode;
use crate::Registry;
use crate::RegistryError;

impl Registry {
    pub async fn create_admin_user(&self, username: &str, hash: &str) -> Result<AdminUser, RegistryError> {
        let admin = AdminUser {
            username: username.to_string(),
            hash: hash.to_string(),
            ..AdminUser::default()
        };
        let key = keys::admin_user(username);

        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![Compare::KeyMissing { key: key.clone() }],
                then_ops: vec![Op::Put {
                    key,
                    value: encode(&admin),
                }],
                else_ops: vec![],
            })
            .await?;

        if !outcome.succeeded {
            return Err(RegistryError::AlreadyExists {
                entity: "admin user",
                id: username.to_string(),
            });
        }
        Ok(admin)
    }

    pub async fn get_admin_user(&self, username: &str) -> Result<AdminUser, RegistryError> {
        self.get_json(&keys::admin_user(username)).await.map_err(|err| match err {
            RegistryError::NotFound { .. } => RegistryError::NotFound {
                entity: "admin user",
                id: username.to_string(),
            },
            other => other,
        })
    }

    pub async fn get_all_admin_users(&self) -> Result<Vec<AdminUser>, RegistryError> {
        let entries = self.store().list(keys::ADMIN_USERS_PREFIX, SortOrder::Descending).await?;
        entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    pub async fn set_admin_hash(&self, username: &str, hash: &str) -> Result<(), RegistryError> {
        self.mutate_admin(username, |admin| admin.hash = hash.to_string()).await
    }

    /// Count a failed login; the account locks itself past the threshold.
    pub async fn increment_admin_attempts(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_admin(username, |admin| {
            admin.attempts += 1;
            if admin.attempts > ADMIN_LOCKOUT_ATTEMPTS {
                admin.locked = true;
            }
        })
        .await
    }

    pub async fn set_admin_lock(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_admin(username, |admin| admin.locked = true).await
    }

    pub async fn set_admin_unlock(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate_admin(username, |admin| {
            admin.locked = false;
            admin.attempts = 0;
        })
        .await
    }

    pub async fn delete_admin_user(&self, username: &str) -> Result<(), RegistryError> {
        self.store().delete(&keys::admin_user(username)).await?;
        Ok(())
    }

    async fn mutate_admin(&self, username: &str, mutate: impl Fn(&mut AdminUser) + Send + Sync) -> Result<(), RegistryError> {
        let key = keys::admin_user(username);
        safe_update(&*self.store(), &key, |entry| {
            let mut admin: AdminUser = decode(&key, &entry.value)?;
            mutate(&mut admin);
            Ok::<_, RegistryError>(Mutation::Put(encode(&admin)))
        })
        .await
        .map(|_| ())
        .map_err(|err| match err {
            RegistryError::Store(wag_store::StoreError::NotFound { .. }) => RegistryError::NotFound {
                entity: "admin user",
                id: username.to_string(),
            },
            other => other,
        })
    }
}
