//! Groups, the membership reverse index, and ACL policies.
//!
//! A group's member list and the per-user reverse index
//! (`wag-membership-<username>`) are equivalent views of the same relation
//! and always change inside one transaction. The transaction is guarded on
//! the revision of every key it rewrites and retried on conflict.

use std::collections::BTreeSet;

use wag_core::keys;
use wag_core::Acl;
use wag_store::Compare;
use wag_store::Op;
use wag_store::SortOrder;
use wag_store::Txn;

use crate::decode;
use crate::encode;
use crate::Registry;
use crate::RegistryError;

impl Registry {
    pub async fn set_acl(&self, name: &str, acl: Acl) -> Result<(), RegistryError> {
        self.put_json(&keys::acl(name), &acl).await
    }

    pub async fn get_acl(&self, name: &str) -> Result<Option<Acl>, RegistryError> {
        self.get_json_opt(&keys::acl(name)).await
    }

    pub async fn remove_acl(&self, name: &str) -> Result<(), RegistryError> {
        self.store().delete(&keys::acl(name)).await?;
        Ok(())
    }

    pub async fn get_all_acl_names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = self.store().list(keys::ACLS_PREFIX, SortOrder::Ascending).await?;
        Ok(entries
            .into_iter()
            .map(|entry| entry.key.trim_start_matches(keys::ACLS_PREFIX).to_string())
            .collect())
    }

    /// The policy applied to a user: their own named policy, the wildcard
    /// policy, and the policy of every group they belong to, merged, with
    /// denied destinations subtracted from the grant lists.
    pub async fn get_effective_acl(&self, username: &str) -> Result<Acl, RegistryError> {
        let mut effective = Acl::default();

        if let Some(own) = self.get_acl(username).await? {
            effective.merge(&own);
        }
        if let Some(global) = self.get_acl("*").await? {
            effective.merge(&global);
        }
        for group in self.get_user_groups(username).await? {
            if let Some(acl) = self.get_acl(&group).await? {
                effective.merge(&acl);
            }
        }

        // A deny from any contributing policy revokes the same destination
        // granted by another.
        effective.subtract_deny();
        Ok(effective)
    }

    /// Groups a user belongs to, from the reverse index.
    pub async fn get_user_groups(&self, username: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.get_json_opt(&keys::membership(username)).await?.unwrap_or_default())
    }

    pub async fn get_group_members(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.get_json_opt::<Vec<String>>(&keys::group(name)).await?.unwrap_or_default())
    }

    pub async fn get_all_group_names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = self.store().list(keys::GROUPS_PREFIX, SortOrder::Ascending).await?;
        Ok(entries
            .into_iter()
            .map(|entry| entry.key.trim_start_matches(keys::GROUPS_PREFIX).to_string())
            .collect())
    }

    /// Replace a group's member list, updating the reverse index for every
    /// user that joins or leaves in the same transaction.
    pub async fn set_group(&self, name: &str, members: Vec<String>) -> Result<(), RegistryError> {
        loop {
            let previous = self.get_group_members(name).await?;
            let affected: BTreeSet<String> = previous.iter().chain(members.iter()).cloned().collect();

            let mut txn = Txn::default();
            txn.then_ops.push(Op::Put {
                key: keys::group(name),
                value: encode(&members),
            });

            for username in &affected {
                let key = keys::membership(username);
                let mut groups = match self.store().get(&key).await? {
                    Some(entry) => {
                        txn.compares.push(Compare::ModRevisionEquals {
                            key: key.clone(),
                            revision: entry.mod_revision,
                        });
                        decode::<Vec<String>>(&key, &entry.value)?
                    }
                    None => {
                        txn.compares.push(Compare::KeyMissing { key: key.clone() });
                        Vec::new()
                    }
                };

                groups.retain(|g| g != name);
                if members.contains(username) {
                    groups.push(name.to_string());
                }

                if groups.is_empty() {
                    txn.then_ops.push(Op::Delete { key });
                } else {
                    txn.then_ops.push(Op::Put {
                        key,
                        value: encode(&groups),
                    });
                }
            }

            if self.store().txn(txn).await?.succeeded {
                return Ok(());
            }
            // A membership key moved under us; rebuild from fresh reads.
        }
    }

    /// Remove a group, dropping it from every member's reverse index.
    pub async fn delete_group(&self, name: &str) -> Result<(), RegistryError> {
        loop {
            let members = self.get_group_members(name).await?;

            let mut txn = Txn::default();
            txn.then_ops.push(Op::Delete { key: keys::group(name) });

            for username in &members {
                let key = keys::membership(username);
                let Some(entry) = self.store().get(&key).await? else {
                    continue;
                };
                txn.compares.push(Compare::ModRevisionEquals {
                    key: key.clone(),
                    revision: entry.mod_revision,
                });

                let mut groups: Vec<String> = decode(&key, &entry.value)?;
                groups.retain(|g| g != name);
                if groups.is_empty() {
                    txn.then_ops.push(Op::Delete { key });
                } else {
                    txn.then_ops.push(Op::Put {
                        key,
                        value: encode(&groups),
                    });
                }
            }

            if self.store().txn(txn).await?.succeeded {
                return Ok(());
            }
        }
    }

    /// Add one user to a group (used when a registration token carries
    /// group memberships).
    pub async fn add_user_to_group(&self, username: &str, name: &str) -> Result<(), RegistryError> {
        loop {
            let mut members = self.get_group_members(name).await?;
            if !members.contains(&username.to_string()) {
                members.push(username.to_string());
            }

            let membership_key = keys::membership(username);
            let mut txn = Txn::default();

            let mut groups = match self.store().get(&membership_key).await? {
                Some(entry) => {
                    txn.compares.push(Compare::ModRevisionEquals {
                        key: membership_key.clone(),
                        revision: entry.mod_revision,
                    });
                    decode::<Vec<String>>(&membership_key, &entry.value)?
                }
                None => {
                    txn.compares.push(Compare::KeyMissing {
                        key: membership_key.clone(),
                    });
                    Vec::new()
                }
            };
            if !groups.contains(&name.to_string()) {
                groups.push(name.to_string());
            }

            txn.then_ops.push(Op::Put {
                key: keys::group(name),
                value: encode(&members),
            });
            txn.then_ops.push(Op::Put {
                key: membership_key,
                value: encode(&groups),
            });

            if self.store().txn(txn).await?.succeeded {
                return Ok(());
            }
        }
    }
}
