//! Registration token repository.
//!
//! Tokens are single- or multi-use enrolment credentials. Consumption is a
//! compare-and-swap loop: the transaction that records the final decrement
//! also deletes the key, so a spent token can never authorise another
//! enrolment.

use rand::distributions::Alphanumeric;
use rand::Rng;
use wag_core::keys;
use wag_core::Device;
use wag_core::RegistrationToken;
use wag_store::Compare;
use wag_store::Op;
use wag_store::OpResult;
use wag_store::SortOrder;
use wag_store::Txn;

use crate::decode;
use crate::encode;
use crate::Registry;
use crate::RegistryError;

const GENERATED_TOKEN_LEN: usize = 32;

impl Registry {
    pub async fn add_registration_token(
        &self,
        token: &str,
        username: &str,
        overwrites: Option<String>,
        groups: Vec<String>,
        num_uses: u32,
    ) -> Result<RegistrationToken, RegistryError> {
        if !keys::is_valid_token(token) {
            return Err(RegistryError::Validation(format!(
                "token '{token}' contains characters outside [A-Za-z0-9_.-]"
            )));
        }
        if username.is_empty() {
            return Err(RegistryError::Validation("token username must not be empty".into()));
        }
        if num_uses == 0 {
            return Err(RegistryError::Validation("token must have at least one use".into()));
        }

        let record = RegistrationToken {
            token: token.to_string(),
            username: username.to_string(),
            overwrites,
            groups,
            num_uses,
        };
        let key = keys::token(token);

        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![Compare::KeyMissing { key: key.clone() }],
                then_ops: vec![Op::Put {
                    key,
                    value: encode(&record),
                }],
                else_ops: vec![],
            })
            .await?;

        if !outcome.succeeded {
            return Err(RegistryError::AlreadyExists {
                entity: "registration token",
                id: token.to_string(),
            });
        }
        Ok(record)
    }

    /// Mint a random token for a user.
    pub async fn generate_registration_token(
        &self,
        username: &str,
        overwrites: Option<String>,
        groups: Vec<String>,
        num_uses: u32,
    ) -> Result<RegistrationToken, RegistryError> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_TOKEN_LEN)
            .map(char::from)
            .collect();
        self.add_registration_token(&token, username, overwrites, groups, num_uses).await
    }

    pub async fn get_registration_token(&self, token: &str) -> Result<RegistrationToken, RegistryError> {
        self.get_json(&keys::token(token)).await.map_err(|err| match err {
            RegistryError::NotFound { .. } => RegistryError::NotFound {
                entity: "registration token",
                id: token.to_string(),
            },
            other => other,
        })
    }

    pub async fn get_registration_tokens(&self) -> Result<Vec<RegistrationToken>, RegistryError> {
        let entries = self.store().list(keys::TOKENS_PREFIX, SortOrder::Descending).await?;
        entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    pub async fn delete_registration_token(&self, token: &str) -> Result<(), RegistryError> {
        self.store().delete(&keys::token(token)).await?;
        Ok(())
    }

    /// Consume one use of a token.
    ///
    /// Returns the token record as it was before the decrement. Once
    /// `num_uses` hits zero the key is removed in the same transaction, so
    /// the (k+1)th caller of a k-use token observes `NotFound`.
    pub async fn use_registration_token(&self, token: &str) -> Result<RegistrationToken, RegistryError> {
        let key = keys::token(token);

        let mut current = self.store().get(&key).await?;
        loop {
            let entry = current.ok_or_else(|| RegistryError::NotFound {
                entity: "registration token",
                id: token.to_string(),
            })?;
            let record: RegistrationToken = decode(&key, &entry.value)?;

            let write = if record.num_uses <= 1 {
                Op::Delete { key: key.clone() }
            } else {
                let mut decremented = record.clone();
                decremented.num_uses -= 1;
                Op::Put {
                    key: key.clone(),
                    value: encode(&decremented),
                }
            };

            let outcome = self
                .store()
                .txn(Txn {
                    compares: vec![Compare::ModRevisionEquals {
                        key: key.clone(),
                        revision: entry.mod_revision,
                    }],
                    then_ops: vec![write],
                    else_ops: vec![Op::Get { key: key.clone() }],
                })
                .await?;

            if outcome.succeeded {
                return Ok(record);
            }

            current = match outcome.results.first() {
                Some(OpResult::Kvs { entries }) => entries.first().cloned(),
                _ => None,
            };
        }
    }

    /// Complete an enrolment: consume the token, make sure the account
    /// exists, create the device (or rotate the overwritten device's key),
    /// and apply the token's group memberships.
    pub async fn finalise_registration(
        &self,
        token: &str,
        address: &str,
        public_key: &str,
        preshared_key: &str,
    ) -> Result<Device, RegistryError> {
        let record = self.use_registration_token(token).await?;

        match self.create_user(&record.username).await {
            Ok(_) => {}
            Err(RegistryError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        let device = match &record.overwrites {
            Some(existing_address) => {
                self.update_device_public_key(&record.username, existing_address, public_key).await?;
                self.get_device(&record.username, existing_address).await?
            }
            None => {
                self.add_device(&record.username, address, public_key, preshared_key).await?
            }
        };

        for group in &record.groups {
            self.add_user_to_group(&record.username, group).await?;
        }

        Ok(device)
    }
}
