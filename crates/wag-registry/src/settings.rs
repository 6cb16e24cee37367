//! Settings accessors.
//!
//! Each setting is an individually keyed JSON scalar. Bulk reads go
//! through one multi-get transaction; bulk writes validate the full struct
//! first and then commit every key atomically.

use wag_core::decode_one;
use wag_core::keys;
use wag_core::AllSettings;
use wag_core::GeneralSettings;
use wag_core::LoginSettings;
use wag_core::Oidc;
use wag_core::Pam;
use wag_core::Webauthn;
use wag_store::Op;
use wag_store::OpResult;
use wag_store::Txn;

use crate::encode;
use crate::Registry;
use crate::RegistryError;

/// Key order of the bulk settings read.
const ALL_SETTINGS_KEYS: [&str; 14] = [
    keys::HELP_MAIL_KEY,
    keys::EXTERNAL_ADDRESS_KEY,
    keys::INACTIVITY_TIMEOUT_KEY,
    keys::SESSION_LIFETIME_KEY,
    keys::LOCKOUT_KEY,
    keys::DNS_KEY,
    keys::ISSUER_KEY,
    keys::DOMAIN_KEY,
    keys::DEFAULT_MFA_METHOD_KEY,
    keys::MFA_METHODS_KEY,
    keys::CHECK_UPDATES_KEY,
    keys::OIDC_DETAILS_KEY,
    keys::PAM_DETAILS_KEY,
    keys::WG_FILENAME_KEY,
];

impl Registry {
    /// Read a single typed setting; exactly one key must match.
    pub async fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, RegistryError> {
        let values: Vec<String> = self
            .store()
            .get(key)
            .await?
            .map(|entry| vec![entry.value])
            .unwrap_or_default();
        Ok(decode_one(key, &values)?)
    }

    pub async fn set_setting<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        self.put_json(key, value).await
    }

    pub async fn get_lockout(&self) -> Result<u32, RegistryError> {
        self.get_setting(keys::LOCKOUT_KEY).await
    }

    pub async fn get_session_inactivity_timeout_minutes(&self) -> Result<i64, RegistryError> {
        self.get_setting(keys::INACTIVITY_TIMEOUT_KEY).await
    }

    pub async fn set_session_inactivity_timeout_minutes(&self, minutes: i64) -> Result<(), RegistryError> {
        self.set_setting(keys::INACTIVITY_TIMEOUT_KEY, &minutes).await
    }

    pub async fn get_session_lifetime_minutes(&self) -> Result<i64, RegistryError> {
        self.get_setting(keys::SESSION_LIFETIME_KEY).await
    }

    pub async fn set_session_lifetime_minutes(&self, minutes: i64) -> Result<(), RegistryError> {
        self.set_setting(keys::SESSION_LIFETIME_KEY, &minutes).await
    }

    pub async fn get_issuer(&self) -> Result<String, RegistryError> {
        self.get_setting(keys::ISSUER_KEY).await
    }

    pub async fn set_issuer(&self, issuer: &str) -> Result<(), RegistryError> {
        self.set_setting(keys::ISSUER_KEY, &issuer).await
    }

    pub async fn get_domain(&self) -> Result<String, RegistryError> {
        self.get_setting(keys::DOMAIN_KEY).await
    }

    pub async fn set_domain(&self, domain: &str) -> Result<(), RegistryError> {
        self.set_setting(keys::DOMAIN_KEY, &domain).await
    }

    pub async fn get_dns(&self) -> Result<Vec<String>, RegistryError> {
        self.get_setting(keys::DNS_KEY).await
    }

    pub async fn set_dns(&self, dns: &[String]) -> Result<(), RegistryError> {
        self.set_setting(keys::DNS_KEY, &dns).await
    }

    pub async fn get_external_address(&self) -> Result<String, RegistryError> {
        self.get_setting(keys::EXTERNAL_ADDRESS_KEY).await
    }

    pub async fn set_external_address(&self, address: &str) -> Result<(), RegistryError> {
        self.set_setting(keys::EXTERNAL_ADDRESS_KEY, &address).await
    }

    /// Help contact shown on error pages; falls back rather than failing.
    pub async fn get_help_mail(&self) -> String {
        self.get_setting(keys::HELP_MAIL_KEY).await.unwrap_or_else(|_| "Server Error".to_string())
    }

    pub async fn set_help_mail(&self, mail: &str) -> Result<(), RegistryError> {
        self.set_setting(keys::HELP_MAIL_KEY, &mail).await
    }

    pub async fn get_default_mfa_method(&self) -> Result<String, RegistryError> {
        self.get_setting(keys::DEFAULT_MFA_METHOD_KEY).await
    }

    pub async fn set_default_mfa_method(&self, method: &str) -> Result<(), RegistryError> {
        self.set_setting(keys::DEFAULT_MFA_METHOD_KEY, &method).await
    }

    pub async fn get_enabled_mfa_methods(&self) -> Result<Vec<String>, RegistryError> {
        self.get_setting(keys::MFA_METHODS_KEY).await
    }

    pub async fn set_enabled_mfa_methods(&self, methods: &[String]) -> Result<(), RegistryError> {
        self.set_setting(keys::MFA_METHODS_KEY, &methods).await
    }

    pub async fn get_oidc(&self) -> Result<Oidc, RegistryError> {
        self.get_setting(keys::OIDC_DETAILS_KEY).await
    }

    pub async fn set_oidc(&self, oidc: &Oidc) -> Result<(), RegistryError> {
        self.set_setting(keys::OIDC_DETAILS_KEY, oidc).await
    }

    pub async fn get_pam(&self) -> Result<Pam, RegistryError> {
        self.get_setting(keys::PAM_DETAILS_KEY).await
    }

    pub async fn set_pam(&self, pam: &Pam) -> Result<(), RegistryError> {
        self.set_setting(keys::PAM_DETAILS_KEY, pam).await
    }

    pub async fn should_check_updates(&self) -> Result<bool, RegistryError> {
        self.get_setting(keys::CHECK_UPDATES_KEY).await
    }

    /// Filename offered for client config downloads; defaults when unset.
    pub async fn get_wireguard_config_name(&self) -> String {
        match self.get_setting::<String>(keys::WG_FILENAME_KEY).await {
            Ok(name) if !name.is_empty() => name,
            _ => "wg0.conf".to_string(),
        }
    }

    /// Relying-party details derived from the issuer and domain settings.
    pub async fn get_webauthn(&self) -> Result<Webauthn, RegistryError> {
        let issuer = self.get_issuer().await?;
        let domain = self.get_domain().await?;

        let origin = domain.clone();
        let host = domain
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default();
        let id = host.split(':').next().unwrap_or_default().to_string();

        Ok(Webauthn {
            display_name: issuer,
            id,
            origin,
        })
    }

    /// Read every setting in one transaction. Missing keys keep their
    /// zero value, matching a partially seeded store.
    pub async fn get_all_settings(&self) -> Result<AllSettings, RegistryError> {
        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![],
                then_ops: ALL_SETTINGS_KEYS
                    .iter()
                    .map(|key| Op::Get { key: key.to_string() })
                    .collect(),
                else_ops: vec![],
            })
            .await?;

        let mut settings = AllSettings::default();
        for (index, key) in ALL_SETTINGS_KEYS.iter().enumerate() {
            let Some(OpResult::Kvs { entries }) = outcome.results.get(index) else {
                continue;
            };
            let Some(entry) = entries.first() else {
                continue;
            };
            let value = &entry.value;
            match *key {
                keys::HELP_MAIL_KEY => settings.general.help_mail = crate::decode(key, value)?,
                keys::EXTERNAL_ADDRESS_KEY => settings.general.external_address = crate::decode(key, value)?,
                keys::INACTIVITY_TIMEOUT_KEY => {
                    settings.login.session_inactivity_timeout_minutes = crate::decode(key, value)?
                }
                keys::SESSION_LIFETIME_KEY => settings.login.max_session_lifetime_minutes = crate::decode(key, value)?,
                keys::LOCKOUT_KEY => settings.login.lockout = crate::decode(key, value)?,
                keys::DNS_KEY => settings.general.dns = crate::decode(key, value)?,
                keys::ISSUER_KEY => settings.login.issuer = crate::decode(key, value)?,
                keys::DOMAIN_KEY => settings.login.domain = crate::decode(key, value)?,
                keys::DEFAULT_MFA_METHOD_KEY => settings.login.default_mfa_method = crate::decode(key, value)?,
                keys::MFA_METHODS_KEY => settings.login.enabled_mfa_methods = crate::decode(key, value)?,
                keys::CHECK_UPDATES_KEY => settings.general.check_updates = crate::decode(key, value)?,
                keys::OIDC_DETAILS_KEY => settings.login.oidc_details = crate::decode(key, value)?,
                keys::PAM_DETAILS_KEY => settings.login.pam_details = crate::decode(key, value)?,
                keys::WG_FILENAME_KEY => settings.general.wireguard_config_filename = crate::decode(key, value)?,
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Validate and atomically commit the authentication settings.
    pub async fn set_login_settings(&self, mut settings: LoginSettings) -> Result<(), RegistryError> {
        settings.validate()?;

        let then_ops = vec![
            Op::Put {
                key: keys::INACTIVITY_TIMEOUT_KEY.to_string(),
                value: encode(&settings.session_inactivity_timeout_minutes),
            },
            Op::Put {
                key: keys::SESSION_LIFETIME_KEY.to_string(),
                value: encode(&settings.max_session_lifetime_minutes),
            },
            Op::Put {
                key: keys::LOCKOUT_KEY.to_string(),
                value: encode(&settings.lockout),
            },
            Op::Put {
                key: keys::DEFAULT_MFA_METHOD_KEY.to_string(),
                value: encode(&settings.default_mfa_method),
            },
            Op::Put {
                key: keys::MFA_METHODS_KEY.to_string(),
                value: encode(&settings.enabled_mfa_methods),
            },
            Op::Put {
                key: keys::DOMAIN_KEY.to_string(),
                value: encode(&settings.domain),
            },
            Op::Put {
                key: keys::ISSUER_KEY.to_string(),
                value: encode(&settings.issuer),
            },
            Op::Put {
                key: keys::OIDC_DETAILS_KEY.to_string(),
                value: encode(&settings.oidc_details),
            },
            Op::Put {
                key: keys::PAM_DETAILS_KEY.to_string(),
                value: encode(&settings.pam_details),
            },
        ];

        self.store()
            .txn(Txn {
                compares: vec![],
                then_ops,
                else_ops: vec![],
            })
            .await?;
        Ok(())
    }

    /// Validate and atomically commit the general settings.
    pub async fn set_general_settings(&self, mut settings: GeneralSettings) -> Result<(), RegistryError> {
        settings.validate()?;

        let then_ops = vec![
            Op::Put {
                key: keys::HELP_MAIL_KEY.to_string(),
                value: encode(&settings.help_mail),
            },
            Op::Put {
                key: keys::EXTERNAL_ADDRESS_KEY.to_string(),
                value: encode(&settings.external_address),
            },
            Op::Put {
                key: keys::DNS_KEY.to_string(),
                value: encode(&settings.dns),
            },
            Op::Put {
                key: keys::WG_FILENAME_KEY.to_string(),
                value: encode(&settings.wireguard_config_filename),
            },
            Op::Put {
                key: keys::CHECK_UPDATES_KEY.to_string(),
                value: encode(&settings.check_updates),
            },
        ];

        self.store()
            .txn(Txn {
                compares: vec![],
                then_ops,
                else_ops: vec![],
            })
            .await?;
        Ok(())
    }
}
