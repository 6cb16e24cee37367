//! Tunable settings stored under `wag-config-*` keys.
//!
//! Settings are written as individually keyed JSON scalars so that watches
//! can target a single value (the reconciler watches the inactivity timeout
//! alone). Writes validate the whole struct first and then commit every key
//! in one transaction.

use std::net::IpAddr;
use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// OIDC verifier configuration, recorded for the external authenticator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Oidc {
    #[serde(default)]
    pub issuer_url: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_groups_claim")]
    pub groups_claim_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_username_claim: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

fn default_groups_claim() -> String {
    "groups".to_string()
}

/// PAM verifier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pam {
    #[serde(default)]
    pub service_name: String,
}

/// Relying-party details derived from the issuer and domain settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Webauthn {
    pub display_name: String,
    pub id: String,
    pub origin: String,
}

/// A settings struct failed validation; nothing was written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct SettingsError {
    pub field: &'static str,
    pub reason: String,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError {
        field,
        reason: reason.into(),
    }
}

/// Authentication-related settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginSettings {
    pub session_inactivity_timeout_minutes: i64,
    pub max_session_lifetime_minutes: i64,
    pub lockout: u32,
    pub default_mfa_method: String,
    pub enabled_mfa_methods: Vec<String>,
    pub domain: String,
    pub issuer: String,
    #[serde(default)]
    pub oidc_details: Oidc,
    #[serde(default)]
    pub pam_details: Pam,
}

/// Upper bound on the enabled-methods list.
pub const MAX_MFA_METHODS: usize = 10;

impl LoginSettings {
    /// Trim and validate; must pass before any key is written.
    pub fn validate(&mut self) -> Result<(), SettingsError> {
        self.domain = self.domain.trim().to_string();
        self.issuer = self.issuer.trim().to_string();

        if self.session_inactivity_timeout_minutes <= 0 {
            return Err(invalid("session_inactivity_timeout_minutes", "must be a positive integer"));
        }
        if self.max_session_lifetime_minutes <= 0 {
            return Err(invalid("max_session_lifetime_minutes", "must be a positive integer"));
        }
        if self.lockout == 0 {
            return Err(invalid("lockout", "must be a positive integer"));
        }
        if self.default_mfa_method.is_empty() {
            return Err(invalid("default_mfa_method", "must be set"));
        }
        if self.enabled_mfa_methods.is_empty() {
            return Err(invalid("enabled_mfa_methods", "must list at least one method"));
        }
        if self.enabled_mfa_methods.len() > MAX_MFA_METHODS {
            return Err(invalid("enabled_mfa_methods", "too many methods"));
        }
        if self.enabled_mfa_methods.iter().any(|m| m.is_empty()) {
            return Err(invalid("enabled_mfa_methods", "methods must be non-empty"));
        }
        if self.domain.is_empty() {
            return Err(invalid("domain", "must be set"));
        }
        if self.issuer.is_empty() {
            return Err(invalid("issuer", "must be set"));
        }
        Ok(())
    }
}

/// General (non-authentication) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralSettings {
    pub help_mail: String,
    pub external_address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    pub wireguard_config_filename: String,
    #[serde(default)]
    pub check_updates: bool,
}

impl GeneralSettings {
    /// Trim and validate; must pass before any key is written.
    pub fn validate(&mut self) -> Result<(), SettingsError> {
        self.help_mail = self.help_mail.trim().to_string();
        self.external_address = self.external_address.trim().to_string();
        self.wireguard_config_filename = self.wireguard_config_filename.trim().to_string();
        for entry in &mut self.dns {
            *entry = entry.trim().to_string();
        }

        if !is_email(&self.help_mail) {
            return Err(invalid("help_mail", "must be an email address"));
        }
        if !is_host_or_addr(&self.external_address) {
            return Err(invalid("external_address", "must be a hostname, host:port, or IP"));
        }
        for entry in &self.dns {
            if entry.parse::<IpAddr>().is_err() {
                return Err(invalid("dns", format!("'{entry}' is not an IP address")));
            }
        }
        if self.wireguard_config_filename.is_empty() {
            return Err(invalid("wireguard_config_filename", "must be set"));
        }
        Ok(())
    }
}

/// Every setting, read in one multi-get transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllSettings {
    #[serde(flatten)]
    pub login: LoginSettings,
    #[serde(flatten)]
    pub general: GeneralSettings,
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty() && !domain.is_empty() && !domain.starts_with('.') && !domain.ends_with('.') && is_hostname(domain)
}

fn is_hostname(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn is_host_or_addr(value: &str) -> bool {
    if value.parse::<IpAddr>().is_ok() || value.parse::<SocketAddr>().is_ok() {
        return true;
    }
    if let Some((host, port)) = value.rsplit_once(':') {
        if port.parse::<u16>().is_ok() && is_hostname(host) {
            return true;
        }
    }
    is_hostname(value)
}
