//! Entities stored in the replicated configuration plane.
//!
//! Every entity serializes as JSON under the key namespace defined in
//! [`crate::keys`]. These are wire types: adding a field requires a serde
//! default so older values still decode.

use std::net::SocketAddr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// A registered WireGuard peer owned by a user.
///
/// The device primary lives at `devices-<username>-<address>`; two reference
/// keys (`deviceref-<address>`, `deviceref-<publickey>`) each hold the
/// primary key string and move atomically with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Assigned tunnel address, unique across the cluster.
    pub address: String,
    /// WireGuard public key, unique across the cluster.
    pub public_key: String,
    /// Preshared key handed to the dataplane on peer creation.
    #[serde(default)]
    pub preshared_key: String,
    /// Owning account.
    pub username: String,
    /// Last observed UDP remote of the peer.
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    /// Consecutive failed authentications since the last success.
    #[serde(default)]
    pub attempts: u32,
    /// When the current session was authorised; `None` means unauthorised.
    #[serde(default)]
    pub authorised: Option<DateTime<Utc>>,
    /// Id of the cluster node that last authorised this device.
    #[serde(default)]
    pub associated_node: Option<u64>,
}

impl Device {
    /// Whether the device currently holds an authorised session.
    pub fn is_authorised(&self) -> bool {
        self.authorised.is_some()
    }
}

/// Second-factor method configured for a user.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MfaType {
    /// No method configured; the user must enrol before authorising.
    #[default]
    Unset,
    Totp,
    Webauthn,
    Oidc,
    Pam,
}

/// Account metadata for a tunnel user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: String,
    /// Opaque per-method secret blob (TOTP url, webauthn credential, ...).
    #[serde(default)]
    pub mfa: String,
    #[serde(default)]
    pub mfa_type: MfaType,
    /// Whether MFA is required before a session may be authorised.
    #[serde(default)]
    pub enforcing: bool,
    #[serde(default)]
    pub locked: bool,
}

/// Separate account for the admin web UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminUser {
    pub username: String,
    /// Password hash; never a plaintext secret.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub locked: bool,
}

/// Failed-login threshold past which an admin account locks itself.
pub const ADMIN_LOCKOUT_ATTEMPTS: u32 = 5;

/// Single- or multi-use enrolment credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationToken {
    pub token: String,
    pub username: String,
    /// Address of an existing device whose key this enrolment rotates.
    #[serde(default)]
    pub overwrites: Option<String>,
    /// Group memberships applied when the token is used.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Remaining uses; the token is deleted when this reaches zero.
    pub num_uses: u32,
}

/// Per-user firewall policy.
///
/// `mfa` destinations require an authorised session, `allow` destinations
/// are reachable without one, and `deny` subtracts from both. Entries are
/// `cidr` or `cidr:port` strings interpreted by the dataplane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acl {
    #[serde(default)]
    pub mfa: Vec<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Acl {
    /// Fold another policy into this one, deduplicating entries.
    pub fn merge(&mut self, other: &Acl) {
        for (mine, theirs) in [
            (&mut self.mfa, &other.mfa),
            (&mut self.allow, &other.allow),
            (&mut self.deny, &other.deny),
        ] {
            for entry in theirs {
                if !mine.contains(entry) {
                    mine.push(entry.clone());
                }
            }
        }
    }

    /// Remove every `mfa`/`allow` entry that the `deny` list revokes.
    ///
    /// Run after all policies are merged so a deny contributed by any
    /// source wins over a grant from another. The deny list itself is kept
    /// for the dataplane, which also subtracts at the packet level.
    pub fn subtract_deny(&mut self) {
        let deny = std::mem::take(&mut self.deny);
        self.mfa.retain(|entry| !deny.contains(entry));
        self.allow.retain(|entry| !deny.contains(entry));
        self.deny = deny;
    }

    pub fn is_empty(&self) -> bool {
        self.mfa.is_empty() && self.allow.is_empty() && self.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_default_is_unauthorised() {
        let device = Device::default();
        assert!(!device.is_authorised());
        assert_eq!(device.attempts, 0);
    }

    #[test]
    fn device_roundtrips_through_json() {
        let device = Device {
            address: "10.0.0.5".into(),
            public_key: "KA==".into(),
            preshared_key: "psk".into(),
            username: "alice".into(),
            endpoint: Some("203.0.113.9:51820".parse().unwrap()),
            attempts: 2,
            authorised: Some(Utc::now()),
            associated_node: Some(1),
        };
        let encoded = serde_json::to_string(&device).unwrap();
        let decoded: Device = serde_json::from_str(&encoded).unwrap();
        assert_eq!(device, decoded);
    }

    #[test]
    fn mfa_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MfaType::Webauthn).unwrap(), "\"webauthn\"");
        assert_eq!(serde_json::from_str::<MfaType>("\"unset\"").unwrap(), MfaType::Unset);
    }

    #[test]
    fn old_device_value_without_new_fields_decodes() {
        // Values written before endpoint/attempts existed must still decode.
        let decoded: Device = serde_json::from_str(
            r#"{"address":"10.0.0.1","public_key":"K=","username":"bob"}"#,
        )
        .unwrap();
        assert_eq!(decoded.username, "bob");
        assert!(decoded.endpoint.is_none());
        assert!(decoded.authorised.is_none());
    }

    #[test]
    fn deny_entries_revoke_matching_grants() {
        let mut acl = Acl {
            mfa: vec!["10.1.0.0/16".into(), "10.2.0.0/16".into()],
            allow: vec!["192.168.1.1:53".into()],
            deny: vec!["10.2.0.0/16".into(), "192.168.1.1:53".into()],
        };
        acl.subtract_deny();
        assert_eq!(acl.mfa, vec!["10.1.0.0/16".to_string()]);
        assert!(acl.allow.is_empty());
        assert_eq!(acl.deny, vec!["10.2.0.0/16".to_string(), "192.168.1.1:53".to_string()]);
    }

    #[test]
    fn acl_merge_deduplicates() {
        let mut acl = Acl {
            mfa: vec!["10.1.0.0/16".into()],
            allow: vec![],
            deny: vec![],
        };
        acl.merge(&Acl {
            mfa: vec!["10.1.0.0/16".into(), "10.2.0.0/16".into()],
            allow: vec!["192.168.1.1:53".into()],
            deny: vec![],
        });
        assert_eq!(acl.mfa, vec!["10.1.0.0/16".to_string(), "10.2.0.0/16".to_string()]);
        assert_eq!(acl.allow, vec!["192.168.1.1:53".to_string()]);
    }
}
