//! Key namespace of the configuration plane.
//!
//! All prefixes and key builders live here so the layout has a single
//! owner. Reference keys (`deviceref-`) store the primary key string; the
//! primary is always the source of truth and reference keys are derivable
//! from it.

/// Device primaries, `devices-<username>-<address>`.
pub const DEVICES_PREFIX: &str = "devices-";
/// Device lookup references, `deviceref-<address|publickey>`.
pub const DEVICE_REF_PREFIX: &str = "deviceref-";
/// User accounts, `users-<username>`.
pub const USERS_PREFIX: &str = "users-";
/// Admin UI accounts, `admin-users-<username>`.
pub const ADMIN_USERS_PREFIX: &str = "admin-users-";
/// Registration tokens, `tokens-<token>`.
pub const TOKENS_PREFIX: &str = "tokens-";
/// Named ACL policies, `wag-acls-<name>`.
pub const ACLS_PREFIX: &str = "wag-acls-";
/// Group member lists, `wag-groups-<name>`.
pub const GROUPS_PREFIX: &str = "wag-groups-";
/// Reverse membership index, `wag-membership-<username>`.
pub const MEMBERSHIP_PREFIX: &str = "wag-membership-";
/// One-shot SQL import marker.
pub const MIGRATED_SQL_KEY: &str = "wag-migrated-sql";

/// Snapshot of the seed config taken on first start.
pub const FULL_CONFIG_KEY: &str = "wag-config-full";
pub const HELP_MAIL_KEY: &str = "wag-config-general-help-mail";
pub const WG_FILENAME_KEY: &str = "wag-config-general-wg-filename";
pub const CHECK_UPDATES_KEY: &str = "wag-config-general-check-updates";
pub const INACTIVITY_TIMEOUT_KEY: &str = "wag-config-authentication-inactivity-timeout";
pub const SESSION_LIFETIME_KEY: &str = "wag-config-authentication-max-session-lifetime";
pub const LOCKOUT_KEY: &str = "wag-config-authentication-lockout";
pub const ISSUER_KEY: &str = "wag-config-authentication-issuer";
pub const DOMAIN_KEY: &str = "wag-config-authentication-domain";
pub const MFA_METHODS_KEY: &str = "wag-config-authentication-methods";
pub const DEFAULT_MFA_METHOD_KEY: &str = "wag-config-authentication-default-method";
pub const OIDC_DETAILS_KEY: &str = "wag-config-authentication-oidc";
pub const PAM_DETAILS_KEY: &str = "wag-config-authentication-pam";
pub const EXTERNAL_ADDRESS_KEY: &str = "wag-config-network-external-address";
pub const DNS_KEY: &str = "wag-config-network-dns";

/// Primary key for a device.
pub fn device(username: &str, address: &str) -> String {
    format!("{DEVICES_PREFIX}{username}-{address}")
}

/// Prefix covering every device a user owns.
pub fn devices_of(username: &str) -> String {
    format!("{DEVICES_PREFIX}{username}-")
}

/// Reference key for a device address or public key.
pub fn device_ref(id: &str) -> String {
    format!("{DEVICE_REF_PREFIX}{id}")
}

pub fn user(username: &str) -> String {
    format!("{USERS_PREFIX}{username}")
}

pub fn admin_user(username: &str) -> String {
    format!("{ADMIN_USERS_PREFIX}{username}")
}

pub fn token(token: &str) -> String {
    format!("{TOKENS_PREFIX}{token}")
}

pub fn acl(name: &str) -> String {
    format!("{ACLS_PREFIX}{name}")
}

pub fn group(name: &str) -> String {
    format!("{GROUPS_PREFIX}{name}")
}

pub fn membership(username: &str) -> String {
    format!("{MEMBERSHIP_PREFIX}{username}")
}

/// Whether a string is usable as a registration token.
///
/// Token character class: `[A-Za-z0-9_.\-]`, non-empty.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}
