//! Settings reads, writes, and validation gating.

use std::sync::Arc;

use wag_core::keys;
use wag_core::GeneralSettings;
use wag_core::LoginSettings;
use wag_registry::Registry;
use wag_registry::RegistryError;
use wag_store::MemoryStore;

fn registry() -> Arc<Registry> {
    Registry::new(MemoryStore::new(), 1)
}

fn login_settings() -> LoginSettings {
    LoginSettings {
        session_inactivity_timeout_minutes: 15,
        max_session_lifetime_minutes: 240,
        lockout: 5,
        default_mfa_method: "totp".into(),
        enabled_mfa_methods: vec!["totp".into(), "oidc".into()],
        domain: "https://vpn.example.com".into(),
        issuer: "example".into(),
        ..LoginSettings::default()
    }
}

fn general_settings() -> GeneralSettings {
    GeneralSettings {
        help_mail: "help@example.com".into(),
        external_address: "vpn.example.com".into(),
        dns: vec!["1.1.1.1".into()],
        wireguard_config_filename: "wg0.conf".into(),
        check_updates: true,
    }
}

#[tokio::test]
async fn settings_roundtrip_through_the_bulk_read() {
    let registry = registry();
    registry.set_login_settings(login_settings()).await.unwrap();
    registry.set_general_settings(general_settings()).await.unwrap();

    let all = registry.get_all_settings().await.unwrap();
    assert_eq!(all.login.lockout, 5);
    assert_eq!(all.login.session_inactivity_timeout_minutes, 15);
    assert_eq!(all.login.enabled_mfa_methods, vec!["totp".to_string(), "oidc".to_string()]);
    assert_eq!(all.general.help_mail, "help@example.com");
    assert_eq!(all.general.dns, vec!["1.1.1.1".to_string()]);
    assert!(all.general.check_updates);

    assert_eq!(registry.get_lockout().await.unwrap(), 5);
    assert_eq!(registry.get_session_inactivity_timeout_minutes().await.unwrap(), 15);
}

#[tokio::test]
async fn invalid_settings_commit_nothing() {
    let registry = registry();
    registry.set_login_settings(login_settings()).await.unwrap();

    let mut bad = login_settings();
    bad.lockout = 0;
    bad.session_inactivity_timeout_minutes = 99;
    let result = registry.set_login_settings(bad).await;
    assert!(matches!(result, Err(RegistryError::Validation(_))));

    // The atomic commit never ran: old values remain.
    assert_eq!(registry.get_lockout().await.unwrap(), 5);
    assert_eq!(registry.get_session_inactivity_timeout_minutes().await.unwrap(), 15);
}

#[tokio::test]
async fn scalar_reads_require_exactly_one_key() {
    let registry = registry();
    let missing = registry.get_lockout().await;
    assert!(matches!(missing, Err(RegistryError::NotFound { .. })));
}

#[tokio::test]
async fn scalar_setters_roundtrip() {
    let registry = registry();

    registry.set_help_mail("support@example.com").await.unwrap();
    assert_eq!(registry.get_help_mail().await, "support@example.com");

    registry.set_dns(&["1.1.1.1".to_string(), "8.8.8.8".to_string()]).await.unwrap();
    assert_eq!(registry.get_dns().await.unwrap().len(), 2);

    registry.set_external_address("vpn.example.com:51820").await.unwrap();
    assert_eq!(registry.get_external_address().await.unwrap(), "vpn.example.com:51820");

    registry.set_default_mfa_method("webauthn").await.unwrap();
    assert_eq!(registry.get_default_mfa_method().await.unwrap(), "webauthn");
}

#[tokio::test]
async fn webauthn_details_derive_from_issuer_and_domain() {
    let registry = registry();
    registry.set_issuer("example").await.unwrap();
    registry.set_domain("https://vpn.example.com:8443/tunnel").await.unwrap();

    let webauthn = registry.get_webauthn().await.unwrap();
    assert_eq!(webauthn.display_name, "example");
    assert_eq!(webauthn.id, "vpn.example.com");
    assert_eq!(webauthn.origin, "https://vpn.example.com:8443/tunnel");
}

#[tokio::test]
async fn wireguard_config_name_falls_back() {
    let registry = registry();
    assert_eq!(registry.get_wireguard_config_name().await, "wg0.conf");

    registry.set_setting(keys::WG_FILENAME_KEY, &"office.conf".to_string()).await.unwrap();
    assert_eq!(registry.get_wireguard_config_name().await, "office.conf");
}
