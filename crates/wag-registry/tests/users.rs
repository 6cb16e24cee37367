//! User accounts and authorisation recording.

use std::sync::Arc;

use wag_core::MfaType;
use wag_registry::Registry;
use wag_registry::RegistryError;
use wag_store::MemoryStore;

fn registry() -> Arc<Registry> {
    Registry::new(MemoryStore::new(), 7)
}

async fn seed_lockout(registry: &Registry, lockout: u32) {
    registry.set_setting(wag_core::keys::LOCKOUT_KEY, &lockout).await.unwrap();
}

#[tokio::test]
async fn user_lifecycle() {
    let registry = registry();
    registry.create_user("alice").await.unwrap();

    let duplicate = registry.create_user("alice").await;
    assert!(matches!(duplicate, Err(RegistryError::AlreadyExists { .. })));

    registry.set_user_mfa("alice", "otpauth://secret", MfaType::Totp).await.unwrap();
    registry.set_enforce_mfa_on("alice").await.unwrap();

    let user = registry.get_user("alice").await.unwrap();
    assert_eq!(user.mfa_type, MfaType::Totp);
    assert!(user.enforcing);
    assert!(registry.is_enforcing("alice").await.unwrap());
    assert_eq!(registry.get_user_mfa("alice").await.unwrap(), "otpauth://secret");

    // Switching the method keeps the secret until the next enrolment.
    registry.set_mfa_type("alice", MfaType::Webauthn).await.unwrap();
    let user = registry.get_user("alice").await.unwrap();
    assert_eq!(user.mfa_type, MfaType::Webauthn);
    assert_eq!(user.mfa, "otpauth://secret");

    registry.reset_user_mfa("alice").await.unwrap();
    let user = registry.get_user("alice").await.unwrap();
    assert_eq!(user.mfa_type, MfaType::Unset);
    assert!(user.mfa.is_empty());
    // Enforcement survives an MFA reset; the user re-enrols.
    assert!(user.enforcing);
}

#[tokio::test]
async fn mutating_an_unknown_user_is_not_found() {
    let registry = registry();
    let result = registry.set_user_lock("ghost").await;
    assert!(matches!(result, Err(RegistryError::NotFound { entity: "user", .. })));
}

#[tokio::test]
async fn authorisation_records_the_local_node() {
    let registry = registry();
    seed_lockout(&registry, 5).await;
    registry.create_user("alice").await.unwrap();
    registry.set_user_mfa("alice", "s", MfaType::Totp).await.unwrap();
    registry.set_enforce_mfa_on("alice").await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    registry.authorise_device("alice", "10.0.0.5").await.unwrap();

    let device = registry.get_device("alice", "10.0.0.5").await.unwrap();
    assert!(device.is_authorised());
    assert_eq!(device.associated_node, Some(7));
}

#[tokio::test]
async fn authorisation_is_denied_for_locked_or_unenrolled_accounts() {
    let registry = registry();
    seed_lockout(&registry, 5).await;
    registry.create_user("alice").await.unwrap();
    registry.set_enforce_mfa_on("alice").await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    // Enforcing with no MFA method configured.
    let unenrolled = registry.authorise_device("alice", "10.0.0.5").await;
    assert!(matches!(unenrolled, Err(RegistryError::AuthDenied { .. })));

    registry.set_user_mfa("alice", "s", MfaType::Totp).await.unwrap();
    registry.set_user_lock("alice").await.unwrap();
    let locked = registry.authorise_device("alice", "10.0.0.5").await;
    assert!(matches!(locked, Err(RegistryError::AuthDenied { .. })));
}

#[tokio::test]
async fn authorisation_is_denied_past_the_lockout() {
    let registry = registry();
    seed_lockout(&registry, 3).await;
    registry.create_user("alice").await.unwrap();
    registry.set_user_mfa("alice", "s", MfaType::Totp).await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();
    registry.set_device_authentication_attempts("alice", "10.0.0.5", 4).await.unwrap();

    let locked_out = registry.authorise_device("alice", "10.0.0.5").await;
    assert!(matches!(locked_out, Err(RegistryError::AuthDenied { .. })));

    // A successful authorisation resets the failure counter.
    registry.set_device_authentication_attempts("alice", "10.0.0.5", 2).await.unwrap();
    registry.authorise_device("alice", "10.0.0.5").await.unwrap();
    assert_eq!(registry.get_device("alice", "10.0.0.5").await.unwrap().attempts, 0);
}

#[tokio::test]
async fn admin_accounts_lock_past_the_attempt_threshold() {
    let registry = registry();
    registry.create_admin_user("root", "argon2-hash").await.unwrap();

    for _ in 0..5 {
        registry.increment_admin_attempts("root").await.unwrap();
    }
    assert!(!registry.get_admin_user("root").await.unwrap().locked);

    registry.increment_admin_attempts("root").await.unwrap();
    assert!(registry.get_admin_user("root").await.unwrap().locked);

    registry.set_admin_unlock("root").await.unwrap();
    let admin = registry.get_admin_user("root").await.unwrap();
    assert!(!admin.locked);
    assert_eq!(admin.attempts, 0);
}
