//! Registration token lifecycle.

use std::sync::Arc;

use wag_registry::Registry;
use wag_registry::RegistryError;
use wag_store::MemoryStore;

fn registry() -> Arc<Registry> {
    Registry::new(MemoryStore::new(), 1)
}

#[tokio::test]
async fn token_charset_is_enforced() {
    let registry = registry();
    for bad in ["", "has space", "semi;colon", "sl/ash"] {
        let result = registry.add_registration_token(bad, "alice", None, vec![], 1).await;
        assert!(matches!(result, Err(RegistryError::Validation(_))), "{bad:?} should be rejected");
    }
    registry.add_registration_token("abc-1._X", "alice", None, vec![], 1).await.unwrap();
}

#[tokio::test]
async fn duplicate_tokens_are_rejected() {
    let registry = registry();
    registry.add_registration_token("abc-1", "alice", None, vec![], 1).await.unwrap();
    let duplicate = registry.add_registration_token("abc-1", "bob", None, vec![], 1).await;
    assert!(matches!(duplicate, Err(RegistryError::AlreadyExists { .. })));
}

#[tokio::test]
async fn a_k_use_token_yields_exactly_k_uses() {
    let registry = registry();
    registry.add_registration_token("abc-1", "alice", None, vec![], 3).await.unwrap();

    for _ in 0..3 {
        let record = registry.use_registration_token("abc-1").await.unwrap();
        assert_eq!(record.username, "alice");
    }

    // The final decrement deleted the key in the same transaction.
    let spent = registry.use_registration_token("abc-1").await;
    assert!(matches!(spent, Err(RegistryError::NotFound { .. })));
    let gone = registry.get_registration_token("abc-1").await;
    assert!(matches!(gone, Err(RegistryError::NotFound { .. })));
}

#[tokio::test]
async fn concurrent_consumers_never_exceed_the_use_count() {
    let registry = registry();
    registry.add_registration_token("abc-1", "alice", None, vec![], 5).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.use_registration_token("abc-1").await.is_ok() }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 5);
}

#[tokio::test]
async fn enrolment_creates_user_device_and_group_memberships() {
    let registry = registry();
    registry
        .add_registration_token("abc-1", "alice", None, vec!["engineering".into()], 1)
        .await
        .unwrap();

    let device = registry.finalise_registration("abc-1", "10.0.0.5", "KA==", "psk").await.unwrap();
    assert_eq!(device.address, "10.0.0.5");
    assert_eq!(device.username, "alice");

    // Account exists, the device resolves, the group was applied.
    registry.get_user("alice").await.unwrap();
    registry.get_device_by_id("KA==").await.unwrap();
    assert_eq!(registry.get_user_groups("alice").await.unwrap(), vec!["engineering".to_string()]);
    assert_eq!(registry.get_group_members("engineering").await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn enrolment_with_overwrites_rotates_the_existing_device() {
    let registry = registry();
    registry.create_user("alice").await.unwrap();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();
    registry
        .add_registration_token("rotate-1", "alice", Some("10.0.0.5".into()), vec![], 1)
        .await
        .unwrap();

    let device = registry.finalise_registration("rotate-1", "", "KB==", "").await.unwrap();
    assert_eq!(device.address, "10.0.0.5");
    assert_eq!(device.public_key, "KB==");

    // The old key reference is gone, the new one resolves.
    assert!(matches!(
        registry.get_device_by_id("KA==").await,
        Err(RegistryError::NoReferenceFound { .. })
    ));
    registry.get_device_by_id("KB==").await.unwrap();
}

#[tokio::test]
async fn generated_tokens_use_the_allowed_charset() {
    let registry = registry();
    let record = registry.generate_registration_token("alice", None, vec![], 2).await.unwrap();
    assert!(wag_core::keys::is_valid_token(&record.token));
    assert_eq!(record.num_uses, 2);
}
