//! Device repository invariants.

use std::sync::Arc;

use wag_core::keys;
use wag_registry::Registry;
use wag_registry::RegistryError;
use wag_store::MemoryStore;
use wag_store::SortOrder;
use wag_store::Store;

fn registry() -> (Arc<Registry>, Arc<MemoryStore>) {
    let store = MemoryStore::new();
    (Registry::new(store.clone(), 1), store)
}

#[tokio::test]
async fn add_device_creates_primary_and_both_references() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "psk").await.unwrap();

    let primary = store.get("devices-alice-10.0.0.5").await.unwrap();
    assert!(primary.is_some());

    for reference in ["deviceref-10.0.0.5", "deviceref-KA=="] {
        let entry = store.get(reference).await.unwrap().unwrap();
        assert_eq!(entry.value, "devices-alice-10.0.0.5");
    }
}

#[tokio::test]
async fn add_device_rejects_duplicates_and_bad_addresses() {
    let (registry, _) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    let duplicate = registry.add_device("alice", "10.0.0.5", "KB==", "").await;
    assert!(matches!(duplicate, Err(RegistryError::AlreadyExists { .. })));

    // Reusing the public key under a new address must also fail: the
    // reference key already exists.
    let reused_key = registry.add_device("alice", "10.0.0.6", "KA==", "").await;
    assert!(matches!(reused_key, Err(RegistryError::AlreadyExists { .. })));

    let bad_address = registry.add_device("alice", "not-an-ip", "KC==", "").await;
    assert!(matches!(bad_address, Err(RegistryError::Validation(_))));
}

#[tokio::test]
async fn lookup_by_address_or_public_key_resolves_primary() {
    let (registry, _) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    let by_address = registry.get_device_by_id("10.0.0.5").await.unwrap();
    let by_key = registry.get_device_by_id("KA==").await.unwrap();
    assert_eq!(by_address, by_key);
    assert_eq!(by_address.username, "alice");
}

#[tokio::test]
async fn delete_device_removes_all_three_keys() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    registry.delete_device("KA==").await.unwrap();

    assert!(store.get("devices-alice-10.0.0.5").await.unwrap().is_none());
    assert!(store.get("deviceref-10.0.0.5").await.unwrap().is_none());
    assert!(store.get("deviceref-KA==").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_device_distinguishes_missing_reference_from_dangling() {
    let (registry, store) = registry();

    let missing = registry.delete_device("10.9.9.9").await;
    assert!(matches!(missing, Err(RegistryError::NoReferenceFound { .. })));

    // A reference pointing at a removed primary is an invariant violation
    // and is reported, not swallowed.
    store.put("deviceref-10.0.0.9", "devices-bob-10.0.0.9").await.unwrap();
    let dangling = registry.delete_device("10.0.0.9").await;
    assert!(matches!(dangling, Err(RegistryError::DanglingReference { .. })));
}

#[tokio::test]
async fn delete_devices_uses_plural_prefix() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();
    registry.add_device("alice", "10.0.0.6", "KB==", "").await.unwrap();
    registry.add_device("bob", "10.0.0.7", "KC==", "").await.unwrap();

    registry.delete_devices("alice").await.unwrap();

    assert!(store.list("devices-alice-", SortOrder::Ascending).await.unwrap().is_empty());
    assert!(store.get("deviceref-KA==").await.unwrap().is_none());
    assert!(store.get("deviceref-10.0.0.6").await.unwrap().is_none());
    // Bob's device is untouched.
    assert!(store.get("devices-bob-10.0.0.7").await.unwrap().is_some());
    assert!(store.get("deviceref-KC==").await.unwrap().is_some());
}

#[tokio::test]
async fn public_key_rotation_swaps_reference_keys() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    registry.update_device_public_key("alice", "10.0.0.5", "KB==").await.unwrap();

    let device = registry.get_device("alice", "10.0.0.5").await.unwrap();
    assert_eq!(device.public_key, "KB==");
    assert!(store.get("deviceref-KA==").await.unwrap().is_none());
    let new_ref = store.get("deviceref-KB==").await.unwrap().unwrap();
    assert_eq!(new_ref.value, "devices-alice-10.0.0.5");
}

#[tokio::test]
async fn repair_republishes_and_prunes_references() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    // Simulate a crash mid key-rotation: new-key reference never written.
    store.delete("deviceref-KA==").await.unwrap();
    // And a crash mid cascade-delete: orphan reference without a primary.
    store.put("deviceref-KZ==", "devices-ghost-10.9.9.9").await.unwrap();

    registry.repair_device_refs().await.unwrap();

    let republished = store.get("deviceref-KA==").await.unwrap().unwrap();
    assert_eq!(republished.value, "devices-alice-10.0.0.5");
    assert!(store.get("deviceref-KZ==").await.unwrap().is_none());
}

#[tokio::test]
async fn authorisation_updates_only_touch_the_primary() {
    let (registry, store) = registry();
    registry.add_device("alice", "10.0.0.5", "KA==", "").await.unwrap();

    registry.set_authorised("alice", "10.0.0.5", 3).await.unwrap();
    let device = registry.get_device("alice", "10.0.0.5").await.unwrap();
    assert!(device.is_authorised());
    assert_eq!(device.associated_node, Some(3));
    assert_eq!(device.attempts, 0);

    registry.deauthorise("alice", "10.0.0.5").await.unwrap();
    let device = registry.get_device("alice", "10.0.0.5").await.unwrap();
    assert!(!device.is_authorised());

    // Reference keys still point where they did.
    let reference = store.get("deviceref-KA==").await.unwrap().unwrap();
    assert_eq!(reference.value, "devices-alice-10.0.0.5");
}

#[tokio::test]
async fn delete_user_cascades_to_devices_and_references() {
    let (registry, store) = registry();
    registry.create_user("bob").await.unwrap();
    registry.add_device("bob", "10.0.1.1", "B1==", "").await.unwrap();
    registry.add_device("bob", "10.0.1.2", "B2==", "").await.unwrap();
    registry.add_device("bob", "10.0.1.3", "B3==", "").await.unwrap();

    registry.delete_user("bob").await.unwrap();

    assert!(store.get(&keys::user("bob")).await.unwrap().is_none());
    assert!(store.list("devices-bob-", SortOrder::Ascending).await.unwrap().is_empty());
    assert!(store.list("deviceref-", SortOrder::Ascending).await.unwrap().is_empty());
}
