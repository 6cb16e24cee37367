//! Group membership and the reverse index stay equivalent.

use std::collections::BTreeSet;
use std::sync::Arc;

use wag_core::Acl;
use wag_registry::Registry;
use wag_store::MemoryStore;

fn registry() -> Arc<Registry> {
    Registry::new(MemoryStore::new(), 1)
}

/// The set {g | u ∈ members(g)} must equal the reverse index for u.
async fn assert_views_equivalent(registry: &Registry, users: &[&str], groups: &[&str]) {
    for user in users {
        let from_index: BTreeSet<String> = registry.get_user_groups(user).await.unwrap().into_iter().collect();
        let mut from_groups = BTreeSet::new();
        for group in groups {
            if registry.get_group_members(group).await.unwrap().contains(&user.to_string()) {
                from_groups.insert(group.to_string());
            }
        }
        assert_eq!(from_index, from_groups, "views diverge for {user}");
    }
}

#[tokio::test]
async fn set_group_maintains_the_reverse_index() {
    let registry = registry();
    registry.set_group("engineering", vec!["alice".into(), "bob".into()]).await.unwrap();
    registry.set_group("oncall", vec!["bob".into()]).await.unwrap();

    assert_views_equivalent(&registry, &["alice", "bob"], &["engineering", "oncall"]).await;
    assert_eq!(registry.get_user_groups("bob").await.unwrap().len(), 2);
}

#[tokio::test]
async fn shrinking_a_group_removes_departed_members_from_the_index() {
    let registry = registry();
    registry.set_group("engineering", vec!["alice".into(), "bob".into()]).await.unwrap();
    registry.set_group("engineering", vec!["bob".into()]).await.unwrap();

    assert!(registry.get_user_groups("alice").await.unwrap().is_empty());
    assert_views_equivalent(&registry, &["alice", "bob"], &["engineering"]).await;
}

#[tokio::test]
async fn delete_group_clears_every_member() {
    let registry = registry();
    registry.set_group("engineering", vec!["alice".into(), "bob".into()]).await.unwrap();
    registry.set_group("oncall", vec!["bob".into()]).await.unwrap();

    registry.delete_group("engineering").await.unwrap();

    assert!(registry.get_group_members("engineering").await.unwrap().is_empty());
    assert!(registry.get_user_groups("alice").await.unwrap().is_empty());
    assert_eq!(registry.get_user_groups("bob").await.unwrap(), vec!["oncall".to_string()]);
}

#[tokio::test]
async fn effective_acl_merges_user_wildcard_and_groups() {
    let registry = registry();
    registry
        .set_acl(
            "alice",
            Acl {
                mfa: vec!["10.1.0.0/16".into()],
                ..Acl::default()
            },
        )
        .await
        .unwrap();
    registry
        .set_acl(
            "*",
            Acl {
                allow: vec!["192.168.0.53:53".into()],
                ..Acl::default()
            },
        )
        .await
        .unwrap();
    registry
        .set_acl(
            "engineering",
            Acl {
                mfa: vec!["10.2.0.0/16".into()],
                deny: vec!["10.2.9.0/24".into()],
                ..Acl::default()
            },
        )
        .await
        .unwrap();
    registry.set_group("engineering", vec!["alice".into()]).await.unwrap();

    let effective = registry.get_effective_acl("alice").await.unwrap();
    assert_eq!(effective.mfa, vec!["10.1.0.0/16".to_string(), "10.2.0.0/16".to_string()]);
    assert_eq!(effective.allow, vec!["192.168.0.53:53".to_string()]);
    assert_eq!(effective.deny, vec!["10.2.9.0/24".to_string()]);

    // A user with no policies at all still gets the wildcard entries.
    let fallback = registry.get_effective_acl("mallory").await.unwrap();
    assert_eq!(fallback.allow, vec!["192.168.0.53:53".to_string()]);
    assert!(fallback.mfa.is_empty());
}

#[tokio::test]
async fn a_group_deny_subtracts_from_the_effective_grants() {
    let registry = registry();
    registry
        .set_acl(
            "alice",
            Acl {
                mfa: vec!["10.2.0.0/16".into(), "10.3.0.0/16".into()],
                allow: vec!["192.168.0.53:53".into()],
                deny: vec![],
            },
        )
        .await
        .unwrap();
    registry
        .set_acl(
            "contractors",
            Acl {
                deny: vec!["10.2.0.0/16".into(), "192.168.0.53:53".into()],
                ..Acl::default()
            },
        )
        .await
        .unwrap();
    registry.set_group("contractors", vec!["alice".into()]).await.unwrap();

    // Destinations denied by the group drop out of the grants the user's
    // own policy carried; the deny list itself survives for the dataplane.
    let effective = registry.get_effective_acl("alice").await.unwrap();
    assert_eq!(effective.mfa, vec!["10.3.0.0/16".to_string()]);
    assert!(effective.allow.is_empty());
    assert_eq!(
        effective.deny,
        vec!["10.2.0.0/16".to_string(), "192.168.0.53:53".to_string()]
    );
}
