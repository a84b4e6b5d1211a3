//! Integration tests for inventory resolution through the object cache
//!
//! Tests cover:
//! - Multi-kind worlds sharing one cache
//! - Preloaded inventories resolving without backend traffic
//! - Out-of-band deletion, recreation, and rename
//! - Caller-opted staleness bounds
//! - Point-in-time snapshots
//! - UUID kind safety

use purser::cache::ResolveOptions;
use purser::error::InventoryError;
use purser::types::{EntityKind, Uuid};
use std::time::Duration;

use crate::integration::test_utils::{world, VM_A, VM_B, VM_C};

#[tokio::test]
async fn test_kinds_resolve_through_separate_namespaces() {
    let (backend, _session, cache) = world();
    backend.add_entity(EntityKind::VirtualMachine, VM_A, "alpha");
    backend.add_entity(EntityKind::Host, VM_B, "alpha");
    backend.add_entity(EntityKind::Datastore, VM_C, "alpha");

    // The same display name in three kinds is not ambiguous anywhere.
    let vm = cache.resolve(EntityKind::VirtualMachine, "alpha").await.unwrap();
    let host = cache.resolve(EntityKind::Host, "alpha").await.unwrap();
    let datastore = cache.resolve(EntityKind::Datastore, "alpha").await.unwrap();

    assert_eq!(vm.uuid().as_str(), VM_A);
    assert_eq!(host.uuid().as_str(), VM_B);
    assert_eq!(datastore.uuid().as_str(), VM_C);
    assert_eq!(vm.moref().as_str(), "vm-1");
    assert_eq!(host.moref().as_str(), "host-1");
    assert_eq!(datastore.moref().as_str(), "datastore-1");
    assert_eq!(backend.scan_calls(), 3);
    assert_eq!(cache.len(), 3);

    // Each scan landed in the primary index too.
    cache.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    cache.resolve(EntityKind::Host, VM_B).await.unwrap();
    cache.resolve(EntityKind::Datastore, VM_C).await.unwrap();
    assert_eq!(backend.fetch_calls(), 0);
}

#[tokio::test]
async fn test_preloaded_inventory_resolves_without_backend_traffic() {
    let (backend, _session, cache) = world();
    let uuids: Vec<String> = (0..50)
        .map(|i| format!("42160000-0000-4000-8000-{:012x}", i))
        .collect();
    for (i, uuid) in uuids.iter().enumerate() {
        backend.add_vm(format!("vm-{:03}", i), uuid.as_str());
    }
    backend.add_entity(EntityKind::Host, VM_A, "esx-01");

    let count = cache.preload_all(EntityKind::VirtualMachine).await.unwrap();
    assert_eq!(count, 50);
    assert_eq!(cache.len(), 50);
    assert_eq!(backend.enumerate_calls(), 1);

    // Every VM resolves from the cache, by either key.
    for (i, uuid) in uuids.iter().enumerate() {
        let by_uuid = cache.resolve(EntityKind::VirtualMachine, uuid).await.unwrap();
        let by_name = cache
            .resolve(EntityKind::VirtualMachine, &format!("vm-{:03}", i))
            .await
            .unwrap();
        assert_eq!(by_uuid.uuid(), by_name.uuid());
    }
    assert_eq!(backend.fetch_calls(), 0);
    assert_eq!(backend.scan_calls(), 0);

    // The host was not part of the preload and still costs a fetch.
    cache.resolve(EntityKind::Host, VM_A).await.unwrap();
    assert_eq!(backend.fetch_calls(), 1);
}

#[tokio::test]
async fn test_recreated_entity_gets_its_new_identity_after_refresh() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_A);

    let original = cache
        .resolve(EntityKind::VirtualMachine, "web-01")
        .await
        .unwrap();
    assert_eq!(original.uuid().as_str(), VM_A);
    assert_eq!(backend.scan_calls(), 1);

    // Another actor deletes the VM and recreates it under the same name.
    backend.remove_by_uuid(&Uuid::from(VM_A));
    backend.add_vm("web-01", VM_B);

    // The cached binding still serves the old identity until told otherwise.
    let stale = cache
        .resolve(EntityKind::VirtualMachine, "web-01")
        .await
        .unwrap();
    assert_eq!(stale.uuid().as_str(), VM_A);
    assert_eq!(backend.scan_calls(), 1);

    let err = cache.refresh(&Uuid::from(VM_A)).await.unwrap_err();
    assert!(matches!(err, InventoryError::EntityNotFound(_)));
    assert!(cache.is_empty());

    let recreated = cache
        .resolve(EntityKind::VirtualMachine, "web-01")
        .await
        .unwrap();
    assert_eq!(recreated.uuid().as_str(), VM_B);
    assert_eq!(backend.scan_calls(), 2);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_staleness_bound_observes_an_out_of_band_rename() {
    let (backend, _session, cache) = world();
    backend.add_vm("app-01", VM_A);

    cache.resolve(EntityKind::VirtualMachine, "app-01").await.unwrap();
    backend.rename(&Uuid::from(VM_A), "app-02");
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A default resolve keeps trusting the cache; only the caller's
    // staleness bound forces the re-fetch that reveals the rename.
    let trusted = cache.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    assert_eq!(trusted.name(), "app-01");

    let strict = ResolveOptions {
        max_age: Some(Duration::ZERO),
        ..ResolveOptions::default()
    };
    let fresh = cache
        .resolve_with(EntityKind::VirtualMachine, VM_A, strict)
        .await
        .unwrap();
    assert_eq!(fresh.name(), "app-02");
    assert_eq!(backend.fetch_calls(), 1);

    // The re-fetch rebound the secondary index as well.
    let scans_before = backend.scan_calls();
    let by_new_name = cache
        .resolve(EntityKind::VirtualMachine, "app-02")
        .await
        .unwrap();
    assert_eq!(by_new_name.uuid().as_str(), VM_A);
    assert_eq!(backend.scan_calls(), scans_before);

    let err = cache
        .resolve(EntityKind::VirtualMachine, "app-01")
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::EntityNotFound(_)));
}

#[tokio::test]
async fn test_snapshot_is_stable_while_the_world_moves_on() {
    const VM_D: &str = "42160000-0000-4000-8000-0000000000d4";
    let (backend, _session, cache) = world();
    backend.add_vm("one", VM_A);
    backend.add_vm("two", VM_B);
    backend.add_vm("three", VM_C);
    backend.add_vm("four", VM_D);

    cache.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    cache.resolve(EntityKind::VirtualMachine, VM_B).await.unwrap();
    cache.resolve(EntityKind::VirtualMachine, VM_C).await.unwrap();

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.len(), 3);

    // Mutations after the snapshot was taken do not reach it.
    cache.invalidate(&Uuid::from(VM_B));
    cache.resolve(EntityKind::VirtualMachine, VM_D).await.unwrap();

    let frozen: Vec<String> = snapshot.map(|h| h.uuid().as_str().to_string()).collect();
    assert_eq!(frozen, vec![VM_A, VM_B, VM_C]);

    let current: Vec<String> = cache
        .snapshot()
        .map(|h| h.uuid().as_str().to_string())
        .collect();
    assert_eq!(current, vec![VM_A, VM_C, VM_D]);
}

#[tokio::test]
async fn test_a_uuid_never_serves_two_kinds() {
    let (backend, _session, cache) = world();
    backend.add_entity(EntityKind::Host, VM_A, "esx-01");

    cache.resolve(EntityKind::Host, "esx-01").await.unwrap();

    // The UUID is taken by the host even though it entered the cache
    // through the name index.
    let err = cache
        .resolve(EntityKind::VirtualMachine, VM_A)
        .await
        .unwrap_err();
    match err {
        InventoryError::KindMismatch { requested, actual, uuid } => {
            assert_eq!(requested, EntityKind::VirtualMachine);
            assert_eq!(actual, EntityKind::Host);
            assert_eq!(uuid.as_str(), VM_A);
        }
        other => panic!("expected KindMismatch, got {:?}", other),
    }

    // Names are per-kind buckets, so the wrong kind simply misses and
    // scans its own namespace.
    let err = cache
        .resolve(EntityKind::VirtualMachine, "esx-01")
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::EntityNotFound(_)));
    assert_eq!(backend.scan_calls(), 2);
}
