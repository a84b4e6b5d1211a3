//! Integration tests for concurrent resolution
//!
//! Tests cover:
//! - Stampedes coalescing into a single backend call
//! - Failure fan-out to every coalesced waiter
//! - Independence of distinct identifier windows
//! - Caller timeouts against a slow backend

use futures::future::join_all;
use purser::cache::{ObjectCache, ResolveOptions};
use purser::error::InventoryError;
use purser::types::{EntityKind, Uuid};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::test_utils::{world, VM_A, VM_B};

#[tokio::test]
async fn test_a_stampede_coalesces_into_one_backend_fetch() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_A);
    backend.set_latency(Duration::from_millis(50));
    let cache = Arc::new(cache);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache.resolve(EntityKind::VirtualMachine, VM_A).await
            })
        })
        .collect();

    for joined in join_all(tasks).await {
        let handle = joined.unwrap().unwrap();
        assert_eq!(handle.uuid().as_str(), VM_A);
        assert_eq!(handle.name(), "web-01");
    }
    assert_eq!(backend.fetch_calls(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_name_stampedes_share_one_scan() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_A);
    backend.set_latency(Duration::from_millis(50));
    let cache = Arc::new(cache);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache.resolve(EntityKind::VirtualMachine, "web-01").await
            })
        })
        .collect();

    for joined in join_all(tasks).await {
        assert_eq!(joined.unwrap().unwrap().uuid().as_str(), VM_A);
    }
    assert_eq!(backend.scan_calls(), 1);
    assert_eq!(backend.fetch_calls(), 0);
}

#[tokio::test]
async fn test_uuid_and_name_windows_are_separate() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_A);
    backend.set_latency(Duration::from_millis(150));
    let cache = Arc::new(cache);

    // The UUID fetch is in flight and has not populated the cache yet when
    // the name lookup starts, so the name leads its own scan.
    let by_uuid = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve(EntityKind::VirtualMachine, VM_A).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let by_name = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve(EntityKind::VirtualMachine, "web-01").await })
    };

    let uuid_handle = by_uuid.await.unwrap().unwrap();
    let name_handle = by_name.await.unwrap().unwrap();
    assert_eq!(uuid_handle.uuid(), name_handle.uuid());
    assert_eq!(backend.fetch_calls(), 1);
    assert_eq!(backend.scan_calls(), 1);
    // Both landings collapse onto the one entry.
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_every_waiter_hears_the_leader_fail() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_A);
    backend.set_latency(Duration::from_millis(30));
    backend.fail_all(true);
    let cache = Arc::new(cache);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache.resolve(EntityKind::VirtualMachine, VM_A).await
            })
        })
        .collect();

    for joined in join_all(tasks).await {
        let err = joined.unwrap().unwrap_err();
        assert!(matches!(err, InventoryError::BackendUnavailable(_)));
    }
    assert_eq!(backend.fetch_calls(), 1);
    assert!(cache.is_empty());

    // The failed window is gone; recovery leads a fresh fetch.
    backend.fail_all(false);
    let handle = cache.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    assert_eq!(handle.name(), "web-01");
    assert_eq!(backend.fetch_calls(), 2);
}

#[tokio::test]
async fn test_windows_are_per_identifier_even_under_contention() {
    let (backend, _session, cache) = world();
    for i in 0..10 {
        let uuid = format!("42160000-0000-4000-8000-{:012x}", i);
        backend.add_vm(format!("worker-{:02}", i), uuid.as_str());
    }
    backend.set_latency(Duration::from_millis(30));
    let cache = Arc::new(cache);

    let mut tasks = Vec::new();
    for i in 0..10 {
        for _ in 0..5 {
            let cache = cache.clone();
            let name = format!("worker-{:02}", i);
            tasks.push(tokio::spawn(async move {
                cache.resolve(EntityKind::VirtualMachine, &name).await
            }));
        }
    }

    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }
    // One scan per name, no matter how the fifty resolvers interleaved.
    assert_eq!(backend.scan_calls(), 10);
    assert_eq!(cache.len(), 10);
}

#[tokio::test]
async fn test_timed_out_resolution_recovers_on_retry() {
    let (backend, _session, cache) = world();
    backend.add_vm("web-01", VM_B);
    backend.set_latency(Duration::from_millis(200));

    let bounded = ResolveOptions {
        timeout: Some(Duration::from_millis(10)),
        ..ResolveOptions::default()
    };
    let err = resolve_bounded(&cache, bounded).await.unwrap_err();
    assert!(matches!(err, InventoryError::Timeout(_)));
    assert!(cache.is_empty());

    // Nothing lingers from the abandoned attempt: the next call leads its
    // own fetch and succeeds once the backend responds in time.
    backend.set_latency(Duration::ZERO);
    let handle = resolve_bounded(&cache, bounded).await.unwrap();
    assert_eq!(handle.uuid().as_str(), VM_B);
    assert_eq!(backend.fetch_calls(), 2);
}

async fn resolve_bounded(
    cache: &ObjectCache,
    opts: ResolveOptions,
) -> Result<purser::ManagedObjectHandle, InventoryError> {
    cache
        .resolve_by_uuid(EntityKind::VirtualMachine, &Uuid::from(VM_B), opts)
        .await
}
