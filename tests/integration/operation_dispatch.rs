//! Integration tests for named operations dispatched through the client
//!
//! Tests cover:
//! - Power lifecycle against a live cache
//! - Clone, reconfigure, and destroy flows
//! - Folder layout and custom field writes
//! - In-guest command execution
//! - Caller-defined operations next to the built-ins
//! - Session establishment through a connector

use async_trait::async_trait;
use purser::backend::memory::{MemoryConnector, ProcessScript};
use purser::backend::PowerState;
use purser::client::Client;
use purser::error::InventoryError;
use purser::ops::{Operation, OperationContext};
use purser::session::{SessionSettings, WaitPolicy};
use purser::types::{EntityKind, Uuid};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::integration::test_utils::{client_world, VM_A, VM_B, VM_C};

const NETWORK: &str = "42160000-0000-4000-8000-0000000000e5";
const FOLDER: &str = "42160000-0000-4000-8000-0000000000f6";

#[tokio::test]
async fn test_power_cycle_through_the_client() {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);

    let state = client
        .invoke("power-state", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(state["power_state"], "poweredOff");
    assert_eq!(state["uuid"], VM_A);

    let on = client
        .invoke("power-on", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(on["power_state"], "poweredOn");
    assert_eq!(backend.power_of(&Uuid::from(VM_A)), Some(PowerState::PoweredOn));

    let restarted = client
        .invoke("restart", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(restarted["power_state"], "poweredOn");
    assert_eq!(backend.reboot_requests(), 1);

    let off = client
        .invoke("power-off", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(off["power_state"], "poweredOff");
    assert_eq!(backend.power_of(&Uuid::from(VM_A)), Some(PowerState::PoweredOff));
}

#[tokio::test]
async fn test_clone_lifecycle_ends_where_it_started() {
    let (backend, client) = client_world();
    backend.add_vm("ubuntu-template", VM_A);
    backend.add_entity(EntityKind::Host, VM_B, "esx-01");
    backend.add_entity(EntityKind::Datastore, VM_C, "ds-fast");
    backend.add_entity(EntityKind::Folder, FOLDER, "prod");

    let cloned = client
        .invoke(
            "clone",
            json!({
                "template": "ubuntu-template",
                "host": "esx-01",
                "datastore": "ds-fast",
                "folder": "prod",
                "name": "wéb-02",
            }),
        )
        .await
        .unwrap();
    // The requested name went through backend-safe sanitization.
    assert_eq!(cloned["name"], "web-02");
    let new_uuid = cloned["uuid"].as_str().unwrap().to_string();

    let requests = backend.clone_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source.as_str(), "vm-1");
    assert_eq!(requests[0].host.as_str(), "host-1");
    assert_eq!(requests[0].datastore.as_str(), "datastore-1");
    assert_eq!(requests[0].folder.as_str(), "group-1");

    // The newcomer is already cached; resolving it is free.
    let scans = backend.scan_calls();
    let handle = client
        .resolve(EntityKind::VirtualMachine, "web-02")
        .await
        .unwrap();
    assert_eq!(handle.uuid().as_str(), new_uuid);
    assert_eq!(backend.scan_calls(), scans);
    assert_eq!(client.cache().len(), 5);

    let destroyed = client
        .invoke("destroy", json!({"vm": "web-02"}))
        .await
        .unwrap();
    assert_eq!(destroyed["destroyed"], true);
    assert!(!backend.exists(&Uuid::from(new_uuid.as_str())));
    assert_eq!(client.cache().len(), 4);
}

#[tokio::test]
async fn test_maintenance_mode_blocks_cloning() {
    let (backend, client) = client_world();
    backend.add_vm("ubuntu-template", VM_A);
    backend.add_entity(EntityKind::Host, VM_B, "esx-01");
    backend.add_entity(EntityKind::Datastore, VM_C, "ds-fast");
    backend.add_entity(EntityKind::Folder, FOLDER, "prod");
    backend.set_maintenance(&Uuid::from(VM_B), true);

    let err = client
        .invoke(
            "clone",
            json!({
                "template": "ubuntu-template",
                "host": "esx-01",
                "datastore": "ds-fast",
                "folder": "prod",
                "name": "web-02",
            }),
        )
        .await
        .unwrap_err();
    match err {
        InventoryError::BadState(message) => assert!(message.contains("maintenance")),
        other => panic!("expected BadState, got {:?}", other),
    }
    assert!(backend.clone_requests().is_empty());
}

#[tokio::test]
async fn test_reconfigure_grows_only_and_attaches_networks() {
    let (backend, client) = client_world();
    let moref = backend.add_entity_with_attributes(
        EntityKind::VirtualMachine,
        VM_A,
        "db-01",
        json!({"disk_capacity_kb": 41_943_040u64}),
    );
    backend.add_entity(EntityKind::Network, NETWORK, "backbone");

    client
        .invoke(
            "reconfigure",
            json!({
                "vm": "db-01",
                "vcpus": 8,
                "memory_mb": 16384,
                "disk_gb": 80,
                "network": "backbone",
            }),
        )
        .await
        .unwrap();

    let requests = backend.reconfigure_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, moref);
    assert_eq!(requests[0].1.num_cpus, Some(8));
    assert_eq!(requests[0].1.memory_mb, Some(16384));
    assert_eq!(requests[0].1.disk_capacity_kb, Some(83_886_080));
    let attachment = requests[0].1.network.as_ref().unwrap();
    assert_eq!(attachment.name, "backbone");
    assert_eq!(attachment.network.as_str(), "network-1");

    // Asking for a smaller disk submits a request with the disk untouched.
    client
        .invoke("reconfigure", json!({"vm": "db-01", "disk_gb": 10}))
        .await
        .unwrap();
    let requests = backend.reconfigure_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1.disk_capacity_kb, None);
}

#[tokio::test]
async fn test_folder_layout_round_trip() {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);
    backend.add_entity(EntityKind::Folder, FOLDER, "datacenter-root");

    let created = client
        .invoke(
            "create-folder",
            json!({"parent": "datacenter-root", "name": "wébservers"}),
        )
        .await
        .unwrap();
    assert_eq!(created["name"], "webservers");
    let folder_moref = created["moref"].as_str().unwrap().to_string();
    assert!(folder_moref.starts_with("group-"));

    let moved = client
        .invoke(
            "move-to-folder",
            json!({"vm": "web-01", "folder": "webservers"}),
        )
        .await
        .unwrap();
    assert_eq!(moved["moved"], true);

    let moves = backend.move_requests();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].0.as_str(), folder_moref);
    assert_eq!(moves[0].1.len(), 1);
    assert_eq!(moves[0].1[0].as_str(), "vm-1");

    // The backend refuses a second folder under the same name.
    let err = client
        .invoke(
            "create-folder",
            json!({"parent": "datacenter-root", "name": "webservers"}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::DuplicateEntity(_)));
}

#[tokio::test]
async fn test_notes_and_custom_fields_take_different_paths() {
    let (backend, client) = client_world();
    let moref = backend.add_vm("web-01", VM_A);
    let email_field = backend.seed_field("Primary Email Address");

    client
        .invoke(
            "set-custom-field",
            json!({"vm": "web-01", "field": "Notes", "value": "owned by platform"}),
        )
        .await
        .unwrap();
    let reconfigures = backend.reconfigure_requests();
    assert_eq!(reconfigures.len(), 1);
    assert_eq!(
        reconfigures[0].1.annotation.as_deref(),
        Some("owned by platform")
    );
    assert_eq!(backend.defined_fields().len(), 1);

    // Email-ish names match the existing email field loosely.
    client
        .invoke(
            "set-custom-field",
            json!({"vm": "web-01", "field": "Contact Email", "value": "ops@example.com"}),
        )
        .await
        .unwrap();
    assert_eq!(
        backend.field_value(&moref, email_field.key).as_deref(),
        Some("ops@example.com")
    );
    assert_eq!(backend.defined_fields().len(), 1);

    // An unmatched name is defined on the fly.
    client
        .invoke(
            "set-custom-field",
            json!({"vm": "web-01", "field": "CostCenter", "value": "CC-42"}),
        )
        .await
        .unwrap();
    let fields = backend.defined_fields();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[1].name, "CostCenter");
    assert_eq!(
        backend.field_value(&moref, fields[1].key).as_deref(),
        Some("CC-42")
    );
}

#[tokio::test]
async fn test_run_in_guest_end_to_end() {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);
    backend.script_process(ProcessScript {
        polls_until_exit: 2,
        exit_code: 0,
    });

    let result = client
        .invoke(
            "run-in-guest",
            json!({
                "vm": "web-01",
                "username": "admin",
                "password": "hunter2",
                "program": "/usr/bin/deploy",
                "arguments": "--release 1.4.2",
                "output_file": "/tmp/deploy.log",
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["succeeded"], true);
    assert_eq!(result["vm"], "web-01");
    assert!(result["pid"].as_i64().unwrap() > 1000);

    let started = backend.started_programs();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].program_path, "/usr/bin/deploy");
    assert_eq!(started[0].arguments, "--release 1.4.2 > /tmp/deploy.log");
}

#[tokio::test]
async fn test_operations_share_the_client_cache() {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);

    client
        .invoke("power-on", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(backend.scan_calls(), 1);

    // The operation resolved the VM; the caller gets it for free.
    let handle = client.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    assert_eq!(handle.name(), "web-01");
    assert_eq!(backend.fetch_calls(), 0);
    assert_eq!(client.snapshot().len(), 1);
}

struct CacheReport;

#[async_trait]
impl Operation for CacheReport {
    fn name(&self) -> &str {
        "cache-report"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        _args: Value,
    ) -> Result<Value, InventoryError> {
        Ok(json!({"cached": ctx.cache().len()}))
    }
}

#[tokio::test]
async fn test_caller_operations_join_the_builtins() {
    let (backend, mut client) = client_world();
    backend.add_vm("web-01", VM_A);

    client.register_operation(Arc::new(CacheReport)).unwrap();
    let err = client.register_operation(Arc::new(CacheReport)).unwrap_err();
    assert!(matches!(err, InventoryError::DuplicateOperation(_)));

    client.resolve(EntityKind::VirtualMachine, VM_A).await.unwrap();
    let report = client.invoke("cache-report", json!({})).await.unwrap();
    assert_eq!(report["cached"], 1);

    let names = client.registry().names();
    assert!(names.contains(&"cache-report".to_string()));
    assert!(names.windows(2).all(|pair| pair[0] < pair[1]));

    let err = client.invoke("decommission", json!({})).await.unwrap_err();
    match err {
        InventoryError::UnknownOperation(name) => assert_eq!(name, "decommission"),
        other => panic!("expected UnknownOperation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connector_establishes_a_working_client() {
    let backend = Arc::new(purser::backend::memory::MemoryBackend::new());
    backend.add_vm("web-01", VM_A);
    let connector = MemoryConnector::new(backend.clone());
    let settings = SessionSettings::new("vcenter.test", "svc-purser", "secret")
        .with_waits(WaitPolicy::immediate());

    let client = Client::establish(&connector, settings.clone())
        .await
        .unwrap();
    assert_eq!(client.preload(EntityKind::VirtualMachine).await.unwrap(), 1);
    let state = client
        .invoke("power-state", json!({"vm": "web-01"}))
        .await
        .unwrap();
    assert_eq!(state["power_state"], "poweredOff");

    connector.fail_connect(true);
    let err = Client::establish(&connector, settings).await.unwrap_err();
    assert!(matches!(err, InventoryError::BackendUnavailable(_)));
}
