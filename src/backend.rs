//! Backend capability seams.
//!
//! Everything this layer needs from the virtualization platform is expressed
//! as three object-safe async traits: inventory lookup, control-plane calls,
//! and guest-OS process access. Any implementation satisfying them (the
//! in-memory backend in [`memory`], a SOAP client, a REST gateway) is
//! interchangeable; implementations are injected as `Arc<dyn …>` and speak
//! this crate's error vocabulary at the boundary.

use crate::error::{GuestError, InventoryError};
use crate::session::SessionSettings;
use crate::types::{EntityKind, EntityRecord, MoRef, Uuid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod memory;

/// Reference to a backend-side asynchronous job. Mutating control calls
/// return one of these; completion is observed by polling
/// [`ControlBackend::task_status`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(String);

impl TaskRef {
    pub fn new(value: impl Into<String>) -> Self {
        TaskRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Error(String),
}

/// Power state as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        write!(f, "{}", name)
    }
}

/// State of the in-guest agent ("tools"). Running is the signal that the
/// guest OS is up and reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolsStatus {
    Running,
    NotRunning,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuestRunState {
    Running,
    NotRunning,
    ShuttingDown,
    Unknown,
}

/// Combined guest-side view used by the power and reboot waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestInfo {
    pub tools: ToolsStatus,
    pub state: GuestRunState,
}

/// Everything a clone submission needs, resolved to managed-object
/// references by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneRequest {
    pub source: MoRef,
    pub name: String,
    pub folder: MoRef,
    pub host: MoRef,
    pub datastore: MoRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkAttachment {
    pub network: MoRef,
    pub name: String,
}

/// Intent for one reconfiguration task. Unset fields are left untouched by
/// the backend; the annotation field doubles as the "Notes" write path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconfigureRequest {
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_capacity_kb: Option<u64>,
    pub network: Option<NetworkAttachment>,
    pub annotation: Option<String>,
}

/// A custom-field definition known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub key: i32,
    pub name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl GuestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        GuestCredentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Credentials travel through logs-adjacent code; keep the password out of
// any Debug rendering.
impl fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One process as reported by the guest agent. `exit_code` stays `None`
/// while the process is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProcessInfo {
    pub pid: i64,
    pub name: String,
    pub exit_code: Option<i64>,
}

/// Inventory lookup capability: the three read paths the cache resolves
/// through. Absence is `Ok(None)` / an empty vec — the cache owns mapping
/// absence to [`InventoryError::EntityNotFound`].
#[async_trait]
pub trait InventoryBackend: Send + Sync {
    /// Single-entity point lookup by instance UUID.
    async fn fetch_by_uuid(
        &self,
        kind: EntityKind,
        uuid: &Uuid,
    ) -> Result<Option<EntityRecord>, InventoryError>;

    /// Exact-name scan over the full inventory of a kind. The expensive
    /// path; zero, one, or many matches are all legitimate answers.
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Vec<EntityRecord>, InventoryError>;

    /// Enumerate every entity of a kind in one call.
    async fn enumerate_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, InventoryError>;
}

/// Control-plane capability, addressed by managed-object reference. Calls
/// against a reference the backend no longer knows fail with
/// [`InventoryError::StaleReference`].
#[async_trait]
pub trait ControlBackend: Send + Sync {
    async fn power_state(&self, vm: &MoRef) -> Result<PowerState, InventoryError>;

    async fn guest_info(&self, vm: &MoRef) -> Result<GuestInfo, InventoryError>;

    async fn power_on(&self, vm: &MoRef) -> Result<TaskRef, InventoryError>;

    async fn power_off(&self, vm: &MoRef) -> Result<TaskRef, InventoryError>;

    /// Ask the guest OS to shut down. The backend does not always hand back
    /// a task for this, hence the `Option`.
    async fn shutdown_guest(&self, vm: &MoRef) -> Result<Option<TaskRef>, InventoryError>;

    /// Ask the guest OS to reboot. Fire-and-forget; there is never a task.
    async fn reboot_guest(&self, vm: &MoRef) -> Result<(), InventoryError>;

    async fn reset(&self, vm: &MoRef) -> Result<TaskRef, InventoryError>;

    async fn destroy(&self, vm: &MoRef) -> Result<TaskRef, InventoryError>;

    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskRef, InventoryError>;

    async fn reconfigure(
        &self,
        vm: &MoRef,
        request: &ReconfigureRequest,
    ) -> Result<TaskRef, InventoryError>;

    async fn move_into(&self, folder: &MoRef, entities: &[MoRef])
        -> Result<TaskRef, InventoryError>;

    /// Create a child folder. Duplicate names fail with
    /// [`InventoryError::DuplicateEntity`], names the backend rejects with
    /// [`InventoryError::InvalidInput`].
    async fn create_folder(&self, parent: &MoRef, name: &str) -> Result<MoRef, InventoryError>;

    async fn available_fields(&self) -> Result<Vec<FieldDefinition>, InventoryError>;

    async fn define_field(&self, name: &str) -> Result<FieldDefinition, InventoryError>;

    async fn set_field(&self, entity: &MoRef, key: i32, value: &str)
        -> Result<(), InventoryError>;

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatus, InventoryError>;

    async fn host_in_maintenance(&self, host: &MoRef) -> Result<bool, InventoryError>;
}

/// Guest-OS process capability.
#[async_trait]
pub trait GuestBackend: Send + Sync {
    /// Start a program inside the guest; returns its pid.
    async fn start_program(
        &self,
        vm: &MoRef,
        credentials: &GuestCredentials,
        program_path: &str,
        arguments: &str,
    ) -> Result<i64, GuestError>;

    /// Report on the given pids (all processes when empty).
    async fn list_processes(
        &self,
        vm: &MoRef,
        credentials: &GuestCredentials,
        pids: &[i64],
    ) -> Result<Vec<GuestProcessInfo>, GuestError>;

    /// URL from which a file inside the guest can be fetched over HTTP. The
    /// backend hosts guest files on a web endpoint rather than streaming
    /// them through the control channel.
    async fn output_file_url(
        &self,
        vm: &MoRef,
        credentials: &GuestCredentials,
        path: &str,
    ) -> Result<String, GuestError>;
}

/// The three capability implementations one established session carries.
#[derive(Clone)]
pub struct BackendHandles {
    pub inventory: Arc<dyn InventoryBackend>,
    pub control: Arc<dyn ControlBackend>,
    pub guest: Arc<dyn GuestBackend>,
}

/// Transport establishment seam. Concrete connectors (SOAP, REST) live
/// outside this crate; the in-memory backend implements it for tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &SessionSettings) -> Result<BackendHandles, InventoryError>;
}
