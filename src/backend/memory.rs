//! In-memory backend for tests and local development.
//!
//! Implements every capability trait against an in-process inventory with
//! controllable behavior: per-method call counters (resolution tests count
//! backend round trips through these), injectable latency for exercising
//! request coalescing, a fail-everything switch, scripted guest processes,
//! and recorded control-plane submissions for assertions.

use crate::backend::{
    BackendHandles, CloneRequest, Connector, ControlBackend, FieldDefinition, GuestBackend,
    GuestCredentials, GuestInfo, GuestProcessInfo, GuestRunState, InventoryBackend, PowerState,
    ReconfigureRequest, TaskRef, TaskStatus, ToolsStatus,
};
use crate::error::{GuestError, InventoryError};
use crate::session::SessionSettings;
use crate::types::{EntityKind, EntityPayload, EntityRecord, MoRef, Uuid};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted behavior for one guest process started through
/// [`GuestBackend::start_program`].
#[derive(Debug, Clone)]
pub struct ProcessScript {
    /// How many `list_processes` polls report the process still running
    /// before the exit code appears.
    pub polls_until_exit: u32,
    pub exit_code: i64,
}

impl Default for ProcessScript {
    fn default() -> Self {
        ProcessScript {
            polls_until_exit: 0,
            exit_code: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedProgram {
    pub vm: MoRef,
    pub program_path: String,
    pub arguments: String,
    pub pid: i64,
}

#[derive(Debug, Clone)]
struct EntityState {
    kind: EntityKind,
    uuid: Uuid,
    name: String,
    moref: MoRef,
    attributes: serde_json::Value,
    power: PowerState,
    guest: GuestInfo,
    guest_script: VecDeque<GuestInfo>,
    in_maintenance: bool,
}

impl EntityState {
    fn record(&self) -> EntityRecord {
        EntityRecord::new(
            self.uuid.clone(),
            self.name.clone(),
            EntityPayload::with_attributes(self.moref.clone(), self.attributes.clone()),
        )
    }
}

struct TaskState {
    polls_remaining: u32,
    terminal: TaskStatus,
}

struct ProcessState {
    name: String,
    polls_until_exit: u32,
    exit_code: i64,
}

#[derive(Default)]
struct World {
    entities: HashMap<Uuid, EntityState>,
    next_moref: HashMap<&'static str, u64>,
    next_synthetic_uuid: u64,
    tasks: HashMap<String, TaskState>,
    next_task: u64,
    fields: Vec<FieldDefinition>,
    next_field_key: i32,
    field_values: HashMap<(MoRef, i32), String>,
    clone_requests: Vec<CloneRequest>,
    reconfigure_requests: Vec<(MoRef, ReconfigureRequest)>,
    move_requests: Vec<(MoRef, Vec<MoRef>)>,
    reboot_requests: usize,
    failing_reboots: Option<(String, u32)>,
    processes: HashMap<i64, ProcessState>,
    pending_process_scripts: VecDeque<ProcessScript>,
    started_programs: Vec<StartedProgram>,
    next_pid: i64,
    task_poll_delay: u32,
    task_failure: Option<String>,
    tools_after_power_on: ToolsStatus,
    shutdown_returns_task: bool,
    ignore_shutdown: bool,
    ignore_reboot: bool,
    return_pid_zero: bool,
    no_process_info: bool,
}

/// In-process backend world. Wrap in an `Arc` and hand the same instance to
/// [`MemoryConnector`] or [`MemoryBackend::handles`].
pub struct MemoryBackend {
    world: Mutex<World>,
    latency: Mutex<Duration>,
    fail_all: AtomicBool,
    fetch_calls: AtomicUsize,
    scan_calls: AtomicUsize,
    enumerate_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            world: Mutex::new(World {
                next_pid: 1000,
                tools_after_power_on: ToolsStatus::Running,
                shutdown_returns_task: true,
                next_field_key: 100,
                ..World::default()
            }),
            latency: Mutex::new(Duration::ZERO),
            fail_all: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
            scan_calls: AtomicUsize::new(0),
            enumerate_calls: AtomicUsize::new(0),
        }
    }

    /// Capability handles all pointing at this world.
    pub fn handles(self: &Arc<Self>) -> BackendHandles {
        BackendHandles {
            inventory: self.clone(),
            control: self.clone(),
            guest: self.clone(),
        }
    }

    // Inventory management ------------------------------------------------

    pub fn add_entity(
        &self,
        kind: EntityKind,
        uuid: impl Into<Uuid>,
        name: impl Into<String>,
    ) -> MoRef {
        self.add_entity_with_attributes(kind, uuid, name, serde_json::Value::Null)
    }

    pub fn add_entity_with_attributes(
        &self,
        kind: EntityKind,
        uuid: impl Into<Uuid>,
        name: impl Into<String>,
        attributes: serde_json::Value,
    ) -> MoRef {
        let mut world = self.world.lock();
        let moref = world.mint_moref(kind);
        let uuid = uuid.into();
        world.entities.insert(
            uuid.clone(),
            EntityState {
                kind,
                uuid,
                name: name.into(),
                moref: moref.clone(),
                attributes,
                power: PowerState::PoweredOff,
                guest: GuestInfo {
                    tools: ToolsStatus::NotRunning,
                    state: GuestRunState::NotRunning,
                },
                guest_script: VecDeque::new(),
                in_maintenance: false,
            },
        );
        moref
    }

    pub fn add_vm(&self, name: impl Into<String>, uuid: impl Into<Uuid>) -> MoRef {
        self.add_entity(EntityKind::VirtualMachine, uuid, name)
    }

    /// Remove an entity out of band, as another actor deleting it would.
    pub fn remove_by_uuid(&self, uuid: &Uuid) -> bool {
        self.world.lock().entities.remove(uuid).is_some()
    }

    /// Rename an entity out of band.
    pub fn rename(&self, uuid: &Uuid, new_name: impl Into<String>) -> bool {
        match self.world.lock().entities.get_mut(uuid) {
            Some(entity) => {
                entity.name = new_name.into();
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, uuid: &Uuid) -> bool {
        self.world.lock().entities.contains_key(uuid)
    }

    pub fn set_power(&self, uuid: &Uuid, state: PowerState) {
        if let Some(entity) = self.world.lock().entities.get_mut(uuid) {
            entity.power = state;
            if state == PowerState::PoweredOn {
                entity.guest = GuestInfo {
                    tools: ToolsStatus::Running,
                    state: GuestRunState::Running,
                };
            } else {
                entity.guest = GuestInfo {
                    tools: ToolsStatus::NotRunning,
                    state: GuestRunState::NotRunning,
                };
            }
        }
    }

    pub fn power_of(&self, uuid: &Uuid) -> Option<PowerState> {
        self.world.lock().entities.get(uuid).map(|e| e.power)
    }

    pub fn set_guest(&self, uuid: &Uuid, guest: GuestInfo) {
        if let Some(entity) = self.world.lock().entities.get_mut(uuid) {
            entity.guest = guest;
        }
    }

    pub fn set_maintenance(&self, uuid: &Uuid, in_maintenance: bool) {
        if let Some(entity) = self.world.lock().entities.get_mut(uuid) {
            entity.in_maintenance = in_maintenance;
        }
    }

    // Behavior knobs ------------------------------------------------------

    /// Delay applied at the top of every inventory call; lets concurrent
    /// resolutions genuinely overlap.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// When set, every inventory and control call fails with
    /// `BackendUnavailable`.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// New tasks stay `Running` for this many status polls before settling.
    pub fn set_task_poll_delay(&self, polls: u32) {
        self.world.lock().task_poll_delay = polls;
    }

    /// New tasks settle into `Error(message)` instead of `Success`.
    pub fn fail_tasks(&self, message: impl Into<String>) {
        self.world.lock().task_failure = Some(message.into());
    }

    pub fn succeed_tasks(&self) {
        self.world.lock().task_failure = None;
    }

    pub fn set_tools_after_power_on(&self, tools: ToolsStatus) {
        self.world.lock().tools_after_power_on = tools;
    }

    /// Whether `shutdown_guest` hands back a task (the backend does not
    /// always do so).
    pub fn shutdown_returns_task(&self, yes: bool) {
        self.world.lock().shutdown_returns_task = yes;
    }

    /// Guest ignores the shutdown request: no task, no state change.
    pub fn ignore_shutdown(&self, yes: bool) {
        self.world.lock().ignore_shutdown = yes;
    }

    /// Guest ignores the reboot request: call succeeds, tools never drop.
    pub fn ignore_reboot(&self, yes: bool) {
        self.world.lock().ignore_reboot = yes;
    }

    /// The next `times` reboot requests fail with `BadState(message)`.
    pub fn fail_reboots(&self, message: impl Into<String>, times: u32) {
        self.world.lock().failing_reboots = Some((message.into(), times));
    }

    pub fn return_pid_zero(&self, yes: bool) {
        self.world.lock().return_pid_zero = yes;
    }

    pub fn no_process_info(&self, yes: bool) {
        self.world.lock().no_process_info = yes;
    }

    /// Queue scripted behavior for the next started guest process.
    pub fn script_process(&self, script: ProcessScript) {
        self.world.lock().pending_process_scripts.push_back(script);
    }

    pub fn seed_field(&self, name: impl Into<String>) -> FieldDefinition {
        let mut world = self.world.lock();
        world.mint_field(name.into())
    }

    // Observation ---------------------------------------------------------

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn enumerate_calls(&self) -> usize {
        self.enumerate_calls.load(Ordering::SeqCst)
    }

    pub fn clone_requests(&self) -> Vec<CloneRequest> {
        self.world.lock().clone_requests.clone()
    }

    pub fn reconfigure_requests(&self) -> Vec<(MoRef, ReconfigureRequest)> {
        self.world.lock().reconfigure_requests.clone()
    }

    pub fn move_requests(&self) -> Vec<(MoRef, Vec<MoRef>)> {
        self.world.lock().move_requests.clone()
    }

    pub fn reboot_requests(&self) -> usize {
        self.world.lock().reboot_requests
    }

    pub fn defined_fields(&self) -> Vec<FieldDefinition> {
        self.world.lock().fields.clone()
    }

    pub fn field_value(&self, entity: &MoRef, key: i32) -> Option<String> {
        self.world
            .lock()
            .field_values
            .get(&(entity.clone(), key))
            .cloned()
    }

    pub fn started_programs(&self) -> Vec<StartedProgram> {
        self.world.lock().started_programs.clone()
    }

    /// URL under which [`GuestBackend::output_file_url`] exposes a guest
    /// file. Tests pair this with a map-backed fetcher.
    pub fn output_url(path: &str) -> String {
        format!("https://guest-files.invalid/transfer?path={}", path)
    }

    // ---------------------------------------------------------------------

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> Result<(), InventoryError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(InventoryError::BackendUnavailable(
                "injected backend failure".to_string(),
            ));
        }
        Ok(())
    }
}

impl World {
    fn mint_moref(&mut self, kind: EntityKind) -> MoRef {
        let prefix = match kind {
            EntityKind::VirtualMachine => "vm",
            EntityKind::Host => "host",
            EntityKind::Datastore => "datastore",
            EntityKind::Network => "network",
            EntityKind::Folder => "group",
        };
        let counter = self.next_moref.entry(prefix).or_insert(0);
        *counter += 1;
        MoRef::new(format!("{}-{}", prefix, counter))
    }

    fn mint_synthetic_uuid(&mut self) -> Uuid {
        self.next_synthetic_uuid += 1;
        let n = self.next_synthetic_uuid;
        Uuid::new(format!("{:08x}-0000-4000-8000-{:012x}", n, n))
    }

    fn mint_task(&mut self) -> TaskRef {
        self.next_task += 1;
        let task = TaskRef::new(format!("task-{}", self.next_task));
        let terminal = match &self.task_failure {
            Some(message) => TaskStatus::Error(message.clone()),
            None => TaskStatus::Success,
        };
        self.tasks.insert(
            task.as_str().to_string(),
            TaskState {
                polls_remaining: self.task_poll_delay,
                terminal,
            },
        );
        task
    }

    fn mint_field(&mut self, name: String) -> FieldDefinition {
        self.next_field_key += 1;
        let field = FieldDefinition {
            key: self.next_field_key,
            name,
        };
        self.fields.push(field.clone());
        field
    }

    fn entity_by_moref(&self, moref: &MoRef) -> Result<&EntityState, InventoryError> {
        self.entities
            .values()
            .find(|e| &e.moref == moref)
            .ok_or_else(|| stale(moref))
    }

    fn entity_by_moref_mut(&mut self, moref: &MoRef) -> Result<&mut EntityState, InventoryError> {
        self.entities
            .values_mut()
            .find(|e| &e.moref == moref)
            .ok_or_else(|| stale(moref))
    }
}

fn stale(moref: &MoRef) -> InventoryError {
    InventoryError::StaleReference(format!("{} is not present in the inventory", moref))
}

#[async_trait]
impl InventoryBackend for MemoryBackend {
    async fn fetch_by_uuid(
        &self,
        kind: EntityKind,
        uuid: &Uuid,
    ) -> Result<Option<EntityRecord>, InventoryError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;
        let world = self.world.lock();
        Ok(world
            .entities
            .get(uuid)
            .filter(|e| e.kind == kind)
            .map(EntityState::record))
    }

    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Vec<EntityRecord>, InventoryError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;
        let world = self.world.lock();
        let mut matches: Vec<EntityRecord> = world
            .entities
            .values()
            .filter(|e| e.kind == kind && e.name == name)
            .map(EntityState::record)
            .collect();
        matches.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(matches)
    }

    async fn enumerate_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, InventoryError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;
        let world = self.world.lock();
        let mut records: Vec<EntityRecord> = world
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .map(EntityState::record)
            .collect();
        records.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(records)
    }
}

#[async_trait]
impl ControlBackend for MemoryBackend {
    async fn power_state(&self, vm: &MoRef) -> Result<PowerState, InventoryError> {
        self.check_available()?;
        let world = self.world.lock();
        Ok(world.entity_by_moref(vm)?.power)
    }

    async fn guest_info(&self, vm: &MoRef) -> Result<GuestInfo, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let entity = world.entity_by_moref_mut(vm)?;
        Ok(entity.guest_script.pop_front().unwrap_or(entity.guest))
    }

    async fn power_on(&self, vm: &MoRef) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let tools = world.tools_after_power_on;
        let entity = world.entity_by_moref_mut(vm)?;
        entity.power = PowerState::PoweredOn;
        entity.guest = GuestInfo {
            tools,
            state: match tools {
                ToolsStatus::Running => GuestRunState::Running,
                _ => GuestRunState::NotRunning,
            },
        };
        Ok(world.mint_task())
    }

    async fn power_off(&self, vm: &MoRef) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let entity = world.entity_by_moref_mut(vm)?;
        entity.power = PowerState::PoweredOff;
        entity.guest = GuestInfo {
            tools: ToolsStatus::NotRunning,
            state: GuestRunState::NotRunning,
        };
        Ok(world.mint_task())
    }

    async fn shutdown_guest(&self, vm: &MoRef) -> Result<Option<TaskRef>, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        if world.ignore_shutdown {
            world.entity_by_moref(vm)?;
            return Ok(None);
        }
        let entity = world.entity_by_moref_mut(vm)?;
        entity.power = PowerState::PoweredOff;
        entity.guest = GuestInfo {
            tools: ToolsStatus::NotRunning,
            state: GuestRunState::NotRunning,
        };
        if world.shutdown_returns_task {
            Ok(Some(world.mint_task()))
        } else {
            Ok(None)
        }
    }

    async fn reboot_guest(&self, vm: &MoRef) -> Result<(), InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        world.reboot_requests += 1;
        if let Some((message, remaining)) = world.failing_reboots.take() {
            if remaining > 1 {
                world.failing_reboots = Some((message.clone(), remaining - 1));
            }
            if remaining > 0 {
                return Err(InventoryError::BadState(message));
            }
        }
        if world.ignore_reboot {
            world.entity_by_moref(vm)?;
            return Ok(());
        }
        let entity = world.entity_by_moref_mut(vm)?;
        // One observable dip, then the steady state reports the guest back up.
        entity.guest_script.push_back(GuestInfo {
            tools: ToolsStatus::NotRunning,
            state: GuestRunState::NotRunning,
        });
        entity.guest = GuestInfo {
            tools: ToolsStatus::Running,
            state: GuestRunState::Running,
        };
        Ok(())
    }

    async fn reset(&self, vm: &MoRef) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let entity = world.entity_by_moref_mut(vm)?;
        entity.power = PowerState::PoweredOn;
        entity.guest = GuestInfo {
            tools: ToolsStatus::Running,
            state: GuestRunState::Running,
        };
        Ok(world.mint_task())
    }

    async fn destroy(&self, vm: &MoRef) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let uuid = world.entity_by_moref(vm)?.uuid.clone();
        world.entities.remove(&uuid);
        Ok(world.mint_task())
    }

    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        world.entity_by_moref(&request.source)?;
        world.clone_requests.push(request.clone());
        let uuid = world.mint_synthetic_uuid();
        let moref = world.mint_moref(EntityKind::VirtualMachine);
        world.entities.insert(
            uuid.clone(),
            EntityState {
                kind: EntityKind::VirtualMachine,
                uuid,
                name: request.name.clone(),
                moref,
                attributes: serde_json::Value::Null,
                power: PowerState::PoweredOff,
                guest: GuestInfo {
                    tools: ToolsStatus::NotRunning,
                    state: GuestRunState::NotRunning,
                },
                guest_script: VecDeque::new(),
                in_maintenance: false,
            },
        );
        Ok(world.mint_task())
    }

    async fn reconfigure(
        &self,
        vm: &MoRef,
        request: &ReconfigureRequest,
    ) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        let entity = world.entity_by_moref_mut(vm)?;
        if entity.attributes.is_null() {
            entity.attributes = serde_json::json!({});
        }
        if let Some(object) = entity.attributes.as_object_mut() {
            if let Some(kb) = request.disk_capacity_kb {
                object.insert("disk_capacity_kb".to_string(), serde_json::json!(kb));
            }
            if let Some(annotation) = &request.annotation {
                object.insert("annotation".to_string(), serde_json::json!(annotation));
            }
        }
        world.reconfigure_requests.push((vm.clone(), request.clone()));
        Ok(world.mint_task())
    }

    async fn move_into(
        &self,
        folder: &MoRef,
        entities: &[MoRef],
    ) -> Result<TaskRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        world.entity_by_moref(folder)?;
        world.move_requests.push((folder.clone(), entities.to_vec()));
        Ok(world.mint_task())
    }

    async fn create_folder(&self, parent: &MoRef, name: &str) -> Result<MoRef, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        world.entity_by_moref(parent)?;
        if name.is_empty() || name.contains('/') {
            return Err(InventoryError::InvalidInput(format!(
                "Folder name {} is invalid",
                name
            )));
        }
        let duplicate = world
            .entities
            .values()
            .any(|e| e.kind == EntityKind::Folder && e.name == name);
        if duplicate {
            return Err(InventoryError::DuplicateEntity(format!(
                "Folder name {} already in use",
                name
            )));
        }
        let uuid = world.mint_synthetic_uuid();
        let moref = world.mint_moref(EntityKind::Folder);
        world.entities.insert(
            uuid.clone(),
            EntityState {
                kind: EntityKind::Folder,
                uuid,
                name: name.to_string(),
                moref: moref.clone(),
                attributes: serde_json::Value::Null,
                power: PowerState::PoweredOff,
                guest: GuestInfo {
                    tools: ToolsStatus::NotRunning,
                    state: GuestRunState::NotRunning,
                },
                guest_script: VecDeque::new(),
                in_maintenance: false,
            },
        );
        Ok(moref)
    }

    async fn available_fields(&self) -> Result<Vec<FieldDefinition>, InventoryError> {
        self.check_available()?;
        Ok(self.world.lock().fields.clone())
    }

    async fn define_field(&self, name: &str) -> Result<FieldDefinition, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        Ok(world.mint_field(name.to_string()))
    }

    async fn set_field(
        &self,
        entity: &MoRef,
        key: i32,
        value: &str,
    ) -> Result<(), InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        world.entity_by_moref(entity)?;
        if !world.fields.iter().any(|f| f.key == key) {
            return Err(InventoryError::BadState(format!(
                "no custom field with key {}",
                key
            )));
        }
        world.field_values.insert((entity.clone(), key), value.to_string());
        Ok(())
    }

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatus, InventoryError> {
        self.check_available()?;
        let mut world = self.world.lock();
        match world.tasks.get_mut(task.as_str()) {
            Some(state) => {
                if state.polls_remaining > 0 {
                    state.polls_remaining -= 1;
                    Ok(TaskStatus::Running)
                } else {
                    Ok(state.terminal.clone())
                }
            }
            None => Err(InventoryError::BadState(format!("unknown task {}", task))),
        }
    }

    async fn host_in_maintenance(&self, host: &MoRef) -> Result<bool, InventoryError> {
        self.check_available()?;
        let world = self.world.lock();
        Ok(world.entity_by_moref(host)?.in_maintenance)
    }
}

#[async_trait]
impl GuestBackend for MemoryBackend {
    async fn start_program(
        &self,
        vm: &MoRef,
        _credentials: &GuestCredentials,
        program_path: &str,
        arguments: &str,
    ) -> Result<i64, GuestError> {
        let mut world = self.world.lock();
        if world.entities.values().all(|e| &e.moref != vm) {
            return Err(GuestError::Failed(format!(
                "no guest reachable behind {}",
                vm
            )));
        }
        if world.return_pid_zero {
            return Ok(0);
        }
        world.next_pid += 1;
        let pid = world.next_pid;
        let script = world
            .pending_process_scripts
            .pop_front()
            .unwrap_or_default();
        world.processes.insert(
            pid,
            ProcessState {
                name: program_path.to_string(),
                polls_until_exit: script.polls_until_exit,
                exit_code: script.exit_code,
            },
        );
        world.started_programs.push(StartedProgram {
            vm: vm.clone(),
            program_path: program_path.to_string(),
            arguments: arguments.to_string(),
            pid,
        });
        Ok(pid)
    }

    async fn list_processes(
        &self,
        _vm: &MoRef,
        _credentials: &GuestCredentials,
        pids: &[i64],
    ) -> Result<Vec<GuestProcessInfo>, GuestError> {
        let mut world = self.world.lock();
        if world.no_process_info {
            return Ok(Vec::new());
        }
        let mut infos = Vec::new();
        for pid in pids {
            if let Some(process) = world.processes.get_mut(pid) {
                let exit_code = if process.polls_until_exit > 0 {
                    process.polls_until_exit -= 1;
                    None
                } else {
                    Some(process.exit_code)
                };
                infos.push(GuestProcessInfo {
                    pid: *pid,
                    name: process.name.clone(),
                    exit_code,
                });
            }
        }
        Ok(infos)
    }

    async fn output_file_url(
        &self,
        _vm: &MoRef,
        _credentials: &GuestCredentials,
        path: &str,
    ) -> Result<String, GuestError> {
        Ok(Self::output_url(path))
    }
}

/// Connector serving handles to one shared [`MemoryBackend`] world.
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    fail_connect: AtomicBool,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        MemoryConnector {
            backend,
            fail_connect: AtomicBool::new(false),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, settings: &SessionSettings) -> Result<BackendHandles, InventoryError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(InventoryError::BackendUnavailable(format!(
                "could not connect to {}:{}",
                settings.endpoint, settings.port
            )));
        }
        Ok(self.backend.handles())
    }
}
