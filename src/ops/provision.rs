//! Provisioning operations: clone, reconfigure, destroy.

use super::{optional_str, optional_u64, power, required_str, Operation, OperationContext};
use crate::backend::{CloneRequest, NetworkAttachment, PowerState, ReconfigureRequest};
use crate::cache::ResolveOptions;
use crate::error::InventoryError;
use crate::names;
use crate::task;
use crate::types::EntityKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

/// `destroy`: power a VM off if needed, destroy it, and drop it from the
/// cache.
pub struct Destroy;

#[async_trait]
impl Operation for Destroy {
    fn name(&self) -> &str {
        "destroy"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        let waits = ctx.waits();

        // Only poweredOff counts as off; a suspended VM still gets the
        // hard power-off before destruction.
        let state = ctx.control().power_state(handle.moref()).await?;
        if state != PowerState::PoweredOff {
            debug!(vm = handle.name(), state = %state, "Powering off before destroy");
            power::hard_power_off(ctx, &handle).await?;
        }

        info!(vm = handle.name(), uuid = %handle.uuid(), "Destroying");
        let task = ctx.control().destroy(handle.moref()).await?;
        task::wait_for_completion(
            ctx.control().as_ref(),
            &task,
            waits.task_poll(),
            waits.task_timeout(),
        )
        .await?;
        ctx.cache().invalidate(handle.uuid());

        Ok(json!({
            "vm": handle.name(),
            "uuid": handle.uuid().as_str(),
            "destroyed": true,
        }))
    }
}

/// `clone`: clone a template VM onto a host, datastore, and folder, then
/// resolve the newcomer.
pub struct CloneVm;

#[async_trait]
impl Operation for CloneVm {
    fn name(&self) -> &str {
        "clone"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let template_id = required_str(&args, "template")?;
        let host_id = required_str(&args, "host")?;
        let datastore_id = required_str(&args, "datastore")?;
        let folder_id = required_str(&args, "folder")?;
        let requested_name = required_str(&args, "name")?;
        let waits = ctx.waits();

        let template = ctx.resolve(EntityKind::VirtualMachine, template_id).await?;
        let host = ctx.resolve(EntityKind::Host, host_id).await?;
        if ctx.control().host_in_maintenance(host.moref()).await? {
            return Err(InventoryError::BadState(format!(
                "host {} is in maintenance mode",
                host.name()
            )));
        }
        let datastore = ctx.resolve(EntityKind::Datastore, datastore_id).await?;
        let folder = ctx.resolve(EntityKind::Folder, folder_id).await?;
        let name = names::backend_safe(requested_name);

        info!(
            template = template.name(),
            name = %name,
            host = host.name(),
            "Cloning"
        );
        let request = CloneRequest {
            source: template.moref().clone(),
            name: name.clone(),
            folder: folder.moref().clone(),
            host: host.moref().clone(),
            datastore: datastore.moref().clone(),
        };
        let task = ctx.control().clone_vm(&request).await?;
        task::wait_for_completion(
            ctx.control().as_ref(),
            &task,
            waits.task_poll(),
            waits.clone_timeout(),
        )
        .await
        .map_err(|err| as_bad_state("clone task", err))?;

        let new_vm = ctx
            .cache()
            .resolve_by_name(EntityKind::VirtualMachine, &name, ResolveOptions::default())
            .await?;
        Ok(json!({
            "name": new_vm.name(),
            "uuid": new_vm.uuid().as_str(),
        }))
    }
}

/// `reconfigure`: change CPU count, memory, disk size, or network of a VM
/// in one backend task. Disks only grow.
pub struct Reconfigure;

#[async_trait]
impl Operation for Reconfigure {
    fn name(&self) -> &str {
        "reconfigure"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let vcpus = optional_u64(&args, "vcpus")?;
        let memory_mb = optional_u64(&args, "memory_mb")?;
        let disk_gb = optional_u64(&args, "disk_gb")?;
        let network_id = optional_str(&args, "network");
        if vcpus.is_none() && memory_mb.is_none() && disk_gb.is_none() && network_id.is_none() {
            return Err(InventoryError::InvalidInput(
                "nothing to reconfigure: pass vcpus, memory_mb, disk_gb, or network".to_string(),
            ));
        }
        let waits = ctx.waits();
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;

        let mut request = ReconfigureRequest::default();
        if let Some(count) = vcpus {
            request.num_cpus = Some(u32::try_from(count).map_err(|_| {
                InventoryError::InvalidInput(
                    "operation argument 'vcpus' is out of range".to_string(),
                )
            })?);
        }
        request.memory_mb = memory_mb;
        if let Some(requested_gb) = disk_gb {
            let requested_kb = requested_gb * 1024 * 1024;
            let current_kb = handle
                .payload()
                .attribute("disk_capacity_kb")
                .and_then(Value::as_u64);
            match current_kb {
                None => {
                    return Err(InventoryError::BadState(format!(
                        "{} has no disk to resize",
                        handle.name()
                    )))
                }
                Some(current) if requested_kb > current => {
                    request.disk_capacity_kb = Some(requested_kb);
                }
                Some(current) => {
                    debug!(
                        vm = handle.name(),
                        requested_kb,
                        current_kb = current,
                        "Requested disk size does not grow the disk; skipping"
                    );
                }
            }
        }
        if let Some(network_id) = network_id {
            let network = ctx.resolve(EntityKind::Network, network_id).await?;
            request.network = Some(NetworkAttachment {
                network: network.moref().clone(),
                name: network.name().to_string(),
            });
        }

        info!(vm = handle.name(), "Reconfiguring");
        let task = ctx.control().reconfigure(handle.moref(), &request).await?;
        task::wait_for_completion(
            ctx.control().as_ref(),
            &task,
            waits.task_poll(),
            waits.task_timeout(),
        )
        .await?;

        Ok(json!({
            "vm": handle.name(),
            "reconfigured": true,
        }))
    }
}

/// The provisioning task protocol reports failures as bad state, naming
/// what the backend said.
pub(crate) fn as_bad_state(what: &str, err: InventoryError) -> InventoryError {
    match err {
        InventoryError::TaskFailed { message, .. } => {
            InventoryError::BadState(format!("{} failed: {}", what, message))
        }
        other => other,
    }
}
