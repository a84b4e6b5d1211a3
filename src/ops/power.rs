//! Power lifecycle operations.
//!
//! The soft paths negotiate with the guest OS and therefore poll: a guest
//! shutdown may or may not produce a task, a reboot is only believed once
//! the in-guest agent drops, and a state that stalls too long triggers a
//! re-fetch of the entity in case the cached reference went stale.

use super::{optional_bool, required_str, Operation, OperationContext};
use crate::backend::{GuestRunState, PowerState, ToolsStatus};
use crate::error::{GuestError, InventoryError};
use crate::handle::ManagedObjectHandle;
use crate::task;
use crate::types::EntityKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

/// `power-state`: report the backend's power state for a VM.
pub struct QueryPowerState;

#[async_trait]
impl Operation for QueryPowerState {
    fn name(&self) -> &str {
        "power-state"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        let state = ctx.control().power_state(handle.moref()).await?;
        Ok(json!({
            "vm": handle.name(),
            "uuid": handle.uuid().as_str(),
            "power_state": state.to_string(),
        }))
    }
}

/// `power-on`: power a VM on and wait until its in-guest agent reports
/// running.
pub struct PowerOn;

#[async_trait]
impl Operation for PowerOn {
    fn name(&self) -> &str {
        "power-on"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        let waits = ctx.waits();

        debug!(vm = handle.name(), "Powering on");
        let task = ctx.control().power_on(handle.moref()).await?;
        task::wait_for_completion(
            ctx.control().as_ref(),
            &task,
            waits.task_poll(),
            waits.task_timeout(),
        )
        .await?;
        let handle = wait_for_tools(ctx, &handle).await?;

        Ok(json!({
            "vm": handle.name(),
            "power_state": PowerState::PoweredOn.to_string(),
        }))
    }
}

/// `power-off`: stop a VM. The default path asks the guest OS to shut
/// down; `"hard": true` cuts power through the backend instead.
pub struct PowerOff;

#[async_trait]
impl Operation for PowerOff {
    fn name(&self) -> &str {
        "power-off"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let hard = optional_bool(&args, "hard")?;
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;

        if hard {
            hard_power_off(ctx, &handle).await?;
        } else {
            soft_power_off(ctx, &handle).await?;
        }

        Ok(json!({
            "vm": handle.name(),
            "power_state": PowerState::PoweredOff.to_string(),
        }))
    }
}

/// `restart`: reboot a VM. The default path reboots through the guest OS
/// and follows it back up; `"hard": true` resets through the backend.
pub struct Restart;

#[async_trait]
impl Operation for Restart {
    fn name(&self) -> &str {
        "restart"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let hard = optional_bool(&args, "hard")?;
        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        let waits = ctx.waits();

        if hard {
            debug!(vm = handle.name(), "Resetting");
            let task = ctx.control().reset(handle.moref()).await?;
            task::wait_for_completion(
                ctx.control().as_ref(),
                &task,
                waits.task_poll(),
                waits.task_timeout(),
            )
            .await?;
        } else {
            soft_restart(ctx, &handle).await?;
        }

        Ok(json!({
            "vm": handle.name(),
            "power_state": PowerState::PoweredOn.to_string(),
        }))
    }
}

pub(crate) async fn hard_power_off(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let waits = ctx.waits();
    debug!(vm = handle.name(), "Powering off");
    let task = ctx.control().power_off(handle.moref()).await?;
    task::wait_for_completion(
        ctx.control().as_ref(),
        &task,
        waits.task_poll(),
        waits.task_timeout(),
    )
    .await
}

async fn soft_power_off(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let waits = ctx.waits();
    debug!(vm = handle.name(), "Requesting guest shutdown");
    match ctx.control().shutdown_guest(handle.moref()).await? {
        Some(task) => {
            task::wait_for_completion(
                ctx.control().as_ref(),
                &task,
                waits.task_poll(),
                Some(waits.soft_off_timeout()),
            )
            .await
        }
        // No task to watch; give the guest a moment, then poll power state
        // ourselves.
        None => {
            tokio::time::sleep(waits.soft_off_grace()).await;
            let mut handle = handle.clone();
            let mut refreshes = 0u32;
            let mut stall = Instant::now();
            loop {
                let state = ctx.control().power_state(handle.moref()).await?;
                if state == PowerState::PoweredOff {
                    debug!(vm = handle.name(), "Guest shut down");
                    return Ok(());
                }
                if stall.elapsed() >= waits.stall_window() {
                    if refreshes >= waits.power_off_refresh_limit {
                        return Err(InventoryError::Timeout(format!(
                            "{} did not power off after {} re-fetches",
                            handle.name(),
                            refreshes
                        )));
                    }
                    handle = ctx.refresh(handle.uuid()).await?;
                    refreshes += 1;
                    stall = Instant::now();
                }
                tokio::time::sleep(waits.state_poll()).await;
            }
        }
    }
}

async fn soft_restart(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let waits = ctx.waits();
    let guest = ctx.control().guest_info(handle.moref()).await?;
    if guest.tools != ToolsStatus::Running {
        return Err(InventoryError::BadState(format!(
            "cannot reboot {}: in-guest agent is {:?}",
            handle.name(),
            guest.tools
        )));
    }

    for attempt in 1..=waits.reboot_attempts {
        request_reboot(ctx, handle).await?;
        observe_reboot_start(ctx, handle).await?;
        match wait_for_guest_running(ctx, handle).await {
            Ok(()) => {
                wait_for_tools(ctx, handle).await?;
                return Ok(());
            }
            Err(InventoryError::Guest(GuestError::Timeout(_))) => {
                warn!(
                    vm = handle.name(),
                    attempt,
                    "Guest did not report running after reboot; trying again"
                );
            }
            Err(other) => return Err(other),
        }
    }
    Err(InventoryError::Guest(GuestError::Failed(format!(
        "{} repeatedly failed to come back from reboot",
        handle.name()
    ))))
}

/// Issue the reboot request, retrying the backend's transient invalid-fault
/// rejection. Any other rejection is final.
async fn request_reboot(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let waits = ctx.waits();
    let mut tries = 0u32;
    loop {
        match ctx.control().reboot_guest(handle.moref()).await {
            Ok(()) => {
                debug!(vm = handle.name(), "Reboot requested");
                return Ok(());
            }
            Err(err) if is_invalid_fault(&err) && tries + 1 < waits.reboot_attempts => {
                tries += 1;
                warn!(
                    vm = handle.name(),
                    tries,
                    error = %err,
                    "Reboot request rejected; retrying"
                );
                tokio::time::sleep(waits.reboot_retry_delay()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_invalid_fault(err: &InventoryError) -> bool {
    match err {
        InventoryError::BadState(message) => {
            message.to_ascii_lowercase().contains("invalid fault")
        }
        _ => false,
    }
}

/// A reboot is only believed once the guest visibly goes down.
async fn observe_reboot_start(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let deadline = Instant::now() + ctx.waits().reboot_observe();
    loop {
        let guest = ctx.control().guest_info(handle.moref()).await?;
        if guest.tools != ToolsStatus::Running || guest.state != GuestRunState::Running {
            debug!(vm = handle.name(), "Guest went down for reboot");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(InventoryError::BadState(format!(
                "{} refused to reboot",
                handle.name()
            )));
        }
        tokio::time::sleep(ctx.waits().state_poll()).await;
    }
}

async fn wait_for_guest_running(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<(), InventoryError> {
    let deadline = Instant::now() + ctx.waits().guest_state_timeout();
    loop {
        let guest = ctx.control().guest_info(handle.moref()).await?;
        if guest.state == GuestRunState::Running {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(InventoryError::Guest(GuestError::Timeout(format!(
                "guest OS on {} did not report running",
                handle.name()
            ))));
        }
        tokio::time::sleep(ctx.waits().state_poll()).await;
    }
}

/// Poll until the in-guest agent reports running, re-fetching the entity
/// whenever the state stalls for a whole window. Returns the freshest
/// handle seen.
async fn wait_for_tools(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
) -> Result<ManagedObjectHandle, InventoryError> {
    let waits = ctx.waits();
    let mut handle = handle.clone();
    let mut refreshes = 0u32;
    let mut stall = Instant::now();
    loop {
        let guest = ctx.control().guest_info(handle.moref()).await?;
        if guest.tools == ToolsStatus::Running {
            debug!(vm = handle.name(), "In-guest agent is up");
            return Ok(handle);
        }
        if stall.elapsed() >= waits.stall_window() {
            if refreshes >= waits.tools_refresh_limit {
                return Err(InventoryError::Timeout(format!(
                    "in-guest agent on {} never came up",
                    handle.name()
                )));
            }
            handle = ctx.refresh(handle.uuid()).await?;
            refreshes += 1;
            stall = Instant::now();
        }
        tokio::time::sleep(waits.state_poll()).await;
    }
}
