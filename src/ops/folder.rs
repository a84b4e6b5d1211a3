//! Folder operations.

use super::provision::as_bad_state;
use super::{required_str, Operation, OperationContext};
use crate::error::InventoryError;
use crate::names;
use crate::task;
use crate::types::EntityKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::slice;
use tracing::info;

/// `create-folder`: create a named child folder under an existing one.
pub struct CreateFolder;

#[async_trait]
impl Operation for CreateFolder {
    fn name(&self) -> &str {
        "create-folder"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let parent_id = required_str(&args, "parent")?;
        let requested = required_str(&args, "name")?;

        let parent = ctx.resolve(EntityKind::Folder, parent_id).await?;
        let name = names::backend_safe(requested);
        let moref = ctx.control().create_folder(parent.moref(), &name).await?;
        info!(parent = parent.name(), name = %name, moref = %moref, "Created folder");

        Ok(json!({
            "name": name,
            "moref": moref.as_str(),
        }))
    }
}

/// `move-to-folder`: move a VM into a folder.
pub struct MoveToFolder;

#[async_trait]
impl Operation for MoveToFolder {
    fn name(&self) -> &str {
        "move-to-folder"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let vm_id = required_str(&args, "vm")?;
        let folder_id = required_str(&args, "folder")?;
        let waits = ctx.waits();

        let vm = ctx.resolve(EntityKind::VirtualMachine, vm_id).await?;
        let folder = ctx.resolve(EntityKind::Folder, folder_id).await?;

        info!(vm = vm.name(), folder = folder.name(), "Moving into folder");
        let task = ctx
            .control()
            .move_into(folder.moref(), slice::from_ref(vm.moref()))
            .await?;
        task::wait_for_completion(
            ctx.control().as_ref(),
            &task,
            waits.task_poll(),
            waits.task_timeout(),
        )
        .await
        .map_err(|err| as_bad_state("move task", err))?;

        Ok(json!({
            "vm": vm.name(),
            "folder": folder.name(),
            "moved": true,
        }))
    }
}
