//! In-guest command execution as an operation.

use super::{
    optional_str, optional_str_array, optional_u64, required_str, Operation, OperationContext,
};
use crate::backend::GuestCredentials;
use crate::error::InventoryError;
use crate::guest::{GuestCommand, GuestInterface};
use crate::types::EntityKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// `run-in-guest`: run a program inside a VM's guest OS and report the
/// pid once the command is judged successful.
pub struct RunInGuest;

#[async_trait]
impl Operation for RunInGuest {
    fn name(&self) -> &str {
        "run-in-guest"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let username = required_str(&args, "username")?;
        let password = required_str(&args, "password")?;
        let program = required_str(&args, "program")?;

        let mut command = GuestCommand::new(program);
        if let Some(arguments) = optional_str(&args, "arguments") {
            command = command.with_arguments(arguments);
        }
        if let Some(output_file) = optional_str(&args, "output_file") {
            command = command.with_output_file(output_file);
        }
        command = command.with_success_outputs(optional_str_array(&args, "success_outputs")?);
        if let Some(timeout_secs) = optional_u64(&args, "timeout_secs")? {
            command = command.with_timeout(Duration::from_secs(timeout_secs));
        }
        if let Some(description) = optional_str(&args, "description") {
            command = command.with_description(description);
        }

        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        info!(vm = handle.name(), command = %command, "Running guest command");
        let interface = GuestInterface::new(
            ctx.session(),
            handle.clone(),
            GuestCredentials::new(username, password),
        )?;
        let pid = interface.run(&command).await?;

        Ok(json!({
            "vm": handle.name(),
            "pid": pid,
            "succeeded": true,
        }))
    }
}
