//! Custom-field updates.
//!
//! The field named `Notes` is special: it is not a custom field at all but
//! the VM's annotation, written through a reconfigure task. Everything else
//! goes through the backend's field definitions, matched loosely the way
//! frontend systems name them (several spellings of the email and account
//! fields exist in the wild), defining the field when no definition
//! matches.

use super::{required_str, Operation, OperationContext};
use crate::backend::{FieldDefinition, ReconfigureRequest};
use crate::error::InventoryError;
use crate::handle::ManagedObjectHandle;
use crate::task;
use crate::types::EntityKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

/// `set-custom-field`: set a named field (or the annotation) on a VM.
pub struct SetCustomField;

#[async_trait]
impl Operation for SetCustomField {
    fn name(&self) -> &str {
        "set-custom-field"
    }

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let identifier = required_str(&args, "vm")?;
        let field = required_str(&args, "field")?;
        let value = required_str(&args, "value")?;

        let handle = ctx.resolve(EntityKind::VirtualMachine, identifier).await?;
        if field == "Notes" {
            write_annotation(ctx, &handle, value).await?;
        } else {
            write_field(ctx, &handle, field, value).await?;
        }

        Ok(json!({
            "vm": handle.name(),
            "field": field,
            "updated": true,
        }))
    }
}

async fn write_annotation(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
    value: &str,
) -> Result<(), InventoryError> {
    let waits = ctx.waits();
    info!(vm = handle.name(), "Writing annotation");
    let request = ReconfigureRequest {
        annotation: Some(value.to_string()),
        ..ReconfigureRequest::default()
    };
    let task = ctx
        .control()
        .reconfigure(handle.moref(), &request)
        .await
        .map_err(bad_state)?;
    task::wait_for_completion(
        ctx.control().as_ref(),
        &task,
        waits.task_poll(),
        waits.task_timeout(),
    )
    .await
    .map_err(bad_state)
}

async fn write_field(
    ctx: &OperationContext<'_>,
    handle: &ManagedObjectHandle,
    field: &str,
    value: &str,
) -> Result<(), InventoryError> {
    let definitions = ctx.control().available_fields().await.map_err(bad_state)?;
    let definition = match find_definition(&definitions, field) {
        Some(definition) => definition.clone(),
        None => {
            debug!(field, "No matching field definition; defining it");
            ctx.control().define_field(field).await.map_err(bad_state)?
        }
    };
    info!(vm = handle.name(), field, key = definition.key, "Setting custom field");
    ctx.control()
        .set_field(handle.moref(), definition.key, value)
        .await
        .map_err(bad_state)
}

/// Loose field matching: email-ish and account-ish names match the first
/// definition of their family, anything else matches by case-insensitive
/// equality.
fn find_definition<'d>(
    definitions: &'d [FieldDefinition],
    requested: &str,
) -> Option<&'d FieldDefinition> {
    let lowered = requested.to_lowercase();
    if lowered.contains("email") {
        definitions
            .iter()
            .find(|d| d.name.to_lowercase().contains("email"))
    } else if lowered.contains("account") {
        definitions
            .iter()
            .find(|d| d.name.to_lowercase().contains("account"))
    } else {
        definitions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(requested))
    }
}

fn bad_state(err: InventoryError) -> InventoryError {
    match err {
        InventoryError::BadState(_) => err,
        other => InventoryError::BadState(other.to_string()),
    }
}
