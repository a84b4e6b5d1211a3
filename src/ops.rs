//! Named operations over resolved entities.
//!
//! An [`Operation`] is an async handler registered under a unique name and
//! invoked with JSON arguments. The [`OperationRegistry`] is a dispatch
//! table and nothing more: it neither inspects arguments nor rewrites
//! outcomes, so an operation's failure reaches the caller unchanged.
//!
//! Argument payloads may carry guest credentials and are therefore never
//! logged; dispatch logging sticks to operation names.

pub mod fields;
pub mod folder;
pub mod guest;
pub mod power;
pub mod provision;

use crate::backend::{ControlBackend, GuestBackend};
use crate::cache::ObjectCache;
use crate::error::InventoryError;
use crate::handle::ManagedObjectHandle;
use crate::session::{Session, WaitPolicy};
use crate::types::{EntityKind, Uuid};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Everything one invocation may touch: the shared cache and the session
/// it resolves against. Built per call, dropped when the call returns,
/// never stored inside an operation.
pub struct OperationContext<'a> {
    cache: &'a ObjectCache,
    session: &'a Session,
}

impl<'a> OperationContext<'a> {
    pub fn new(cache: &'a ObjectCache, session: &'a Session) -> Self {
        OperationContext { cache, session }
    }

    pub fn cache(&self) -> &ObjectCache {
        self.cache
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn control(&self) -> &Arc<dyn ControlBackend> {
        self.session.control()
    }

    pub fn guest(&self) -> &Arc<dyn GuestBackend> {
        self.session.guest()
    }

    pub fn waits(&self) -> &WaitPolicy {
        self.session.waits()
    }

    /// Shape-dispatched resolution through the shared cache.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        identifier: &str,
    ) -> Result<ManagedObjectHandle, InventoryError> {
        self.cache.resolve(kind, identifier).await
    }

    /// Force re-fetch of an entity this operation suspects went stale.
    pub async fn refresh(&self, uuid: &Uuid) -> Result<ManagedObjectHandle, InventoryError> {
        self.cache.refresh(uuid).await
    }
}

/// A named, invocable action.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Registry name, unique per registry.
    fn name(&self) -> &str;

    async fn call(
        &self,
        ctx: &OperationContext<'_>,
        args: Value,
    ) -> Result<Value, InventoryError>;
}

/// Name-keyed dispatch table.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    /// An empty registry. Most callers want
    /// [`OperationRegistry::with_builtin_operations`].
    pub fn new() -> Self {
        OperationRegistry::default()
    }

    /// A registry preloaded with every built-in operation.
    pub fn with_builtin_operations() -> Self {
        let mut registry = OperationRegistry::default();
        for operation in builtin_operations() {
            // Built-in names are distinct by construction.
            registry
                .operations
                .insert(operation.name().to_string(), operation);
        }
        registry
    }

    /// Register an operation under its own name. A name already taken is
    /// rejected; the existing registration stays in place.
    pub fn register(&mut self, operation: Arc<dyn Operation>) -> Result<(), InventoryError> {
        match self.operations.entry(operation.name().to_string()) {
            Entry::Occupied(entry) => {
                Err(InventoryError::DuplicateOperation(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                debug!(operation = %entry.key(), "Registered operation");
                entry.insert(operation);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Operation>> {
        self.operations.get(name)
    }

    /// Registered names, sorted for stable listings.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Look up `name` and run it. The operation's outcome, success or
    /// failure, passes through untouched.
    pub async fn invoke(
        &self,
        ctx: &OperationContext<'_>,
        name: &str,
        args: Value,
    ) -> Result<Value, InventoryError> {
        let operation = match self.operations.get(name) {
            Some(operation) => operation.clone(),
            None => return Err(InventoryError::UnknownOperation(name.to_string())),
        };
        debug!(operation = %name, "Dispatching operation");
        match operation.call(ctx, args).await {
            Ok(result) => {
                debug!(operation = %name, "Operation completed");
                Ok(result)
            }
            Err(err) => {
                error!(operation = %name, error = %err, "Operation failed");
                Err(err)
            }
        }
    }
}

fn builtin_operations() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(power::QueryPowerState),
        Arc::new(power::PowerOn),
        Arc::new(power::PowerOff),
        Arc::new(power::Restart),
        Arc::new(provision::Destroy),
        Arc::new(provision::CloneVm),
        Arc::new(provision::Reconfigure),
        Arc::new(folder::CreateFolder),
        Arc::new(folder::MoveToFolder),
        Arc::new(fields::SetCustomField),
        Arc::new(guest::RunInGuest),
    ]
}

// Argument extraction shared by the operation implementations.

pub(crate) fn required_str<'v>(args: &'v Value, key: &str) -> Result<&'v str, InventoryError> {
    match args.get(key).and_then(Value::as_str) {
        Some(value) => Ok(value),
        None => Err(InventoryError::InvalidInput(format!(
            "operation argument '{}' must be a string",
            key
        ))),
    }
}

pub(crate) fn optional_str<'v>(args: &'v Value, key: &str) -> Option<&'v str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn optional_bool(args: &Value, key: &str) -> Result<bool, InventoryError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(InventoryError::InvalidInput(format!(
            "operation argument '{}' must be a boolean",
            key
        ))),
    }
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>, InventoryError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(number) => Ok(Some(number)),
            None => Err(InventoryError::InvalidInput(format!(
                "operation argument '{}' must be an unsigned integer",
                key
            ))),
        },
    }
}

pub(crate) fn optional_str_array(args: &Value, key: &str) -> Result<Vec<String>, InventoryError> {
    let not_strings = || {
        InventoryError::InvalidInput(format!(
            "operation argument '{}' must be an array of strings",
            key
        ))
    };
    match args.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(not_strings))
            .collect(),
        Some(_) => Err(not_strings()),
    }
}
