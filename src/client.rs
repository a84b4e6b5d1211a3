//! Session-scoped facade over the cache and the operation registry.

use crate::backend::{Connector, GuestCredentials};
use crate::cache::{ObjectCache, ResolveOptions, Snapshot};
use crate::error::InventoryError;
use crate::guest::GuestInterface;
use crate::handle::ManagedObjectHandle;
use crate::ops::{Operation, OperationContext, OperationRegistry};
use crate::session::{Session, SessionSettings};
use crate::types::{EntityKind, Uuid};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// One backend session plus the cache and operations bound to it.
///
/// The client carries no logic of its own: resolution delegates to the
/// [`ObjectCache`], operations to the [`OperationRegistry`], and each
/// `invoke` call wires the two together through one
/// [`OperationContext`].
pub struct Client {
    session: Arc<Session>,
    cache: ObjectCache,
    registry: OperationRegistry,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// A client over an established session, with the built-in operations
    /// registered.
    pub fn new(session: Arc<Session>) -> Self {
        Client::with_registry(session, OperationRegistry::with_builtin_operations())
    }

    /// A client with a caller-assembled registry, for embedders that want
    /// a different operation set.
    pub fn with_registry(session: Arc<Session>, registry: OperationRegistry) -> Self {
        let cache = ObjectCache::new(session.clone());
        Client {
            session,
            cache,
            registry,
        }
    }

    /// Connect through `connector` and wrap the session in a fresh client.
    pub async fn establish(
        connector: &dyn Connector,
        settings: SessionSettings,
    ) -> Result<Self, InventoryError> {
        let session = Session::establish(connector, settings).await?;
        Ok(Client::new(Arc::new(session)))
    }

    /// Resolve an entity by identifier shape; see [`ObjectCache::resolve`].
    pub async fn resolve(
        &self,
        kind: EntityKind,
        identifier: &str,
    ) -> Result<ManagedObjectHandle, InventoryError> {
        self.cache.resolve(kind, identifier).await
    }

    pub async fn resolve_with(
        &self,
        kind: EntityKind,
        identifier: &str,
        opts: ResolveOptions,
    ) -> Result<ManagedObjectHandle, InventoryError> {
        self.cache.resolve_with(kind, identifier, opts).await
    }

    /// Warm the cache with every entity of a kind; returns how many the
    /// backend reported.
    pub async fn preload(&self, kind: EntityKind) -> Result<usize, InventoryError> {
        self.cache.preload_all(kind).await
    }

    pub async fn refresh(&self, uuid: &Uuid) -> Result<ManagedObjectHandle, InventoryError> {
        self.cache.refresh(uuid).await
    }

    pub fn invalidate(&self, uuid: &Uuid) -> bool {
        self.cache.invalidate(uuid)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.cache.snapshot()
    }

    /// Run a registered operation against this session.
    pub async fn invoke(&self, operation: &str, args: Value) -> Result<Value, InventoryError> {
        let ctx = OperationContext::new(&self.cache, &self.session);
        self.registry.invoke(&ctx, operation, args).await
    }

    /// Add a caller-defined operation. Fails with
    /// [`InventoryError::DuplicateOperation`] when the name is taken.
    pub fn register_operation(
        &mut self,
        operation: Arc<dyn Operation>,
    ) -> Result<(), InventoryError> {
        self.registry.register(operation)
    }

    /// A guest command runner for one VM, resolving the VM through this
    /// client's cache.
    pub async fn guest_interface(
        &self,
        identifier: &str,
        credentials: GuestCredentials,
    ) -> Result<GuestInterface, InventoryError> {
        let handle = self
            .cache
            .resolve(EntityKind::VirtualMachine, identifier)
            .await?;
        GuestInterface::new(&self.session, handle, credentials)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}
