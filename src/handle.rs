//! Immutable handle to one resolved entity.

use crate::types::{EntityKind, EntityPayload, EntityRecord, MoRef, Uuid};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Immutable-identity wrapper around one resolved entity: its kind, UUID,
/// last-known name, backend payload, and the time it was fetched.
///
/// Handles never perform I/O; all backend interaction goes through the cache
/// or the session. The UUID never changes for the lifetime of the handle,
/// the name is last-known and may go stale, and the payload is never mutated
/// in place. A refresh produces a replacement handle, so clones of an old
/// handle keep observing a coherent point-in-time snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedObjectHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug, PartialEq)]
struct HandleInner {
    kind: EntityKind,
    uuid: Uuid,
    name: String,
    payload: EntityPayload,
    fetched_at: DateTime<Utc>,
}

impl ManagedObjectHandle {
    /// Build a handle from a freshly fetched record, stamped now.
    pub fn new(kind: EntityKind, uuid: Uuid, name: impl Into<String>, payload: EntityPayload) -> Self {
        ManagedObjectHandle {
            inner: Arc::new(HandleInner {
                kind,
                uuid,
                name: name.into(),
                payload,
                fetched_at: Utc::now(),
            }),
        }
    }

    pub(crate) fn from_record(kind: EntityKind, record: EntityRecord) -> Self {
        ManagedObjectHandle::new(kind, record.uuid, record.name, record.payload)
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    pub fn uuid(&self) -> &Uuid {
        &self.inner.uuid
    }

    /// Last-known name. Only a refresh (which replaces the handle) can
    /// observe a rename.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn payload(&self) -> &EntityPayload {
        &self.inner.payload
    }

    /// The managed-object reference inside the payload, which control-plane
    /// calls address.
    pub fn moref(&self) -> &MoRef {
        &self.inner.payload.moref
    }

    /// When this handle was last fetched from the backend.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.inner.fetched_at
    }

    /// Time since the last successful fetch, saturating at zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.inner.fetched_at)
            .to_std()
            .unwrap_or_default()
    }
}
