//! Identity vocabulary shared across the cache, the backends, and the
//! operation layer: entity kinds, UUIDs, managed-object references, and the
//! records backends return.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of managed entity the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    VirtualMachine,
    Host,
    Datastore,
    Network,
    Folder,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The backend's own type vocabulary, as it appears in logs and faults.
        let name = match self {
            EntityKind::VirtualMachine => "VirtualMachine",
            EntityKind::Host => "HostSystem",
            EntityKind::Datastore => "Datastore",
            EntityKind::Network => "Network",
            EntityKind::Folder => "Folder",
        };
        write!(f, "{}", name)
    }
}

/// Backend-assigned instance UUID. Stable for the lifetime of an entity.
///
/// UUIDs originate at the backend; this layer only stores, compares, and
/// orders them, so the inner representation stays the backend's own string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uuid(String);

impl Uuid {
    pub fn new(value: impl Into<String>) -> Self {
        Uuid(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recognizes the canonical 8-4-4-4-12 hex shape. Used to decide whether
    /// an identifier should resolve by UUID or by name.
    pub fn is_canonical(candidate: &str) -> bool {
        const GROUP_LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];
        let mut groups = 0;
        for (index, group) in candidate.split('-').enumerate() {
            if index >= GROUP_LENGTHS.len()
                || group.len() != GROUP_LENGTHS[index]
                || !group.chars().all(|c| c.is_ascii_hexdigit())
            {
                return false;
            }
            groups = index + 1;
        }
        groups == GROUP_LENGTHS.len()
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uuid {
    fn from(value: &str) -> Self {
        Uuid(value.to_string())
    }
}

impl From<String> for Uuid {
    fn from(value: String) -> Self {
        Uuid(value)
    }
}

impl AsRef<str> for Uuid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque managed-object reference token, e.g. `vm-1042`. Control-plane
/// calls address entities by this, never by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoRef(String);

impl MoRef {
    pub fn new(value: impl Into<String>) -> Self {
        MoRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MoRef {
    fn from(value: &str) -> Self {
        MoRef(value.to_string())
    }
}

/// Backend-specific object payload: the managed-object reference plus the
/// property bag the backend's collector returned for it.
///
/// Payloads are never mutated in place; a refresh replaces the whole handle
/// that carries one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub moref: MoRef,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EntityPayload {
    pub fn new(moref: MoRef) -> Self {
        EntityPayload {
            moref,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_attributes(moref: MoRef, attributes: serde_json::Value) -> Self {
        EntityPayload { moref, attributes }
    }

    /// Single collected property, if the backend returned it.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

/// What every inventory capability call returns, uniform across
/// fetch-by-UUID, find-by-name, and enumeration so a handle can be built
/// from any of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub uuid: Uuid,
    pub name: String,
    pub payload: EntityPayload,
}

impl EntityRecord {
    pub fn new(uuid: impl Into<Uuid>, name: impl Into<String>, payload: EntityPayload) -> Self {
        EntityRecord {
            uuid: uuid.into(),
            name: name.into(),
            payload,
        }
    }
}
