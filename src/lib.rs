//! Purser: identity-first inventory resolution and control
//!
//! A client library for driving a virtualization backend through stable
//! instance UUIDs rather than display names. A dual-keyed cache resolves
//! identifiers to live entity handles, coalescing concurrent lookups;
//! named operations (power, provisioning, folders, custom fields, guest
//! commands) run against the resolved handles through one session.

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod guest;
pub mod handle;
pub mod logging;
pub mod names;
pub mod ops;
pub mod session;
pub mod task;
pub mod types;

pub use cache::{ObjectCache, ResolveOptions, Snapshot};
pub use client::Client;
pub use config::{ConfigLoader, ConfigManager, PurserConfig};
pub use error::{GuestError, InventoryError};
pub use handle::ManagedObjectHandle;
pub use logging::{init_logging, LoggingConfig};
pub use session::{Session, SessionSettings, WaitPolicy};
pub use types::{EntityKind, EntityPayload, EntityRecord, MoRef, Uuid};
