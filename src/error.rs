//! Error types for the inventory resolution and operation layer.

use crate::types::{EntityKind, Uuid};
use thiserror::Error;

/// Errors from resolution, dispatch, and control-plane calls.
///
/// Every variant is `Clone`: resolution results fan out to coalesced waiters,
/// so failures must be sendable to more than one caller.
#[derive(Debug, Clone, Error)]
pub enum InventoryError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Name '{name}' matches {} {kind} entities: {candidates:?}", candidates.len())]
    AmbiguousName {
        kind: EntityKind,
        name: String,
        candidates: Vec<Uuid>,
    },

    #[error("Cached entity {uuid} is a {actual}, not a {requested}")]
    KindMismatch {
        uuid: Uuid,
        requested: EntityKind,
        actual: EntityKind,
    },

    #[error("Operation already registered: {0}")]
    DuplicateOperation(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("Bad backend state: {0}")]
    BadState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    DuplicateEntity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Guest OS error: {0}")]
    Guest(#[from] GuestError),
}

/// Errors from running commands inside a guest OS.
#[derive(Debug, Clone, Error)]
pub enum GuestError {
    #[error("Guest command failed: {0}")]
    Failed(String),

    #[error("Guest command timed out: {0}")]
    Timeout(String),

    #[error("Guest command result unknown: {0}")]
    UnknownResult(String),

    #[error("Guest command result ambiguous: {0}")]
    AmbiguousResult(String),

    #[error("Guest command produced unexpected output: {0}")]
    UnexpectedOutput(String),

    #[error("Guest file transfer failed: {0}")]
    Transport(String),
}

impl InventoryError {
    /// Whether retrying the same call may succeed. Only transport-level
    /// failures qualify; everything else reflects inventory state or caller
    /// input that a retry will not change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryError::BackendUnavailable(_))
    }
}

impl From<config::ConfigError> for InventoryError {
    fn from(err: config::ConfigError) -> Self {
        InventoryError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for InventoryError {
    fn from(err: toml::de::Error) -> Self {
        InventoryError::Config(err.to_string())
    }
}
