use cadence_core::CoreError;
use thiserror::Error;

use crate::types::ItemStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A create/update request was rejected before touching the store.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No item with the given ID exists in the store.
    #[error("Item not found: {id}")]
    ItemNotFound { id: String },

    /// The owner action is not allowed from the item's current state.
    #[error("Cannot {action} item in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: ItemStatus,
    },

    /// The claimed item could not be handed to a worker; its claim was released.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for CoreError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Database(e) => CoreError::Database(e.to_string()),
            SchedulerError::Serialization(e) => CoreError::Serialization(e),
            SchedulerError::Validation(msg) => CoreError::Validation(msg),
            SchedulerError::ItemNotFound { id } => CoreError::NotFound { id },
            e @ SchedulerError::InvalidTransition { .. } => CoreError::Conflict(e.to_string()),
            SchedulerError::Dispatch(msg) => CoreError::Unavailable(msg),
            SchedulerError::LockPoisoned => CoreError::Internal("store lock poisoned".into()),
        }
    }
}
