//! Coordinator error types.

use thiserror::Error;

use vconv_store::StoreError;

pub type CoordResult<T> = Result<T, CoordinatorError>;

/// Failures surfaced by the coordination core.
///
/// A lost claim race is not an error: the dispatcher reports it as "no task
/// available".
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {0} is not owned by this machine")]
    NotOwner(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Priority {priority} exceeds the token ceiling of {ceiling}")]
    PriorityCeiling { priority: i32, ceiling: i32 },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl CoordinatorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn not_owner(task_id: impl ToString) -> Self {
        Self::NotOwner(task_id.to_string())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => Self::Conflict(format!("{} already exists", what)),
            other => Self::Store(other),
        }
    }
}
