//! Error taxonomy shared by the loader and the execution manager.
//!
//! Nothing in this crate lets an error cross the `ExecutionManager::run` boundary as a fault:
//! every terminal state is reported as an [`ExecutionError`] inside the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the runtime could not be brought to the ready state.
///
/// Kept `Clone` so a single load outcome can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Failed to fetch runtime artifact '{location}': {message}")]
    Fetch { location: String, message: String },
    #[error("Failed to start interpreter '{program}': {message}")]
    Spawn { program: String, message: String },
    #[error("Prelude failed: {0}")]
    Prelude(String),
    #[error("Runtime did not become ready within {0:?}")]
    Timeout(Duration),
    #[error("Runtime load failed: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The loader never reached the ready state.
    #[error("runtime unavailable")]
    RuntimeUnavailable,
    /// Evaluation exceeded its allotted time.
    #[error("execution timed out")]
    ExecutionTimeout,
    /// Guest code wrote to stderr.
    #[error("interpreter error")]
    InterpreterError,
    #[error("internal fault")]
    InternalFault,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<LoadError> for ExecutionError {
    fn from(err: LoadError) -> Self {
        ExecutionError::new(ErrorKind::RuntimeUnavailable, err.to_string())
    }
}
