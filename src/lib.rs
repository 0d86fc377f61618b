//! Single-flight execution manager for an embedded interpreter runtime.
//!
//! A [`RuntimeLoader`] brings the interpreter up lazily and at most once per load episode; an
//! [`ExecutionManager`] runs requests against it one at a time, capturing output per call and
//! reporting every outcome as an [`ExecutionResult`].

pub mod config;
pub mod error;
pub mod execution;
pub mod runtime;

pub use error::{ErrorKind, ExecutionError, LoadError};
pub use execution::{ExecutionManager, ExecutionRequest, ExecutionResult, OutputSinks, StderrPolicy};
pub use runtime::{Interpreter, RuntimeHandle, RuntimeLoader, RuntimePhase, RuntimeProvider};
