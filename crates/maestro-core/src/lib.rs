//! Core types and error definitions for the Maestro orchestration engine.
//!
//! This crate provides the foundational types shared across all Maestro crates:
//! the error taxonomy, identifiers, and the error records stored on tasks.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`ValidationError`]: Why a workflow submission was rejected.
//! - [`ExecutionError`]: Failure reported by an executor.
//! - [`TaskError`]: Error record attached to failed and skipped tasks.
//! - [`WorkflowId`]: Identifier assigned to a submitted workflow.

/// Error taxonomy.
pub mod error;
/// Workflow, task and agent identifiers.
pub mod ids;

pub use error::{
    BudgetResource, ErrorKind, ExecutionError, MaestroError, MaestroResult, TaskError,
    ValidationError,
};
pub use ids::{AgentId, TaskId, WorkflowId};
