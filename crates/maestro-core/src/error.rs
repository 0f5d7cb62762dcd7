use crate::ids::{TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro engine.
///
/// Only [`MaestroError::Validation`] is ever surfaced synchronously to the
/// submitter of a workflow; every other variant is absorbed by the dispatcher
/// and recorded as a per-task outcome.
#[derive(Debug, Error)]
pub enum MaestroError {
    /// Malformed or cyclic workflow submission. Never retried.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The executor reported a failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// A task ran past its deadline.
    #[error("Task '{task_id}' exceeded its deadline")]
    Timeout {
        /// Task whose deadline elapsed.
        task_id: TaskId,
    },

    /// The agent's circuit breaker rejected the call without invoking it.
    #[error("Circuit open for agent '{agent_id}' (retry in {} ms)", .retry_after.as_millis())]
    CircuitOpen {
        /// Agent whose breaker is open.
        agent_id: String,
        /// Time left until the breaker allows a trial call.
        retry_after: Duration,
    },

    /// A dispatch would exceed the workflow budget.
    #[error("Workflow {workflow_id} exceeded its {resource} budget")]
    BudgetExceeded {
        /// Workflow whose budget ran out.
        workflow_id: WorkflowId,
        /// Which counter ran out.
        resource: BudgetResource,
    },

    /// A compare-and-swap on a task status lost a race.
    #[error("Stale state for task '{task_id}': expected {expected}, found {actual}")]
    StaleState {
        /// Task whose status changed underneath the caller.
        task_id: TaskId,
        /// Status the caller expected.
        expected: String,
        /// Status actually stored.
        actual: String,
    },

    /// Lookup of a workflow, task or checkpoint failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Checkpoint backend failure or corrupt snapshot.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Engine-wide limits reached (e.g. too many active workflows).
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Whether the dispatcher should retry the executor call that produced this error.
    ///
    /// Timeouts are a specialization of execution failures for retry purposes.
    pub fn is_retryable(&self) -> bool {
        match self {
            MaestroError::Execution(e) => e.retryable,
            MaestroError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Convert into the record stored on a failed or skipped task.
    pub fn to_task_error(&self) -> TaskError {
        let kind = match self {
            MaestroError::Timeout { .. } => ErrorKind::Timeout,
            MaestroError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            MaestroError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            _ => ErrorKind::Execution,
        };
        TaskError::new(kind, self.to_string())
    }
}

/// Reasons a workflow submission is rejected before any task is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The workflow declares no tasks.
    #[error("workflow has no tasks")]
    Empty,

    /// Two tasks share an id.
    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    /// A dependency names a task outside the workflow.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// Declaring task.
        task: TaskId,
        /// Missing dependency.
        dependency: TaskId,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// The offending cycle; the first id is repeated at the end.
        cycle: Vec<TaskId>,
    },

    /// Budget or task parameters are out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    /// Human-readable description.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl ExecutionError {
    /// A transient failure, retried with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no retry will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Budget counter that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    /// Executor invocations.
    Calls,
    /// Tokens reported by executors.
    Tokens,
    /// Wall-clock time since the workflow started.
    Time,
}

impl std::fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetResource::Calls => write!(f, "calls"),
            BudgetResource::Tokens => write!(f, "tokens"),
            BudgetResource::Time => write!(f, "time"),
        }
    }
}

/// Classification of a recorded task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Executor failure after retries were exhausted.
    Execution,
    /// Deadline elapsed.
    Timeout,
    /// Breaker rejected the call.
    CircuitOpen,
    /// Workflow budget ran out.
    BudgetExceeded,
    /// Workflow was cancelled.
    Cancelled,
    /// Skip requested explicitly by the caller.
    SkipRequested,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SkipRequested => "skip_requested",
        };
        f.write_str(s)
    }
}

/// Error recorded on a failed task, and carried by tasks skipped because of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Task whose failure caused this one to be skipped, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task: Option<TaskId>,
}

impl TaskError {
    /// Creates a new error record.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source_task: None,
        }
    }

    /// Shorthand for an [`ErrorKind::Execution`] record.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Shorthand for an [`ErrorKind::Timeout`] record.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Shorthand for an [`ErrorKind::Cancelled`] record.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Attach the id of the task that caused this error, unless one is already set.
    pub fn caused_by(mut self, task_id: impl Into<TaskId>) -> Self {
        if self.source_task.is_none() {
            self.source_task = Some(task_id.into());
        }
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
