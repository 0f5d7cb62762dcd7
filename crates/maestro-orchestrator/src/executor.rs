use crate::budget::BudgetView;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{AgentId, ExecutionError, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an executor gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Workflow of the task.
    pub workflow_id: WorkflowId,
    /// Task being executed.
    pub task_id: TaskId,
    /// Agent asked to run it.
    pub agent_id: AgentId,
    /// Task input.
    pub input: serde_json::Value,
    /// Result values of the task's completed dependencies.
    pub dependencies: HashMap<TaskId, serde_json::Value>,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Absolute deadline, if any.
    pub deadline: Option<DateTime<Utc>>,
    /// Remaining workflow budget when the attempt was dispatched.
    pub budget: BudgetView,
    /// Cancelled when the workflow is cancelled. Honouring it is optional.
    pub cancel: CancellationToken,
}

/// Successful executor output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Produced value.
    pub value: serde_json::Value,
    /// Confidence in `value`, in `[0, 1]`.
    pub confidence: f64,
    /// Tokens consumed by the call.
    #[serde(default)]
    pub tokens_used: u64,
}

impl ExecutionOutput {
    /// Output with no token usage.
    pub fn new(value: serde_json::Value, confidence: f64) -> Self {
        Self {
            value,
            confidence,
            tokens_used: 0,
        }
    }

    /// Sets the tokens consumed.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Performs the actual work of a task on behalf of an agent.
///
/// The engine only coordinates: any LLM call, tool invocation or remote
/// request lives behind this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;
}

/// Returns each task's input unchanged with full confidence.
///
/// Handy for dry runs of a workflow definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let value = if request.input.is_null() {
            serde_json::json!({ "task": request.task_id, "agent": request.agent_id })
        } else {
            request.input
        };
        Ok(ExecutionOutput::new(value, 1.0))
    }
}

/// Retry behaviour for transient executor failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Per-task `max_retries` overrides it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on any single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts; used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, attempt))
    }
}

/// `base * 2^attempt`, capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}
