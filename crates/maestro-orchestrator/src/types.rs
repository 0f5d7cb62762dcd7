use chrono::{DateTime, Utc};
use maestro_core::{AgentId, TaskError, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a task.
///
/// Transitions only move forward along
/// `Pending -> Ready -> InProgress -> {Completed | Failed | Skipped}`;
/// `Pending` and `Ready` may also jump straight to `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies satisfied, not yet dispatched.
    Ready,
    /// Dispatched to its agent.
    InProgress,
    /// Produced a result.
    Completed,
    /// Failed for good.
    Failed,
    /// Will never run.
    Skipped,
}

impl TaskStatus {
    /// Position along the lifecycle; final statuses share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Ready => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped => 3,
        }
    }

    /// Completed, failed and skipped tasks never change again.
    pub fn is_final(self) -> bool {
        self.rank() == 3
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    ///
    /// Recovery may fast-forward over intermediate statuses it never observed,
    /// so any strictly higher rank is accepted.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        self.rank() < next.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What happens to the rest of a workflow when one of its tasks fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dependents of the failed task stay blocked; everything else continues.
    Isolate,
    /// Every transitive dependent is skipped with the causing error attached.
    #[default]
    CascadeSkip,
    /// The workflow fails and every other pending or ready task is skipped.
    FailFast,
}

/// Workflow-scoped quota. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum agent calls.
    #[serde(default)]
    pub max_calls: Option<u64>,
    /// Maximum tokens.
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Maximum run time in milliseconds.
    #[serde(default)]
    pub time_bound_ms: Option<u64>,
}

impl Budget {
    /// No bound on anything.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Bounds agent calls.
    pub fn with_max_calls(mut self, calls: u64) -> Self {
        self.max_calls = Some(calls);
        self
    }

    /// Bounds tokens.
    pub fn with_max_tokens(mut self, tokens: u64) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Bounds run time.
    pub fn with_time_bound(mut self, bound: Duration) -> Self {
        self.time_bound_ms = Some(bound.as_millis() as u64);
        self
    }

    /// Run time bound as a duration.
    pub fn time_bound(&self) -> Option<Duration> {
        self.time_bound_ms.map(Duration::from_millis)
    }
}

/// One task in a workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow.
    pub id: TaskId,
    /// Agent that runs the task.
    pub agent_id: AgentId,
    /// Ids of tasks that must finish first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Opaque input handed to the executor.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Absolute deadline. Takes precedence over `timeout_ms`.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Deadline relative to submission time.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Optional tasks do not degrade synthesis when they produce nothing.
    #[serde(default)]
    pub optional: bool,
    /// Per-task override of the engine retry limit.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Per-task override of the agent's authority weight.
    #[serde(default)]
    pub authority_weight: Option<f64>,
}

impl TaskSpec {
    /// Task with no dependencies and null input.
    pub fn new(id: impl Into<TaskId>, agent_id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            depends_on: Vec::new(),
            input: serde_json::Value::Null,
            deadline: None,
            timeout_ms: None,
            optional: false,
            max_retries: None,
            authority_weight: None,
        }
    }

    /// Adds dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Sets the input.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Marks the task optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Overrides the retry count.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the authority weight.
    pub fn with_authority(mut self, weight: f64) -> Self {
        self.authority_weight = Some(weight);
        self
    }
}

/// A workflow submission: a DAG of tasks plus its budget and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskSpec>,
    /// Resource bounds.
    #[serde(default)]
    pub budget: Budget,
    /// What a required task failure does to the rest.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// "Continue independently": a skipped dependency counts as resolved.
    #[serde(default)]
    pub skip_satisfies_dependency: bool,
}

impl WorkflowSpec {
    /// Empty workflow with default policy and no budget.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            budget: Budget::default(),
            failure_policy: FailurePolicy::default(),
            skip_satisfies_dependency: false,
        }
    }

    /// Appends a task.
    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Sets the budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the failure policy.
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Lets a skipped dependency satisfy its dependents.
    pub fn continue_on_skip(mut self) -> Self {
        self.skip_satisfies_dependency = true;
        self
    }
}

/// Output stored on a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Produced value.
    pub value: serde_json::Value,
    /// Producer's certainty, in `[0, 1]`.
    pub confidence: f64,
    /// Trust multiplier of the producing agent, `>= 0`.
    pub authority_weight: f64,
    /// Tokens consumed.
    #[serde(default)]
    pub tokens_used: u64,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Builds a result, clamping confidence into `[0, 1]` and authority to `>= 0`.
    pub fn new(value: serde_json::Value, confidence: f64, authority_weight: f64) -> Self {
        Self {
            value,
            confidence: clamp_unit(confidence),
            authority_weight: if authority_weight.is_finite() {
                authority_weight.max(0.0)
            } else {
                0.0
            },
            tokens_used: 0,
            completed_at: Utc::now(),
        }
    }

    /// Sets the tokens consumed.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Point-in-time view of a task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Agent that runs the task.
    pub agent_id: AgentId,
    /// Tasks that must finish first.
    pub dependencies: Vec<TaskId>,
    /// Current status.
    pub status: TaskStatus,
    /// Result when completed.
    pub result: Option<TaskResult>,
    /// Error when failed or skipped.
    pub error: Option<TaskError>,
    /// Retries consumed.
    pub retry_count: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Absolute deadline, if any.
    pub deadline: Option<DateTime<Utc>>,
    /// Task input.
    pub input: serde_json::Value,
    /// Optional tasks do not fail the workflow.
    pub optional: bool,
    /// Retry override.
    pub max_retries: Option<u32>,
    /// Authority weight override.
    pub authority_weight: Option<f64>,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time a final status was reached.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Tasks are being dispatched.
    Running,
    /// No new task is dispatched until the workflow is unpaused.
    Paused,
    /// Cancel requested; waiting for in-flight tasks to settle.
    Cancelling,
    /// Finished with some optional tasks not completed.
    PartialSuccess,
    /// Every task completed.
    Completed,
    /// A required task failed.
    Failed,
    /// Stopped by cancel.
    Cancelled,
    /// Stopped by a budget bound.
    BudgetExceeded,
}

impl WorkflowStatus {
    /// Whether the workflow has finished.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Cancelling
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Cancelling => "cancelling",
            WorkflowStatus::PartialSuccess => "partial_success",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::BudgetExceeded => "budget_exceeded",
        };
        f.write_str(s)
    }
}

/// Task counts per status for one workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// All tasks.
    pub total: usize,
    /// Waiting on dependencies.
    pub pending: usize,
    /// Ready to dispatch.
    pub ready: usize,
    /// In flight.
    pub in_progress: usize,
    /// Completed.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Skipped.
    pub skipped: usize,
}

impl Progress {
    pub(crate) fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
        }
    }

    /// Completed tasks over all tasks. Skipped tasks count in the total only.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }

    /// Whether every task is in a final status.
    pub fn all_final(&self) -> bool {
        self.completed + self.failed + self.skipped == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_only() {
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_advance_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_advance_to(TaskStatus::Completed));
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Skipped));
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::Pending));
        assert!(!TaskStatus::InProgress.can_advance_to(TaskStatus::Ready));
        assert!(!TaskStatus::Failed.can_advance_to(TaskStatus::Skipped));
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::Failed));
    }

    #[test]
    fn test_final_statuses() {
        assert!(TaskStatus::Completed.is_final());
        assert!(TaskStatus::Failed.is_final());
        assert!(TaskStatus::Skipped.is_final());
        assert!(!TaskStatus::InProgress.is_final());
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_task_result_clamps() {
        let r = TaskResult::new(serde_json::json!("x"), 1.7, -2.0);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.authority_weight, 0.0);
        let r = TaskResult::new(serde_json::json!("x"), f64::NAN, f64::INFINITY);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.authority_weight, 0.0);
    }

    #[test]
    fn test_workflow_spec_from_toml() {
        let spec: WorkflowSpec = toml::from_str(
            r#"
            name = "research"
            failure_policy = "fail_fast"

            [budget]
            max_calls = 10

            [[tasks]]
            id = "fetch"
            agent_id = "crawler"

            [[tasks]]
            id = "summarize"
            agent_id = "writer"
            depends_on = ["fetch"]
            timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(spec.tasks.len(), 2);
        assert_eq!(spec.failure_policy, FailurePolicy::FailFast);
        assert_eq!(spec.budget.max_calls, Some(10));
        assert_eq!(spec.tasks[1].depends_on, vec!["fetch".to_string()]);
        assert!(!spec.skip_satisfies_dependency);
    }

    #[test]
    fn test_progress_success_rate_excludes_skipped() {
        let mut p = Progress::default();
        p.count(TaskStatus::Completed);
        p.count(TaskStatus::Completed);
        p.count(TaskStatus::Skipped);
        p.count(TaskStatus::Failed);
        assert_eq!(p.total, 4);
        assert!((p.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!(p.all_final());
    }

    #[test]
    fn test_workflow_status_terminal() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Cancelling.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(WorkflowStatus::BudgetExceeded.is_terminal());
        assert!(WorkflowStatus::PartialSuccess.is_terminal());
    }
}
