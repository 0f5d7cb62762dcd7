//! Multi-agent task orchestration engine.
//!
//! Workflows are dependency graphs of tasks, each assigned to an agent. The
//! [`Dispatcher`] hands ready tasks to an [`Executor`] through a per-agent
//! circuit breaker, records every transition in the [`TaskRegistry`], publishes
//! it on the [`EventBus`], checkpoints progress, and reconciles the completed
//! results into a single weighted answer.
//!
//! # Main types
//!
//! - [`Dispatcher`]: Drives workflows from submission to a [`WorkflowReport`].
//! - [`TaskRegistry`]: Owns task state; the only place transitions happen.
//! - [`EventBus`]: Ordered per-workflow event log with subscriber fan-out.
//! - [`CircuitBreakerRegistry`]: One breaker per agent id.
//! - [`CheckpointStore`]: Versioned workflow snapshots for crash recovery.
//! - [`synthesize`]: Weighted-vote reconciliation of agent results.

/// Per-agent circuit breakers.
pub mod breaker;
/// Workflow call/token/time budgets.
pub mod budget;
/// Checkpoint store and backends.
pub mod checkpoint;
/// Engine configuration.
pub mod config;
/// Workflow lifecycle and task dispatch.
pub mod dispatcher;
/// Event log and subscriptions.
pub mod events;
/// Executor trait and retry policy.
pub mod executor;
/// Dependency graph validation and traversal.
pub mod graph;
/// Per-agent state and metrics.
pub mod monitor;
/// Task state ownership and transitions.
pub mod registry;
/// Result reconciliation.
pub mod synthesizer;
/// Shared workflow and task types.
pub mod types;

pub use breaker::{BreakerConfig, BreakerOverride, CallOrigin, CircuitBreakerRegistry, CircuitState};
pub use budget::{BudgetTracker, BudgetView};
pub use checkpoint::{
    Checkpoint, CheckpointBackend, CheckpointStore, FileCheckpointBackend, MemoryCheckpointBackend,
};
pub use config::{CheckpointBackendKind, CheckpointConfig, EventsConfig, OrchestratorConfig};
pub use dispatcher::{Dispatcher, TaskOutcome, WorkflowReport};
pub use events::{
    Event, EventBus, EventKind, EventStatistics, EventSubscriber, Replay, SubscriptionFilter,
    SubscriptionId,
};
pub use executor::{EchoExecutor, ExecutionOutput, ExecutionRequest, Executor, RetryPolicy};
pub use graph::TaskGraph;
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, WorkerStatus};
pub use registry::{FailOutcome, TaskRegistry, TaskSnapshot, WorkflowSnapshot};
pub use synthesizer::{synthesize, synthesize_tasks, Contribution, Provenance, Synthesis, SynthesisStatus};
pub use types::{
    Budget, FailurePolicy, Progress, Task, TaskResult, TaskSpec, TaskStatus, WorkflowSpec,
    WorkflowStatus,
};
