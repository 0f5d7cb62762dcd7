use crate::breaker::{CallOrigin, CircuitBreakerRegistry};
use crate::budget::BudgetTracker;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, EventKind};
use crate::executor::{ExecutionRequest, Executor};
use crate::monitor::AgentMonitor;
use crate::registry::TaskRegistry;
use crate::synthesizer::{synthesize_tasks, Synthesis};
use crate::types::{Progress, Task, TaskResult, TaskStatus, WorkflowSpec, WorkflowStatus};
use chrono::Utc;
use maestro_core::{
    AgentId, BudgetResource, MaestroError, MaestroResult, TaskError, TaskId, WorkflowId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Final state of one task, as reported to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: TaskId,
    /// Agent that ran the task.
    pub agent_id: AgentId,
    /// Final status.
    pub status: TaskStatus,
    /// Result when completed.
    pub result: Option<TaskResult>,
    /// Error when failed or skipped.
    pub error: Option<TaskError>,
    /// Retries consumed.
    pub retry_count: u32,
}

impl From<Task> for TaskOutcome {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            agent_id: task.agent_id,
            status: task.status,
            result: task.result,
            error: task.error,
            retry_count: task.retry_count,
        }
    }
}

/// Structured terminal report of a workflow run.
///
/// Failures never surface as an `Err` from [`Dispatcher::run`]; they are
/// enumerated here per task instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Terminal status.
    pub status: WorkflowStatus,
    /// Per-task outcomes in declaration order.
    pub tasks: Vec<TaskOutcome>,
    /// Final task counts.
    pub progress: Progress,
    /// Completed over total; skipped tasks count in the total only.
    pub success_rate: f64,
    /// Merged result of completed tasks.
    pub synthesis: Synthesis,
    /// Agent calls consumed.
    pub calls_used: u64,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Run time, summed over restarts.
    pub duration_ms: u64,
}

impl WorkflowReport {
    /// Outcome of one task.
    pub fn task(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Lifecycle state of one submitted workflow. Owned by the dispatcher.
struct WorkflowRun {
    status: Mutex<WorkflowStatus>,
    budget: BudgetTracker,
    cancel: CancellationToken,
    budget_exceeded: Mutex<Option<BudgetResource>>,
    fail_fast: AtomicBool,
    driving: AtomicBool,
    /// Signalled when a paused workflow may dispatch again.
    unpaused: Notify,
    report: Mutex<Option<WorkflowReport>>,
}

impl WorkflowRun {
    fn new(budget: BudgetTracker, status: WorkflowStatus) -> Self {
        Self {
            status: Mutex::new(status),
            budget,
            cancel: CancellationToken::new(),
            budget_exceeded: Mutex::new(None),
            fail_fast: AtomicBool::new(false),
            driving: AtomicBool::new(false),
            unpaused: Notify::new(),
            report: Mutex::new(None),
        }
    }

    fn status(&self) -> WorkflowStatus {
        *self.status.lock()
    }

    fn paused(&self) -> bool {
        self.status() == WorkflowStatus::Paused
    }

    /// Record the first exhausted resource. Returns true for the first call.
    fn exceed_budget(&self, resource: BudgetResource) -> bool {
        let mut slot = self.budget_exceeded.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(resource);
        true
    }
}

/// Drives workflows from submission to a terminal report.
///
/// Owns the workflow lifecycle and composes the task registry, event bus,
/// circuit breakers, synthesizer and checkpoint store. Ready tasks are
/// dispatched to a bounded pool of workers; each worker calls the
/// [`Executor`] through its agent's breaker and records the outcome in the
/// registry. A checkpoint is written after every batch of transitions.
pub struct Dispatcher {
    config: Arc<OrchestratorConfig>,
    executor: Arc<dyn Executor>,
    events: Arc<EventBus>,
    registry: Arc<TaskRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    checkpoints: Arc<CheckpointStore>,
    monitor: AgentMonitor,
    runs: RwLock<HashMap<WorkflowId, Arc<WorkflowRun>>>,
}

impl Dispatcher {
    /// Dispatcher with an in-memory event log and checkpoint store.
    pub fn new(config: OrchestratorConfig, executor: Arc<dyn Executor>) -> Self {
        let events = Arc::new(EventBus::new(config.events.clone()));
        Self::with_components(config, executor, events, Arc::new(CheckpointStore::in_memory()))
    }

    /// Dispatcher whose checkpoint backend is chosen by `config.checkpoint`.
    pub async fn from_config(
        config: OrchestratorConfig,
        executor: Arc<dyn Executor>,
    ) -> MaestroResult<Self> {
        config.validate()?;
        let checkpoints = Arc::new(CheckpointStore::from_config(&config.checkpoint).await?);
        let events = Arc::new(EventBus::new(config.events.clone()));
        Ok(Self::with_components(config, executor, events, checkpoints))
    }

    /// Dispatcher sharing an existing event bus and checkpoint store, e.g. to
    /// resume workflows written by a previous instance.
    pub fn with_components(
        config: OrchestratorConfig,
        executor: Arc<dyn Executor>,
        events: Arc<EventBus>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(events.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breaker.clone(),
            events.clone(),
        ));
        Self {
            config: Arc::new(config),
            executor,
            events,
            registry,
            breakers,
            checkpoints,
            monitor: AgentMonitor::new(),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Orchestrator configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Shared event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Shared task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Shared circuit breakers.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Checkpoint store.
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Per-agent activity monitor.
    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    fn run_handle(&self, workflow_id: WorkflowId) -> MaestroResult<Arc<WorkflowRun>> {
        self.runs
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))
    }

    fn ensure_capacity(&self, runs: &HashMap<WorkflowId, Arc<WorkflowRun>>) -> MaestroResult<()> {
        let active = runs.values().filter(|r| !r.status().is_terminal()).count();
        if active >= self.config.max_active_workflows {
            return Err(MaestroError::Capacity(format!(
                "{active} workflows already active (max {})",
                self.config.max_active_workflows
            )));
        }
        Ok(())
    }

    fn admit(&self, workflow_id: WorkflowId, run: Arc<WorkflowRun>) -> MaestroResult<()> {
        let mut runs = self.runs.write();
        self.ensure_capacity(&runs)?;
        runs.insert(workflow_id, run);
        Ok(())
    }

    /// Validate and register a workflow. Validation errors are the only
    /// failures raised to the submitter.
    pub async fn submit(&self, spec: WorkflowSpec) -> MaestroResult<WorkflowId> {
        self.ensure_capacity(&self.runs.read())?;
        let budget = BudgetTracker::new(spec.budget.clone());
        let workflow_id = self.registry.submit(spec)?;
        let run = Arc::new(WorkflowRun::new(budget, WorkflowStatus::Running));
        if let Err(e) = self.admit(workflow_id, run.clone()) {
            self.registry.remove(workflow_id);
            self.events.remove_workflow(workflow_id);
            return Err(e);
        }
        self.checkpoint(workflow_id, &run).await;
        Ok(workflow_id)
    }

    /// Submit and run to completion.
    pub async fn execute(&self, spec: WorkflowSpec) -> MaestroResult<WorkflowReport> {
        let workflow_id = self.submit(spec).await?;
        self.run(workflow_id).await
    }

    /// Run a submitted workflow until it reaches a terminal status.
    ///
    /// Calling it again on a finished workflow returns the stored report.
    pub async fn run(&self, workflow_id: WorkflowId) -> MaestroResult<WorkflowReport> {
        let run = self.run_handle(workflow_id)?;
        let finished = run.report.lock().clone();
        if let Some(report) = finished {
            return Ok(report);
        }
        if run.driving.swap(true, Ordering::AcqRel) {
            return Err(MaestroError::Capacity(format!(
                "workflow {workflow_id} is already running"
            )));
        }
        self.drive(workflow_id, &run, Vec::new()).await
    }

    /// Request cancellation.
    ///
    /// No further task becomes ready; in-flight executor calls are signalled
    /// through their cancellation token and allowed to finish. The workflow
    /// becomes `cancelled` once nothing is in progress.
    pub fn cancel(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        let run = self.run_handle(workflow_id)?;
        {
            let mut status = run.status.lock();
            if !matches!(*status, WorkflowStatus::Running | WorkflowStatus::Paused) {
                return Ok(());
            }
            *status = WorkflowStatus::Cancelling;
        }
        self.registry.close_workflow(workflow_id)?;
        run.cancel.cancel();
        info!(workflow_id = %workflow_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Stop issuing ready tasks. Calls already in flight run to completion.
    ///
    /// Pausing a paused workflow is a no-op; any other non-running status is
    /// refused.
    pub async fn pause(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        let run = self.run_handle(workflow_id)?;
        {
            let mut status = run.status.lock();
            match *status {
                WorkflowStatus::Running => *status = WorkflowStatus::Paused,
                WorkflowStatus::Paused => return Ok(()),
                other => {
                    return Err(MaestroError::Capacity(format!(
                        "workflow {workflow_id} is {other} and cannot be paused"
                    )))
                }
            }
        }
        self.events.publish(
            workflow_id,
            None,
            EventKind::WorkflowPaused,
            serde_json::json!({ "progress": self.registry.progress(workflow_id)? }),
        );
        self.checkpoint(workflow_id, &run).await;
        info!(workflow_id = %workflow_id, "Workflow paused");
        Ok(())
    }

    /// Let a paused workflow dispatch ready tasks again.
    pub async fn unpause(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        let run = self.run_handle(workflow_id)?;
        {
            let mut status = run.status.lock();
            match *status {
                WorkflowStatus::Paused => *status = WorkflowStatus::Running,
                WorkflowStatus::Running => return Ok(()),
                other => {
                    return Err(MaestroError::Capacity(format!(
                        "workflow {workflow_id} is {other} and cannot be unpaused"
                    )))
                }
            }
        }
        self.events.publish(
            workflow_id,
            None,
            EventKind::WorkflowResumed,
            serde_json::json!({ "progress": self.registry.progress(workflow_id)? }),
        );
        run.unpaused.notify_one();
        self.checkpoint(workflow_id, &run).await;
        info!(workflow_id = %workflow_id, "Workflow unpaused");
        Ok(())
    }

    /// Current status of a workflow.
    pub fn status(&self, workflow_id: WorkflowId) -> MaestroResult<WorkflowStatus> {
        Ok(self.run_handle(workflow_id)?.status())
    }

    /// Current task counts of a workflow.
    pub fn progress(&self, workflow_id: WorkflowId) -> MaestroResult<Progress> {
        self.registry.progress(workflow_id)
    }

    /// Terminal report, once the workflow has finished.
    pub fn report(&self, workflow_id: WorkflowId) -> MaestroResult<Option<WorkflowReport>> {
        Ok(self.run_handle(workflow_id)?.report.lock().clone())
    }

    /// Ids of workflows that have not reached a terminal status.
    pub fn active_workflows(&self) -> Vec<WorkflowId> {
        self.runs
            .read()
            .iter()
            .filter(|(_, r)| !r.status().is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Rebuild a workflow from its latest checkpoint and run it to completion.
    ///
    /// Events published after the checkpoint are replayed on top of it. Tasks
    /// that were in progress at the time are dispatched again. A workflow
    /// checkpointed while paused stays paused until [`Dispatcher::unpause`].
    pub async fn resume(&self, workflow_id: WorkflowId) -> MaestroResult<WorkflowReport> {
        let driving = self
            .runs
            .read()
            .get(&workflow_id)
            .is_some_and(|run| run.driving.load(Ordering::Acquire));
        if driving {
            return Err(MaestroError::Capacity(format!(
                "workflow {workflow_id} is already running"
            )));
        }

        let checkpoint = self.checkpoints.load(workflow_id).await?;
        let budget = BudgetTracker::with_usage(
            checkpoint.workflow.spec.budget.clone(),
            checkpoint.calls_used,
            checkpoint.tokens_used,
            Duration::from_millis(checkpoint.elapsed_ms),
        );
        self.registry.restore(checkpoint.workflow)?;
        self.events
            .resume_sequence(workflow_id, checkpoint.last_applied_sequence);
        let applied = self.registry.apply_events(
            workflow_id,
            self.events
                .replay(workflow_id, checkpoint.last_applied_sequence + 1),
        )?;
        info!(
            workflow_id = %workflow_id,
            version = checkpoint.version,
            sequence = checkpoint.last_applied_sequence,
            replayed = applied,
            "Workflow restored from checkpoint"
        );

        let run = Arc::new(WorkflowRun::new(budget, checkpoint.status));
        self.runs.write().remove(&workflow_id);
        self.admit(workflow_id, run.clone())?;

        if checkpoint.status.is_terminal() {
            let report = self.build_report(workflow_id, &run, checkpoint.status)?;
            *run.report.lock() = Some(report.clone());
            return Ok(report);
        }
        if checkpoint.status == WorkflowStatus::Cancelling {
            self.registry.close_workflow(workflow_id)?;
            run.cancel.cancel();
        }

        run.driving.store(true, Ordering::Release);
        let orphans = self
            .registry
            .tasks_in_status(workflow_id, TaskStatus::InProgress)?;
        self.drive(workflow_id, &run, orphans).await
    }

    /// Release everything held for a finished workflow: task records, event
    /// log and checkpoint.
    pub async fn acknowledge(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        let run = self.run_handle(workflow_id)?;
        let status = run.status();
        if !status.is_terminal() {
            return Err(MaestroError::Capacity(format!(
                "workflow {workflow_id} is still {status}"
            )));
        }
        self.checkpoints.delete(workflow_id).await?;
        self.registry.remove(workflow_id);
        self.events.remove_workflow(workflow_id);
        self.runs.write().remove(&workflow_id);
        info!(workflow_id = %workflow_id, "Workflow acknowledged and released");
        Ok(())
    }

    fn stopping(&self, workflow_id: WorkflowId, run: &WorkflowRun) -> bool {
        run.cancel.is_cancelled() || self.registry.is_closed(workflow_id).unwrap_or(true)
    }

    fn worker(
        &self,
        workflow_id: WorkflowId,
        run: &Arc<WorkflowRun>,
        task_id: TaskId,
        resumed: bool,
    ) -> TaskWorker {
        TaskWorker {
            workflow_id,
            task_id,
            resumed,
            run: run.clone(),
            config: self.config.clone(),
            executor: self.executor.clone(),
            registry: self.registry.clone(),
            breakers: self.breakers.clone(),
            monitor: self.monitor.clone(),
        }
    }

    async fn drive(
        &self,
        workflow_id: WorkflowId,
        run: &Arc<WorkflowRun>,
        orphans: Vec<TaskId>,
    ) -> MaestroResult<WorkflowReport> {
        info!(workflow_id = %workflow_id, resumed = orphans.len(), "Workflow run started");
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut workers: JoinSet<()> = JoinSet::new();

        let mut queue: VecDeque<(TaskId, bool)> = orphans.into_iter().map(|t| (t, true)).collect();
        // Tasks restored in `ready` were handed out before the restart.
        queue.extend(
            self.registry
                .tasks_in_status(workflow_id, TaskStatus::Ready)?
                .into_iter()
                .map(|t| (t, false)),
        );

        loop {
            if !self.stopping(workflow_id, run) {
                queue.extend(
                    self.registry
                        .get_ready_tasks(workflow_id)?
                        .into_iter()
                        .map(|t| (t, false)),
                );
            }

            let mut dispatched = 0;
            while let Some((task_id, resumed)) = queue.pop_front() {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| MaestroError::Capacity("worker pool closed".into()))?;
                if self.stopping(workflow_id, run) && !resumed {
                    queue.clear();
                    break;
                }
                // Held back until unpaused; orphans are already in flight.
                if run.paused() && !resumed {
                    queue.push_front((task_id, resumed));
                    break;
                }
                // Orphaned in-progress tasks already consumed their reservation.
                if !resumed {
                    if let Err(resource) = run.budget.reserve_call() {
                        if run.exceed_budget(resource) {
                            warn!(workflow_id = %workflow_id, resource = %resource, "Workflow budget exhausted");
                        }
                        self.registry.close_workflow(workflow_id)?;
                        queue.clear();
                        break;
                    }
                }
                let worker = self.worker(workflow_id, run, task_id, resumed);
                workers.spawn(async move {
                    let _permit = permit;
                    worker.run().await;
                });
                dispatched += 1;
            }
            if dispatched > 0 {
                debug!(workflow_id = %workflow_id, dispatched, "Dispatched batch");
            }

            match workers.join_next().await {
                Some(joined) => {
                    if let Err(e) = joined {
                        error!(workflow_id = %workflow_id, error = %e, "Task worker aborted");
                    }
                    self.checkpoint(workflow_id, run).await;
                }
                None => {
                    if self.stopping(workflow_id, run) {
                        break;
                    }
                    let ready = self.registry.get_ready_tasks(workflow_id)?;
                    queue.extend(ready.into_iter().map(|t| (t, false)));
                    if queue.is_empty() {
                        break;
                    }
                    if run.paused() {
                        debug!(workflow_id = %workflow_id, held = queue.len(), "Waiting for unpause");
                        tokio::select! {
                            _ = run.unpaused.notified() => {}
                            _ = run.cancel.cancelled() => {}
                        }
                    }
                }
            }
        }

        self.finalize(workflow_id, run).await
    }

    async fn finalize(
        &self,
        workflow_id: WorkflowId,
        run: &Arc<WorkflowRun>,
    ) -> MaestroResult<WorkflowReport> {
        // A worker that died without reporting leaves its task in progress.
        for task_id in self
            .registry
            .tasks_in_status(workflow_id, TaskStatus::InProgress)?
        {
            let error = TaskError::execution("worker stopped before reporting an outcome");
            if let Err(e) = self.registry.fail_task(workflow_id, &task_id, error) {
                warn!(workflow_id = %workflow_id, task_id = %task_id, error = %e, "Cannot fail orphaned task");
            }
        }

        let cancelled = run.status() == WorkflowStatus::Cancelling;
        let exhausted = *run.budget_exceeded.lock();
        if cancelled {
            self.registry
                .skip_unfinished(workflow_id, TaskError::cancelled("workflow cancelled"))?;
        } else if let Some(resource) = exhausted {
            self.registry
                .skip_unfinished(workflow_id, budget_error(workflow_id, resource))?;
        }

        let progress = self.registry.progress(workflow_id)?;
        let status = if cancelled {
            WorkflowStatus::Cancelled
        } else if exhausted.is_some() {
            WorkflowStatus::BudgetExceeded
        } else if run.fail_fast.load(Ordering::Acquire) || progress.completed == 0 {
            WorkflowStatus::Failed
        } else if progress.completed == progress.total {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::PartialSuccess
        };
        *run.status.lock() = status;

        let report = self.build_report(workflow_id, run, status)?;
        let kind = match status {
            WorkflowStatus::Cancelled => EventKind::WorkflowCancelled,
            WorkflowStatus::BudgetExceeded => EventKind::WorkflowBudgetExceeded,
            WorkflowStatus::Failed => EventKind::WorkflowFailed,
            _ => EventKind::WorkflowCompleted,
        };
        self.events.publish(
            workflow_id,
            None,
            kind,
            serde_json::json!({
                "status": status,
                "success_rate": report.success_rate,
                "progress": report.progress,
                "synthesis": report.synthesis,
            }),
        );
        self.checkpoint(workflow_id, run).await;
        *run.report.lock() = Some(report.clone());
        run.driving.store(false, Ordering::Release);

        info!(
            workflow_id = %workflow_id,
            status = %status,
            completed = progress.completed,
            failed = progress.failed,
            skipped = progress.skipped,
            duration_ms = report.duration_ms,
            "Workflow finished"
        );
        Ok(report)
    }

    fn build_report(
        &self,
        workflow_id: WorkflowId,
        run: &WorkflowRun,
        status: WorkflowStatus,
    ) -> MaestroResult<WorkflowReport> {
        let spec = self.registry.spec(workflow_id)?;
        let tasks = self.registry.tasks(workflow_id)?;
        let progress = self.registry.progress(workflow_id)?;
        let synthesis = synthesize_tasks(&self.registry.terminal_tasks(workflow_id)?);
        Ok(WorkflowReport {
            workflow_id,
            name: spec.name,
            status,
            tasks: tasks.into_iter().map(TaskOutcome::from).collect(),
            progress,
            success_rate: progress.success_rate(),
            synthesis,
            calls_used: run.budget.calls_used(),
            tokens_used: run.budget.tokens_used(),
            duration_ms: run.budget.elapsed().as_millis() as u64,
        })
    }

    /// Persist the workflow's current state. Failures are logged, not fatal.
    async fn checkpoint(&self, workflow_id: WorkflowId, run: &WorkflowRun) {
        // Read the sequence first: events racing with the snapshot are then
        // replayed, and replay skips transitions the snapshot already holds.
        let last_applied_sequence = self.events.last_sequence(workflow_id);
        let workflow = match self.registry.snapshot(workflow_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Cannot snapshot workflow");
                return;
            }
        };
        let checkpoint = Checkpoint {
            workflow_id,
            version: self.checkpoints.next_version(workflow_id),
            status: run.status(),
            workflow,
            last_applied_sequence,
            calls_used: run.budget.calls_used(),
            tokens_used: run.budget.tokens_used(),
            elapsed_ms: run.budget.elapsed().as_millis() as u64,
            saved_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(workflow_id = %workflow_id, error = %e, "Checkpoint write failed");
        }
    }
}

fn budget_error(workflow_id: WorkflowId, resource: BudgetResource) -> TaskError {
    MaestroError::BudgetExceeded {
        workflow_id,
        resource,
    }
    .to_task_error()
}

/// Executes one task: attempts, retries, breaker waits and the final
/// registry transition.
struct TaskWorker {
    workflow_id: WorkflowId,
    task_id: TaskId,
    /// Already `in_progress` from before a restart.
    resumed: bool,
    run: Arc<WorkflowRun>,
    config: Arc<OrchestratorConfig>,
    executor: Arc<dyn Executor>,
    registry: Arc<TaskRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: AgentMonitor,
}

enum Wait {
    Elapsed,
    Cancelled,
}

impl TaskWorker {
    async fn run(self) {
        if !self.resumed {
            match self.registry.mark_in_progress(self.workflow_id, &self.task_id) {
                Ok(()) => {}
                Err(MaestroError::StaleState { actual, .. }) => {
                    debug!(task_id = %self.task_id, actual = %actual, "Task already handled elsewhere");
                    return;
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, error = %e, "Cannot start task");
                    return;
                }
            }
        }
        let task = match self.registry.task(self.workflow_id, &self.task_id) {
            Ok(t) => t,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Task vanished before execution");
                return;
            }
        };

        let max_retries = task.max_retries.unwrap_or(self.config.retry.max_retries);
        let authority = task
            .authority_weight
            .unwrap_or_else(|| self.config.authority_for(&task.agent_id));
        let dependencies = self.dependency_values(&task);
        let origin = CallOrigin::new(self.workflow_id, self.task_id.clone());
        let mut attempt = task.retry_count;
        let mut reserved = true;

        loop {
            let remaining = match task.deadline {
                Some(deadline) => match (deadline - Utc::now()).to_std() {
                    Ok(left) if !left.is_zero() => Some(left),
                    _ => {
                        // No call was made, so the agent's breaker is left alone.
                        self.fail(TaskError::timeout("deadline elapsed before the call"));
                        return;
                    }
                },
                None => None,
            };

            if !reserved {
                if let Err(resource) = self.run.budget.reserve_call() {
                    self.run.exceed_budget(resource);
                    if let Err(e) = self.registry.close_workflow(self.workflow_id) {
                        warn!(workflow_id = %self.workflow_id, error = %e, "Cannot close workflow");
                    }
                    self.fail(budget_error(self.workflow_id, resource));
                    return;
                }
            }
            reserved = false;

            let request = ExecutionRequest {
                workflow_id: self.workflow_id,
                task_id: self.task_id.clone(),
                agent_id: task.agent_id.clone(),
                input: task.input.clone(),
                dependencies: dependencies.clone(),
                attempt,
                deadline: task.deadline,
                budget: self.run.budget.view(),
                cancel: self.run.cancel.child_token(),
            };
            let executor = self.executor.clone();
            let task_id = self.task_id.clone();
            self.monitor
                .start_task(&task.agent_id, self.workflow_id, &self.task_id)
                .await;
            let started = Instant::now();
            let outcome = self
                .breakers
                .guard(&task.agent_id, &origin, || async move {
                    let call = executor.execute(request);
                    match remaining {
                        Some(left) => match tokio::time::timeout(left, call).await {
                            Ok(result) => result.map_err(MaestroError::from),
                            Err(_) => Err(MaestroError::Timeout { task_id }),
                        },
                        None => call.await.map_err(MaestroError::from),
                    }
                })
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => {
                    self.monitor
                        .finish_task(
                            &task.agent_id,
                            self.workflow_id,
                            &self.task_id,
                            true,
                            elapsed_ms,
                            output.tokens_used,
                        )
                        .await;
                    // An exhausted token budget stops the next dispatch, not this result.
                    if let Err(resource) = self.run.budget.charge_tokens(output.tokens_used) {
                        debug!(workflow_id = %self.workflow_id, resource = %resource, "Budget limit reached");
                    }
                    let result = TaskResult::new(output.value, output.confidence, authority)
                        .with_tokens(output.tokens_used);
                    if let Err(e) = self.registry.complete_task(self.workflow_id, &self.task_id, result) {
                        debug!(task_id = %self.task_id, error = %e, "Completion lost a race");
                    }
                    return;
                }
                Err(MaestroError::CircuitOpen { retry_after, .. }) => {
                    // Rejected without a call: no retry consumed, reservation kept.
                    self.monitor
                        .record_rejected(&task.agent_id, self.workflow_id, &self.task_id)
                        .await;
                    reserved = true;
                    let wait = match remaining {
                        Some(left) => retry_after.min(left),
                        None => retry_after,
                    };
                    if let Wait::Cancelled = self.wait(wait.max(Duration::from_millis(1))).await {
                        self.fail(TaskError::cancelled("cancelled while the agent circuit was open"));
                        return;
                    }
                }
                Err(e @ MaestroError::Timeout { .. }) => {
                    self.record_failed_call(&task.agent_id, elapsed_ms).await;
                    self.fail(e.to_task_error());
                    return;
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    self.record_failed_call(&task.agent_id, elapsed_ms).await;
                    let record = e.to_task_error();
                    if self
                        .registry
                        .record_retry(self.workflow_id, &self.task_id, &record)
                        .is_err()
                    {
                        return;
                    }
                    self.monitor.record_retry(&task.agent_id).await;
                    // Never sleep past the deadline; the next pass then fails the task.
                    let delay = self.config.retry.backoff(attempt);
                    let delay = remaining.map_or(delay, |left| delay.min(left));
                    attempt += 1;
                    debug!(task_id = %self.task_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying task");
                    if let Wait::Cancelled = self.wait(delay).await {
                        self.fail(record);
                        return;
                    }
                }
                Err(e) => {
                    self.record_failed_call(&task.agent_id, elapsed_ms).await;
                    self.fail(e.to_task_error());
                    return;
                }
            }
        }
    }

    async fn record_failed_call(&self, agent_id: &str, elapsed_ms: u64) {
        self.monitor
            .finish_task(agent_id, self.workflow_id, &self.task_id, false, elapsed_ms, 0)
            .await;
    }

    async fn wait(&self, delay: Duration) -> Wait {
        if self.run.cancel.is_cancelled() {
            return Wait::Cancelled;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Wait::Elapsed,
            _ = self.run.cancel.cancelled() => Wait::Cancelled,
        }
    }

    fn fail(&self, error: TaskError) {
        match self.registry.fail_task(self.workflow_id, &self.task_id, error) {
            Ok(outcome) => {
                if outcome.fail_workflow {
                    self.run.fail_fast.store(true, Ordering::Release);
                    self.run.cancel.cancel();
                    warn!(workflow_id = %self.workflow_id, task_id = %self.task_id, "Fail-fast triggered");
                }
            }
            Err(e) => debug!(task_id = %self.task_id, error = %e, "Failure lost a race"),
        }
    }

    fn dependency_values(&self, task: &Task) -> HashMap<TaskId, serde_json::Value> {
        task.dependencies
            .iter()
            .filter_map(|dep| {
                let t = self.registry.task(self.workflow_id, dep).ok()?;
                Some((dep.clone(), t.result?.value))
            })
            .collect()
    }
}
