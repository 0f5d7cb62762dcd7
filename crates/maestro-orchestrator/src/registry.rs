use crate::events::{Event, EventBus, EventKind};
use crate::graph::TaskGraph;
use crate::types::{
    FailurePolicy, Progress, Task, TaskResult, TaskSpec, TaskStatus, WorkflowSpec,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use maestro_core::{
    ErrorKind, MaestroError, MaestroResult, TaskError, TaskId, ValidationError, WorkflowId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mutable part of a task, guarded by the task's own lock.
#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    result: Option<TaskResult>,
    error: Option<TaskError>,
    retry_count: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// One arena slot. Everything outside `state` is fixed at submission.
#[derive(Debug)]
struct TaskSlot {
    spec: TaskSpec,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    /// Dependencies not yet resolved.
    unmet: AtomicUsize,
    state: Mutex<TaskState>,
}

#[derive(Debug)]
struct WorkflowEntry {
    id: WorkflowId,
    spec: WorkflowSpec,
    graph: TaskGraph,
    created_at: DateTime<Utc>,
    slots: Vec<TaskSlot>,
    index: HashMap<TaskId, usize>,
    /// Set once the dispatcher stops issuing work (cancel, budget, fail-fast).
    closed: AtomicBool,
}

impl WorkflowEntry {
    fn slot(&self, task_id: &str) -> MaestroResult<(usize, &TaskSlot)> {
        self.index
            .get(task_id)
            .map(|&i| (i, &self.slots[i]))
            .ok_or_else(|| {
                MaestroError::NotFound(format!("task '{task_id}' in workflow {}", self.id))
            })
    }

    fn resolves_dependency(&self, status: TaskStatus) -> bool {
        status == TaskStatus::Completed
            || (status == TaskStatus::Skipped && self.spec.skip_satisfies_dependency)
    }

    fn view(&self, i: usize) -> Task {
        let slot = &self.slots[i];
        let state = slot.state.lock().clone();
        Task {
            id: slot.spec.id.clone(),
            workflow_id: self.id,
            agent_id: slot.spec.agent_id.clone(),
            dependencies: self
                .graph
                .dependencies_of(i)
                .iter()
                .map(|&d| self.slots[d].spec.id.clone())
                .collect(),
            status: state.status,
            result: state.result,
            error: state.error,
            retry_count: state.retry_count,
            created_at: slot.created_at,
            deadline: slot.deadline,
            input: slot.spec.input.clone(),
            optional: slot.spec.optional,
            max_retries: slot.spec.max_retries,
            authority_weight: slot.spec.authority_weight,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

/// Result of a [`TaskRegistry::fail_task`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailOutcome {
    /// False when the task was already failed and nothing changed.
    pub applied: bool,
    /// Tasks skipped as a consequence, in the order they were skipped.
    pub skipped: Vec<TaskId>,
    /// Fail-fast policy fired: the workflow must be marked failed.
    pub fail_workflow: bool,
}

/// Serializable copy of one task's mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Status when captured.
    pub status: TaskStatus,
    /// Result when completed.
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Last error.
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Retries consumed.
    #[serde(default)]
    pub retry_count: u32,
    /// Absolute deadline, if any.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// First dispatch time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time a final status was reached.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything needed to rebuild a workflow's tasks in a fresh registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Submitted definition.
    pub spec: WorkflowSpec,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Per-task state in declaration order.
    pub tasks: Vec<TaskSnapshot>,
}

/// Owns every task record and the only code allowed to mutate them.
///
/// Tasks live in a per-workflow arena indexed by task id. Each mutating call is
/// one compare-and-swap on a single task's status under that task's lock; there
/// is no lock spanning a whole workflow on the hot path. Every successful
/// transition is published on the [`EventBus`] while the task lock is held, so
/// the event order of one task always matches its transition order.
pub struct TaskRegistry {
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowEntry>>>,
    events: Arc<EventBus>,
}

impl TaskRegistry {
    /// Creates a registry publishing on `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Event bus transitions are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn entry(&self, workflow_id: WorkflowId) -> MaestroResult<Arc<WorkflowEntry>> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("workflow {workflow_id}")))
    }

    /// Validate and create a workflow. All-or-nothing: on error no task exists.
    pub fn submit(&self, spec: WorkflowSpec) -> Result<WorkflowId, ValidationError> {
        let graph = TaskGraph::build(&spec)?;
        let id = WorkflowId::new();
        let now = Utc::now();

        let slots: Vec<TaskSlot> = spec
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| TaskSlot {
                spec: t.clone(),
                created_at: now,
                deadline: t.deadline.or_else(|| {
                    t.timeout_ms
                        .map(|ms| now + ChronoDuration::milliseconds(ms as i64))
                }),
                unmet: AtomicUsize::new(graph.dependencies_of(i).len()),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    result: None,
                    error: None,
                    retry_count: 0,
                    started_at: None,
                    finished_at: None,
                }),
            })
            .collect();
        let index = spec
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let entry = Arc::new(WorkflowEntry {
            id,
            spec,
            graph,
            created_at: now,
            slots,
            index,
            closed: AtomicBool::new(false),
        });
        self.workflows.write().insert(id, entry.clone());

        for (i, slot) in entry.slots.iter().enumerate() {
            let deps: Vec<&TaskId> = entry
                .graph
                .dependencies_of(i)
                .iter()
                .map(|&d| &entry.slots[d].spec.id)
                .collect();
            self.events.publish(
                id,
                Some(slot.spec.id.as_str()),
                EventKind::TaskCreated,
                serde_json::json!({ "agent_id": slot.spec.agent_id, "dependencies": deps }),
            );
        }

        info!(
            workflow_id = %id,
            name = %entry.spec.name,
            tasks = entry.slots.len(),
            policy = ?entry.spec.failure_policy,
            "Workflow submitted"
        );
        Ok(id)
    }

    /// Move every pending task whose dependencies are resolved to `ready`.
    ///
    /// Returns the ids this call moved, in creation order. A task lost to a
    /// concurrent caller is silently left out.
    pub fn get_ready_tasks(&self, workflow_id: WorkflowId) -> MaestroResult<Vec<TaskId>> {
        let entry = self.entry(workflow_id)?;
        if entry.closed.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }

        let mut ready = Vec::new();
        for slot in &entry.slots {
            if slot.unmet.load(Ordering::Acquire) != 0 {
                continue;
            }
            let mut state = slot.state.lock();
            if state.status != TaskStatus::Pending {
                continue;
            }
            state.status = TaskStatus::Ready;
            self.events
                .publish(workflow_id, Some(slot.spec.id.as_str()), EventKind::TaskReady, serde_json::Value::Null);
            ready.push(slot.spec.id.clone());
        }

        if !ready.is_empty() {
            debug!(workflow_id = %workflow_id, count = ready.len(), "Tasks ready");
        }
        Ok(ready)
    }

    /// CAS `ready -> in_progress`.
    pub fn mark_in_progress(&self, workflow_id: WorkflowId, task_id: &str) -> MaestroResult<()> {
        let entry = self.entry(workflow_id)?;
        let (_, slot) = entry.slot(task_id)?;
        let mut state = slot.state.lock();
        expect_status(task_id, &state, TaskStatus::Ready)?;
        state.status = TaskStatus::InProgress;
        state.started_at = Some(Utc::now());
        self.events.publish(
            workflow_id,
            Some(task_id),
            EventKind::TaskStarted,
            serde_json::json!({ "agent_id": slot.spec.agent_id }),
        );
        Ok(())
    }

    /// CAS `in_progress -> completed` and unlock dependents.
    ///
    /// Idempotent by task id: completing an already completed task is a no-op
    /// and emits nothing, whatever the second result contains.
    pub fn complete_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &str,
        result: TaskResult,
    ) -> MaestroResult<()> {
        let entry = self.entry(workflow_id)?;
        let (i, slot) = entry.slot(task_id)?;
        {
            let mut state = slot.state.lock();
            if state.status == TaskStatus::Completed {
                debug!(workflow_id = %workflow_id, task_id, "Duplicate completion ignored");
                return Ok(());
            }
            expect_status(task_id, &state, TaskStatus::InProgress)?;
            state.status = TaskStatus::Completed;
            state.finished_at = Some(Utc::now());
            self.events.publish(
                workflow_id,
                Some(task_id),
                EventKind::TaskCompleted,
                serde_json::json!({ "result": result }),
            );
            state.result = Some(result);
        }
        release_dependents(&entry, i);
        info!(workflow_id = %workflow_id, task_id, "Task completed");
        Ok(())
    }

    /// CAS `in_progress -> failed`, then apply the workflow's failure policy.
    pub fn fail_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &str,
        error: TaskError,
    ) -> MaestroResult<FailOutcome> {
        let entry = self.entry(workflow_id)?;
        let (i, slot) = entry.slot(task_id)?;
        {
            let mut state = slot.state.lock();
            if state.status == TaskStatus::Failed {
                return Ok(FailOutcome::default());
            }
            expect_status(task_id, &state, TaskStatus::InProgress)?;
            // A timed-out attempt counts as a spent attempt.
            if error.kind == ErrorKind::Timeout {
                state.retry_count += 1;
            }
            state.status = TaskStatus::Failed;
            state.finished_at = Some(Utc::now());
            self.events.publish(
                workflow_id,
                Some(task_id),
                EventKind::TaskFailed,
                serde_json::json!({ "error": error, "retry_count": state.retry_count }),
            );
            state.error = Some(error.clone());
        }
        warn!(workflow_id = %workflow_id, task_id, error = %error, "Task failed");

        let cause = error.caused_by(task_id);
        let mut outcome = FailOutcome {
            applied: true,
            ..FailOutcome::default()
        };
        match entry.spec.failure_policy {
            FailurePolicy::Isolate => {}
            FailurePolicy::CascadeSkip => {
                // Under skip_satisfies_dependency a skipped task releases its
                // own dependents, so only the direct ones are skipped.
                let targets = if entry.spec.skip_satisfies_dependency {
                    entry.graph.dependents_of(i).to_vec()
                } else {
                    entry.graph.transitive_dependents(i)
                };
                for d in targets {
                    if self.skip_slot(&entry, d, &cause) {
                        outcome.skipped.push(entry.slots[d].spec.id.clone());
                    }
                }
            }
            FailurePolicy::FailFast => {
                entry.closed.store(true, Ordering::Release);
                outcome.fail_workflow = true;
                for d in 0..entry.slots.len() {
                    if d != i && self.skip_slot(&entry, d, &cause) {
                        outcome.skipped.push(entry.slots[d].spec.id.clone());
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Explicitly skip a pending or ready task.
    ///
    /// With `skip_satisfies_dependency` its dependents treat it as resolved;
    /// otherwise the cascade rule of the failure policy applies to them.
    pub fn skip_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &str,
        reason: impl Into<String>,
    ) -> MaestroResult<Vec<TaskId>> {
        let entry = self.entry(workflow_id)?;
        let (i, _) = entry.slot(task_id)?;
        let error = TaskError::new(ErrorKind::SkipRequested, reason);
        if !self.skip_slot(&entry, i, &error) {
            let state = entry.slots[i].state.lock();
            if state.status == TaskStatus::Skipped {
                return Ok(Vec::new());
            }
            return Err(stale(task_id, "pending or ready", state.status));
        }

        let mut skipped = vec![task_id.to_string()];
        if !entry.spec.skip_satisfies_dependency
            && entry.spec.failure_policy == FailurePolicy::CascadeSkip
        {
            let cause = error.caused_by(task_id);
            for d in entry.graph.transitive_dependents(i) {
                if self.skip_slot(&entry, d, &cause) {
                    skipped.push(entry.slots[d].spec.id.clone());
                }
            }
        }
        Ok(skipped)
    }

    /// Skip every pending or ready task (cancellation, budget exhaustion).
    pub fn skip_unfinished(
        &self,
        workflow_id: WorkflowId,
        error: TaskError,
    ) -> MaestroResult<Vec<TaskId>> {
        let entry = self.entry(workflow_id)?;
        entry.closed.store(true, Ordering::Release);
        let mut skipped = Vec::new();
        for i in 0..entry.slots.len() {
            if self.skip_slot(&entry, i, &error) {
                skipped.push(entry.slots[i].spec.id.clone());
            }
        }
        Ok(skipped)
    }

    /// CAS `{pending, ready} -> skipped`. Returns whether this call moved the task.
    fn skip_slot(&self, entry: &WorkflowEntry, i: usize, error: &TaskError) -> bool {
        let slot = &entry.slots[i];
        {
            let mut state = slot.state.lock();
            if !matches!(state.status, TaskStatus::Pending | TaskStatus::Ready) {
                return false;
            }
            state.status = TaskStatus::Skipped;
            state.finished_at = Some(Utc::now());
            state.error = Some(error.clone());
            self.events.publish(
                entry.id,
                Some(slot.spec.id.as_str()),
                EventKind::TaskSkipped,
                serde_json::json!({ "error": error }),
            );
        }
        if entry.spec.skip_satisfies_dependency {
            release_dependents(entry, i);
        }
        debug!(workflow_id = %entry.id, task_id = %slot.spec.id, "Task skipped");
        true
    }

    /// Count one failed attempt on an in-progress task. Returns the new retry count.
    pub fn record_retry(
        &self,
        workflow_id: WorkflowId,
        task_id: &str,
        error: &TaskError,
    ) -> MaestroResult<u32> {
        let entry = self.entry(workflow_id)?;
        let (_, slot) = entry.slot(task_id)?;
        let mut state = slot.state.lock();
        expect_status(task_id, &state, TaskStatus::InProgress)?;
        state.retry_count += 1;
        self.events.publish(
            workflow_id,
            Some(task_id),
            EventKind::TaskRetried,
            serde_json::json!({ "retry_count": state.retry_count, "error": error }),
        );
        Ok(state.retry_count)
    }

    /// Stop issuing `ready` transitions for this workflow.
    pub fn close_workflow(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        self.entry(workflow_id)?.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether a workflow accepts no more dispatches.
    pub fn is_closed(&self, workflow_id: WorkflowId) -> MaestroResult<bool> {
        Ok(self.entry(workflow_id)?.closed.load(Ordering::Acquire))
    }

    /// Copy of one task.
    pub fn task(&self, workflow_id: WorkflowId, task_id: &str) -> MaestroResult<Task> {
        let entry = self.entry(workflow_id)?;
        let (i, _) = entry.slot(task_id)?;
        Ok(entry.view(i))
    }

    /// All tasks in creation order.
    pub fn tasks(&self, workflow_id: WorkflowId) -> MaestroResult<Vec<Task>> {
        let entry = self.entry(workflow_id)?;
        Ok((0..entry.slots.len()).map(|i| entry.view(i)).collect())
    }

    /// Tasks currently in `status`.
    pub fn tasks_in_status(
        &self,
        workflow_id: WorkflowId,
        status: TaskStatus,
    ) -> MaestroResult<Vec<TaskId>> {
        let entry = self.entry(workflow_id)?;
        Ok(entry
            .slots
            .iter()
            .filter(|s| s.state.lock().status == status)
            .map(|s| s.spec.id.clone())
            .collect())
    }

    /// Tasks nothing depends on, in creation order.
    pub fn terminal_tasks(&self, workflow_id: WorkflowId) -> MaestroResult<Vec<Task>> {
        let entry = self.entry(workflow_id)?;
        Ok(entry.graph.sinks().into_iter().map(|i| entry.view(i)).collect())
    }

    /// Task counts per status.
    pub fn progress(&self, workflow_id: WorkflowId) -> MaestroResult<Progress> {
        let entry = self.entry(workflow_id)?;
        let mut progress = Progress::default();
        for slot in &entry.slots {
            progress.count(slot.state.lock().status);
        }
        Ok(progress)
    }

    /// True when nothing is running and no further task can become ready.
    pub fn is_settled(&self, workflow_id: WorkflowId) -> MaestroResult<bool> {
        let entry = self.entry(workflow_id)?;
        let closed = entry.closed.load(Ordering::Acquire);
        for slot in &entry.slots {
            let status = slot.state.lock().status;
            match status {
                TaskStatus::InProgress => return Ok(false),
                TaskStatus::Ready if !closed => return Ok(false),
                TaskStatus::Pending if !closed && slot.unmet.load(Ordering::Acquire) == 0 => {
                    return Ok(false)
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Submitted definition of a workflow.
    pub fn spec(&self, workflow_id: WorkflowId) -> MaestroResult<WorkflowSpec> {
        Ok(self.entry(workflow_id)?.spec.clone())
    }

    /// Registered workflows.
    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.workflows.read().keys().copied().collect()
    }

    /// Whether a workflow is registered.
    pub fn contains(&self, workflow_id: WorkflowId) -> bool {
        self.workflows.read().contains_key(&workflow_id)
    }

    /// Drop a workflow and all its tasks.
    pub fn remove(&self, workflow_id: WorkflowId) -> bool {
        self.workflows.write().remove(&workflow_id).is_some()
    }

    /// Copy of every task's state, suitable for checkpointing.
    pub fn snapshot(&self, workflow_id: WorkflowId) -> MaestroResult<WorkflowSnapshot> {
        let entry = self.entry(workflow_id)?;
        let tasks = entry
            .slots
            .iter()
            .map(|slot| {
                let state = slot.state.lock();
                TaskSnapshot {
                    id: slot.spec.id.clone(),
                    status: state.status,
                    result: state.result.clone(),
                    error: state.error.clone(),
                    retry_count: state.retry_count,
                    deadline: slot.deadline,
                    started_at: state.started_at,
                    finished_at: state.finished_at,
                }
            })
            .collect();
        Ok(WorkflowSnapshot {
            workflow_id,
            spec: entry.spec.clone(),
            created_at: entry.created_at,
            tasks,
        })
    }

    /// Rebuild a workflow from a snapshot without publishing any event.
    ///
    /// Replaces any in-memory copy of the same workflow.
    pub fn restore(&self, snapshot: WorkflowSnapshot) -> MaestroResult<()> {
        let graph = TaskGraph::build(&snapshot.spec)?;
        let mut saved: HashMap<TaskId, TaskSnapshot> = snapshot
            .tasks
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let slots: Vec<TaskSlot> = snapshot
            .spec
            .tasks
            .iter()
            .map(|t| {
                let s = saved.remove(&t.id);
                let state = match &s {
                    Some(s) => TaskState {
                        status: s.status,
                        result: s.result.clone(),
                        error: s.error.clone(),
                        retry_count: s.retry_count,
                        started_at: s.started_at,
                        finished_at: s.finished_at,
                    },
                    None => TaskState {
                        status: TaskStatus::Pending,
                        result: None,
                        error: None,
                        retry_count: 0,
                        started_at: None,
                        finished_at: None,
                    },
                };
                TaskSlot {
                    spec: t.clone(),
                    created_at: snapshot.created_at,
                    deadline: s.and_then(|s| s.deadline).or(t.deadline),
                    unmet: AtomicUsize::new(0),
                    state: Mutex::new(state),
                }
            })
            .collect();
        let index = snapshot
            .spec
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let entry = WorkflowEntry {
            id: snapshot.workflow_id,
            spec: snapshot.spec,
            graph,
            created_at: snapshot.created_at,
            slots,
            index,
            closed: AtomicBool::new(false),
        };
        recompute_unmet(&entry);
        self.workflows
            .write()
            .insert(snapshot.workflow_id, Arc::new(entry));
        info!(workflow_id = %snapshot.workflow_id, "Workflow restored from snapshot");
        Ok(())
    }

    /// Re-apply replayed events on top of a restored snapshot.
    ///
    /// Events whose transition is already reflected (same or later status) are
    /// ignored, so applying the same event twice never changes anything.
    /// Returns how many events changed state.
    pub fn apply_events<I>(&self, workflow_id: WorkflowId, events: I) -> MaestroResult<usize>
    where
        I: IntoIterator<Item = Event>,
    {
        let entry = self.entry(workflow_id)?;
        let mut applied = 0;
        for event in events {
            if event.workflow_id != workflow_id {
                continue;
            }
            let Some(task_id) = event.task_id.as_deref() else {
                continue;
            };
            let Ok((_, slot)) = entry.slot(task_id) else {
                warn!(workflow_id = %workflow_id, task_id, "Replayed event for unknown task");
                continue;
            };
            let mut state = slot.state.lock();
            if apply_to_state(&mut state, &event) {
                applied += 1;
            }
        }
        recompute_unmet(&entry);
        debug!(workflow_id = %workflow_id, applied, "Replayed events applied");
        Ok(applied)
    }
}

/// Transition implied by one replayed event, applied only if it moves forward.
fn apply_to_state(state: &mut TaskState, event: &Event) -> bool {
    let target = match event.kind {
        EventKind::TaskReady => TaskStatus::Ready,
        EventKind::TaskStarted => TaskStatus::InProgress,
        EventKind::TaskCompleted => TaskStatus::Completed,
        EventKind::TaskFailed => TaskStatus::Failed,
        EventKind::TaskSkipped => TaskStatus::Skipped,
        EventKind::TaskRetried => {
            let count = event.payload["retry_count"].as_u64().unwrap_or(0) as u32;
            if count > state.retry_count && state.status == TaskStatus::InProgress {
                state.retry_count = count;
                return true;
            }
            return false;
        }
        _ => return false,
    };
    if !state.status.can_advance_to(target) {
        return false;
    }
    state.status = target;
    match target {
        TaskStatus::InProgress => state.started_at = Some(event.timestamp),
        TaskStatus::Completed => {
            state.result = serde_json::from_value(event.payload["result"].clone()).ok();
            state.finished_at = Some(event.timestamp);
        }
        TaskStatus::Failed | TaskStatus::Skipped => {
            state.error = serde_json::from_value(event.payload["error"].clone()).ok();
            if let Some(count) = event.payload["retry_count"].as_u64() {
                state.retry_count = state.retry_count.max(count as u32);
            }
            state.finished_at = Some(event.timestamp);
        }
        _ => {}
    }
    true
}

fn release_dependents(entry: &WorkflowEntry, i: usize) {
    for &d in entry.graph.dependents_of(i) {
        // Saturating: a snapshot restore may already have counted this dependency.
        let _ = entry
            .slots[d]
            .unmet
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

fn recompute_unmet(entry: &WorkflowEntry) {
    let statuses: Vec<TaskStatus> = entry.slots.iter().map(|s| s.state.lock().status).collect();
    for (i, slot) in entry.slots.iter().enumerate() {
        let unmet = entry
            .graph
            .dependencies_of(i)
            .iter()
            .filter(|&&d| !entry.resolves_dependency(statuses[d]))
            .count();
        slot.unmet.store(unmet, Ordering::Release);
    }
}

fn expect_status(task_id: &str, state: &TaskState, expected: TaskStatus) -> MaestroResult<()> {
    if state.status == expected {
        Ok(())
    } else {
        Err(stale(task_id, &expected.to_string(), state.status))
    }
}

fn stale(task_id: &str, expected: &str, actual: TaskStatus) -> MaestroError {
    MaestroError::StaleState {
        task_id: task_id.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
