//! Crash-recovery tests.
//!
//! A dispatcher is dropped mid-workflow and a fresh one resumes from the last
//! checkpoint plus the events published after it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::{ErrorKind, ExecutionError};
use maestro_orchestrator::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counts calls per task. Calls for `blocked_agent` never return; every
/// other call takes `delay`.
#[derive(Default)]
struct Counting {
    blocked_agent: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Counting {
    fn blocking(agent: &str) -> Self {
        Self {
            blocked_agent: Some(agent.to_string()),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls_for(&self, task: &str) -> u32 {
        self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Executor for Counting {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.task_id.clone())
            .or_insert(0) += 1;
        if self.blocked_agent.as_deref() == Some(request.agent_id.as_str()) {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ExecutionOutput::new(json!(format!("{}-done", request.task_id)), 0.9))
    }
}

fn pipeline() -> WorkflowSpec {
    WorkflowSpec::new("pipeline")
        .task(TaskSpec::new("plan", "planner"))
        .task(TaskSpec::new("draft", "writer").depends_on(["plan"]))
        .task(TaskSpec::new("edit", "editor").depends_on(["draft"]))
        .task(TaskSpec::new("publish", "publisher").depends_on(["edit"]))
}

fn count_events(events: &[Event], task: &str, kind: EventKind) -> usize {
    events
        .iter()
        .filter(|e| e.task_id.as_deref() == Some(task) && e.kind == kind)
        .count()
}

#[tokio::test]
async fn test_resume_replays_events_after_checkpoint() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(CheckpointStore::in_memory());

    let first = Dispatcher::with_components(
        OrchestratorConfig::default(),
        Arc::new(Counting::default()),
        bus.clone(),
        store.clone(),
    );
    let wf = first.submit(pipeline()).await.unwrap();
    let checkpoint = store.load(wf).await.unwrap();
    // Four task_created events precede the submission checkpoint.
    assert_eq!(checkpoint.last_applied_sequence, 4);

    // Progress made after the checkpoint exists only in the event log.
    let registry = first.registry();
    assert_eq!(registry.get_ready_tasks(wf).unwrap(), vec!["plan"]);
    registry.mark_in_progress(wf, "plan").unwrap();
    registry
        .complete_task(wf, "plan", TaskResult::new(json!("manual plan"), 0.7, 1.0))
        .unwrap();
    assert_eq!(registry.get_ready_tasks(wf).unwrap(), vec!["draft"]);
    registry.mark_in_progress(wf, "draft").unwrap();
    drop(first);

    let executor = Arc::new(Counting::default());
    let second = Dispatcher::with_components(
        OrchestratorConfig::default(),
        executor.clone(),
        bus.clone(),
        store.clone(),
    );
    let report = second.resume(wf).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(executor.calls_for("plan"), 0);
    // Was in progress at the crash: dispatched again exactly once.
    assert_eq!(executor.calls_for("draft"), 1);
    assert_eq!(executor.calls_for("edit"), 1);
    assert_eq!(executor.calls_for("publish"), 1);
    assert_eq!(
        report.task("plan").unwrap().result.as_ref().unwrap().value,
        json!("manual plan")
    );

    let events = bus.events(wf);
    for task in ["plan", "draft", "edit", "publish"] {
        assert_eq!(count_events(&events, task, EventKind::TaskCompleted), 1, "{task}");
    }
    assert_eq!(count_events(&events, "draft", EventKind::TaskStarted), 1);
}

#[tokio::test]
async fn test_replaying_twice_changes_nothing() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(CheckpointStore::in_memory());
    let dispatcher = Dispatcher::with_components(
        OrchestratorConfig::default(),
        Arc::new(Counting::default()),
        bus.clone(),
        store.clone(),
    );
    let wf = dispatcher.submit(pipeline()).await.unwrap();
    let checkpoint = store.load(wf).await.unwrap();
    let report = dispatcher.run(wf).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    // Rebuild from the submission checkpoint and replay the whole tail twice.
    let fresh = TaskRegistry::new(Arc::new(EventBus::default()));
    fresh.restore(checkpoint.workflow).unwrap();
    let from = checkpoint.last_applied_sequence + 1;
    assert!(fresh.apply_events(wf, bus.replay(wf, from)).unwrap() > 0);
    assert_eq!(fresh.apply_events(wf, bus.replay(wf, from)).unwrap(), 0);

    let restored: Vec<TaskStatus> = fresh.tasks(wf).unwrap().iter().map(|t| t.status).collect();
    let original: Vec<TaskStatus> = report.tasks.iter().map(|t| t.status).collect();
    assert_eq!(restored, original);
    assert_eq!(
        fresh.task(wf, "edit").unwrap().result.unwrap().value,
        json!("edit-done")
    );
}

#[tokio::test]
async fn test_resume_from_file_checkpoint_after_losing_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        checkpoint: CheckpointConfig {
            backend: CheckpointBackendKind::File,
            dir: dir.path().to_path_buf(),
        },
        ..OrchestratorConfig::default()
    };

    let first = Arc::new(
        Dispatcher::from_config(config.clone(), Arc::new(Counting::blocking("editor")))
            .await
            .unwrap(),
    );
    let wf = first.submit(pipeline()).await.unwrap();
    let runner = {
        let first = first.clone();
        tokio::spawn(async move { first.run(wf).await })
    };

    // Wait for a checkpoint that has `draft` done; `edit` then hangs forever.
    let mut saved = None;
    for _ in 0..500 {
        let checkpoint = first.checkpoints().load(wf).await.unwrap();
        let draft = checkpoint.workflow.tasks.iter().find(|t| t.id == "draft").unwrap();
        if draft.status == TaskStatus::Completed {
            saved = Some(checkpoint);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let saved = saved.expect("checkpoint with completed draft");
    runner.abort();
    drop(first);

    // New process: empty event log, same checkpoint directory.
    let executor = Arc::new(Counting::default());
    let second = Dispatcher::from_config(config, executor.clone()).await.unwrap();
    assert_eq!(second.checkpoints().list().await.unwrap(), vec![wf]);
    let report = second.resume(wf).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(executor.calls_for("plan"), 0);
    assert_eq!(executor.calls_for("draft"), 0);
    assert_eq!(executor.calls_for("edit"), 1);
    assert_eq!(executor.calls_for("publish"), 1);

    // Numbering continues after the checkpointed sequence.
    let events = second.events().events(wf);
    assert_eq!(events[0].sequence, saved.last_applied_sequence + 1);

    let latest = second.checkpoints().load(wf).await.unwrap();
    assert_eq!(latest.status, WorkflowStatus::Completed);
    assert!(latest.version > saved.version);
}

#[tokio::test]
async fn test_resume_of_finished_workflow_returns_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        checkpoint: CheckpointConfig {
            backend: CheckpointBackendKind::File,
            dir: dir.path().to_path_buf(),
        },
        ..OrchestratorConfig::default()
    };
    let first = Dispatcher::from_config(config.clone(), Arc::new(Counting::default()))
        .await
        .unwrap();
    let done = first.execute(pipeline()).await.unwrap();
    drop(first);

    let executor = Arc::new(Counting::default());
    let second = Dispatcher::from_config(config, executor.clone()).await.unwrap();
    let report = second.resume(done.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.progress.completed, 4);
    assert_eq!(executor.calls.lock().unwrap().len(), 0);

    second.acknowledge(done.workflow_id).await.unwrap();
    assert!(second.checkpoints().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_time_budget_spans_restarts() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(CheckpointStore::in_memory());
    let spec = WorkflowSpec::new("timed")
        .with_budget(Budget::unlimited().with_time_bound(Duration::from_millis(250)))
        .task(TaskSpec::new("a", "worker"))
        .task(TaskSpec::new("b", "worker").depends_on(["a"]))
        .task(TaskSpec::new("c", "worker").depends_on(["b"]));

    let first = Arc::new(Dispatcher::with_components(
        OrchestratorConfig::default(),
        Arc::new(Counting::slow(Duration::from_millis(150))),
        bus.clone(),
        store.clone(),
    ));
    let wf = first.submit(spec).await.unwrap();
    let runner = {
        let first = first.clone();
        tokio::spawn(async move { first.run(wf).await })
    };

    let mut saved = None;
    for _ in 0..500 {
        let checkpoint = store.load(wf).await.unwrap();
        let a = checkpoint.workflow.tasks.iter().find(|t| t.id == "a").unwrap();
        if a.status == TaskStatus::Completed {
            saved = Some(checkpoint);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let saved = saved.expect("checkpoint with completed a");
    runner.abort();
    drop(first);
    assert!(saved.elapsed_ms >= 150, "elapsed {}", saved.elapsed_ms);

    // `b` still fits in the time left; `c` does not.
    let executor = Arc::new(Counting::slow(Duration::from_millis(150)));
    let second = Dispatcher::with_components(
        OrchestratorConfig::default(),
        executor.clone(),
        bus.clone(),
        store.clone(),
    );
    let report = second.resume(wf).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::BudgetExceeded);
    assert_eq!(report.task("b").unwrap().status, TaskStatus::Completed);
    let c = report.task("c").unwrap();
    assert_eq!(c.status, TaskStatus::Skipped);
    assert_eq!(c.error.as_ref().unwrap().kind, ErrorKind::BudgetExceeded);
    assert_eq!(executor.calls_for("c"), 0);
    assert!(report.duration_ms >= 300, "duration {}", report.duration_ms);
}
