use maestro_core::{AgentId, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No task in flight.
    Idle,
    /// At least one task in flight.
    Working,
    /// The last call failed.
    Error,
}

/// Cumulative per-agent counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Calls made.
    pub calls: u64,
    /// Calls that succeeded.
    pub successes: u64,
    /// Calls that failed.
    pub errors: u64,
    /// Attempts that were retried.
    pub retries: u64,
    /// Calls refused by the breaker.
    pub rejected: u64,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Time spent in calls.
    pub duration_ms: u64,
}

/// Activity of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent id.
    pub agent_id: AgentId,
    /// Current status.
    pub status: WorkerStatus,
    /// Tasks currently executing on this agent.
    pub in_flight: Vec<(WorkflowId, TaskId)>,
    /// Counters since start.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: WorkerStatus::Idle,
            in_flight: Vec::new(),
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks state and metrics for every agent the dispatcher has called.
#[derive(Clone, Default)]
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<AgentId, AgentState>>>,
}

impl AgentMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an agent as working on a task.
    pub async fn start_task(&self, agent_id: &str, workflow_id: WorkflowId, task_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id));
        state.in_flight.push((workflow_id, task_id.to_string()));
        state.status = WorkerStatus::Working;
        state.metrics.calls += 1;
    }

    /// Record the end of a call started with [`start_task`](Self::start_task).
    pub async fn finish_task(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        task_id: &str,
        success: bool,
        duration_ms: u64,
        tokens: u64,
    ) {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(agent_id) else {
            return;
        };
        if let Some(pos) = state
            .in_flight
            .iter()
            .position(|(w, t)| *w == workflow_id && t == task_id)
        {
            state.in_flight.remove(pos);
        }
        state.metrics.duration_ms += duration_ms;
        state.metrics.tokens_used += tokens;
        if success {
            state.metrics.successes += 1;
        } else {
            state.metrics.errors += 1;
        }
        state.status = match (state.in_flight.is_empty(), success) {
            (false, _) => WorkerStatus::Working,
            (true, true) => WorkerStatus::Idle,
            (true, false) => WorkerStatus::Error,
        };
    }

    /// Counts a retried attempt.
    pub async fn record_retry(&self, agent_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_id) {
            state.metrics.retries += 1;
        }
    }

    /// Undo a [`start_task`](Self::start_task) whose call the agent's circuit
    /// breaker rejected before it reached the executor.
    pub async fn record_rejected(&self, agent_id: &str, workflow_id: WorkflowId, task_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id));
        state.metrics.rejected += 1;
        if let Some(pos) = state
            .in_flight
            .iter()
            .position(|(w, t)| *w == workflow_id && t == task_id)
        {
            state.in_flight.remove(pos);
            state.metrics.calls = state.metrics.calls.saturating_sub(1);
        }
        if state.in_flight.is_empty() && state.status == WorkerStatus::Working {
            state.status = WorkerStatus::Idle;
        }
    }

    /// All agent states, sorted by agent id.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut out: Vec<AgentState> = states.values().cloned().collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// State of one agent.
    pub async fn get_state(&self, agent_id: &str) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(agent_id).cloned()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.calls += state.metrics.calls;
            total.successes += state.metrics.successes;
            total.errors += state.metrics.errors;
            total.retries += state.metrics.retries;
            total.rejected += state.metrics.rejected;
            total.tokens_used += state.metrics.tokens_used;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_agent_has_no_state() {
        let monitor = AgentMonitor::new();
        assert!(monitor.get_state("nobody").await.is_none());
        assert!(monitor.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = AgentMonitor::new();
        let wf = WorkflowId::new();

        monitor.start_task("coder", wf, "t1").await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.in_flight, vec![(wf, "t1".to_string())]);

        monitor.finish_task("coder", wf, "t1", true, 40, 1500).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert!(state.in_flight.is_empty());
        assert_eq!(state.metrics.successes, 1);
        assert_eq!(state.metrics.tokens_used, 1500);
        assert_eq!(state.metrics.duration_ms, 40);
    }

    #[tokio::test]
    async fn test_overlapping_calls_stay_working() {
        let monitor = AgentMonitor::new();
        let wf = WorkflowId::new();
        monitor.start_task("coder", wf, "a").await;
        monitor.start_task("coder", wf, "b").await;
        monitor.finish_task("coder", wf, "a", false, 0, 0).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);

        monitor.finish_task("coder", wf, "b", false, 0, 0).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Error);
        assert_eq!(state.metrics.errors, 2);
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let monitor = AgentMonitor::new();
        let wf = WorkflowId::new();
        monitor.start_task("coder", wf, "a").await;
        monitor.finish_task("coder", wf, "a", true, 10, 1000).await;
        monitor.start_task("tester", wf, "b").await;
        monitor.finish_task("tester", wf, "b", false, 5, 500).await;
        monitor.record_retry("tester").await;
        monitor.start_task("tester", wf, "c").await;
        monitor.record_rejected("tester", wf, "c").await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.calls, 2);
        assert_eq!(agg.tokens_used, 1500);
        assert_eq!(agg.errors, 1);
        assert_eq!(agg.retries, 1);
        assert_eq!(agg.rejected, 1);
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_counted() {
        let monitor = AgentMonitor::new();
        let wf = WorkflowId::new();
        monitor.start_task("flaky", wf, "t1").await;
        monitor.record_rejected("flaky", wf, "t1").await;
        let state = monitor.get_state("flaky").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!(state.metrics.calls, 0);
        assert_eq!(state.metrics.rejected, 1);
        assert!(state.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = AgentMonitor::new();
        monitor.start_task("spec", WorkflowId::new(), "a").await;
        let json = monitor.to_json().await;
        assert!(json["agents"].is_array());
        assert!(json["aggregate"].is_object());
    }
}
