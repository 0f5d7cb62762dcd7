//! Per-agent circuit breakers.
//!
//! Each agent has an independent breaker with three states:
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected without invoking the executor
//! - HalfOpen: exactly one trial call is admitted to test recovery

use crate::events::{EventBus, EventKind};
use maestro_core::{AgentId, MaestroError, MaestroResult, TaskId, WorkflowId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on the wait suggested to callers rejected during a trial call.
const TRIAL_RETRY_HINT: Duration = Duration::from_millis(100);

/// Breaker state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A single trial call decides whether to close again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-agent threshold overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerOverride {
    /// Replaces the global failure threshold.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    /// Replaces the global reset timeout.
    #[serde(default)]
    pub reset_timeout_ms: Option<u64>,
}

/// Breaker settings shared by all agents unless overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial call.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Per-agent overrides keyed by agent id.
    #[serde(default)]
    pub overrides: HashMap<AgentId, BreakerOverride>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            overrides: HashMap::new(),
        }
    }
}

impl BreakerConfig {
    /// Sets the global failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the global reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Adds an override for one agent.
    #[must_use]
    pub fn with_override(mut self, agent_id: impl Into<AgentId>, value: BreakerOverride) -> Self {
        self.overrides.insert(agent_id.into(), value);
        self
    }

    /// Effective threshold and reset timeout for one agent.
    pub fn for_agent(&self, agent_id: &str) -> (u32, Duration) {
        let o = self.overrides.get(agent_id);
        let threshold = o
            .and_then(|o| o.failure_threshold)
            .unwrap_or(self.failure_threshold)
            .max(1);
        let reset = o
            .and_then(|o| o.reset_timeout_ms)
            .unwrap_or(self.reset_timeout_ms);
        (threshold, Duration::from_millis(reset))
    }
}

/// The workflow task on whose behalf a guarded call is made.
///
/// Breaker transitions are published to this workflow's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOrigin {
    /// Workflow the call belongs to.
    pub workflow_id: WorkflowId,
    /// Task the call executes.
    pub task_id: TaskId,
}

impl CallOrigin {
    /// Creates an origin for a task of a workflow.
    pub fn new(workflow_id: WorkflowId, task_id: impl Into<TaskId>) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
        }
    }
}

/// Point-in-time view of one agent's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Agent guarded by this breaker.
    pub agent_id: AgentId,
    /// Current circuit state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// Time until an open circuit admits a trial call.
    pub retry_after_ms: Option<u64>,
    /// Calls admitted since creation.
    pub total_calls: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls refused while open.
    pub rejected: u64,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    failure_threshold: u32,
    reset_timeout: Duration,
    total_calls: u64,
    total_failures: u64,
    rejected: u64,
}

impl Breaker {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            failure_threshold,
            reset_timeout,
            total_calls: 0,
            total_failures: 0,
            rejected: 0,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self.state {
            CircuitState::Closed => None,
            CircuitState::Open => Some(
                self.opened_at
                    .map_or(Duration::ZERO, |at| self.reset_timeout.saturating_sub(at.elapsed())),
            ),
            CircuitState::HalfOpen => Some(self.reset_timeout.min(TRIAL_RETRY_HINT)),
        }
    }
}

/// Decides whether a call may proceed. Returns whether it is the half-open trial.
fn admit(agent_id: &str, b: &mut Breaker) -> MaestroResult<bool> {
    match b.state {
        CircuitState::Closed => {}
        CircuitState::Open => {
            let elapsed = b.opened_at.map_or(b.reset_timeout, |at| at.elapsed());
            if elapsed < b.reset_timeout {
                b.rejected += 1;
                return Err(MaestroError::CircuitOpen {
                    agent_id: agent_id.to_string(),
                    retry_after: b.reset_timeout - elapsed,
                });
            }
            b.state = CircuitState::HalfOpen;
            b.trial_in_flight = true;
            b.total_calls += 1;
            info!(agent_id, "Circuit breaker half-open, admitting trial call");
            return Ok(true);
        }
        CircuitState::HalfOpen => {
            if b.trial_in_flight {
                b.rejected += 1;
                return Err(MaestroError::CircuitOpen {
                    agent_id: agent_id.to_string(),
                    retry_after: b.reset_timeout.min(TRIAL_RETRY_HINT),
                });
            }
            b.trial_in_flight = true;
            b.total_calls += 1;
            return Ok(true);
        }
    }
    b.total_calls += 1;
    Ok(false)
}

/// Releases the trial slot if a guarded call is dropped before it settles.
struct TrialGuard<'a> {
    breaker: &'a Mutex<Breaker>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// Independent circuit breakers keyed by agent id.
///
/// A breaker is created lazily on first use. Concurrent calls to the same
/// agent serialize on that agent's breaker only; different agents never
/// contend.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    events: Arc<EventBus>,
    breakers: RwLock<HashMap<AgentId, Arc<Mutex<Breaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry publishing transitions on `events`.
    pub fn new(config: BreakerConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            events,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn breaker(&self, agent_id: &str) -> Arc<Mutex<Breaker>> {
        if let Some(b) = self.breakers.read().get(agent_id) {
            return b.clone();
        }
        let (threshold, reset) = self.config.for_agent(agent_id);
        self.breakers
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(threshold, reset))))
            .clone()
    }

    /// Run `call` under the agent's breaker.
    ///
    /// Returns [`MaestroError::CircuitOpen`] without running `call` when the
    /// breaker rejects. Every error returned by `call` counts as a failure.
    pub async fn guard<T, F, Fut>(
        &self,
        agent_id: &str,
        origin: &CallOrigin,
        call: F,
    ) -> MaestroResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MaestroResult<T>>,
    {
        let breaker = self.breaker(agent_id);
        let trial = admit(agent_id, &mut breaker.lock())?;
        let mut guard = TrialGuard {
            breaker: &breaker,
            armed: trial,
        };

        let outcome = call().await;

        guard.armed = false;
        let mut b = breaker.lock();
        if trial {
            b.trial_in_flight = false;
        }
        match &outcome {
            Ok(_) => self.on_success(agent_id, origin, &mut b, trial),
            Err(e) => self.on_failure(agent_id, origin, &mut b, trial, e),
        }
        outcome
    }

    fn on_success(&self, agent_id: &str, origin: &CallOrigin, b: &mut Breaker, trial: bool) {
        match b.state {
            CircuitState::Closed => b.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                b.state = CircuitState::Closed;
                b.consecutive_failures = 0;
                b.opened_at = None;
                info!(agent_id, "Circuit breaker closed after successful trial");
                self.events.publish(
                    origin.workflow_id,
                    Some(origin.task_id.as_str()),
                    EventKind::CircuitClosed,
                    serde_json::json!({ "agent_id": agent_id }),
                );
            }
            // A call admitted before the circuit opened says nothing about recovery.
            _ => {}
        }
    }

    fn on_failure(
        &self,
        agent_id: &str,
        origin: &CallOrigin,
        b: &mut Breaker,
        trial: bool,
        error: &MaestroError,
    ) {
        b.total_failures += 1;
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);
        let should_open = match b.state {
            CircuitState::Closed => b.consecutive_failures >= b.failure_threshold,
            CircuitState::HalfOpen => trial,
            CircuitState::Open => false,
        };
        if !should_open {
            debug!(
                agent_id,
                failures = b.consecutive_failures,
                threshold = b.failure_threshold,
                "Circuit breaker recorded failure"
            );
            return;
        }

        b.state = CircuitState::Open;
        b.opened_at = Some(Instant::now());
        warn!(
            agent_id,
            failures = b.consecutive_failures,
            error = %error,
            "Circuit breaker opened"
        );
        self.events.publish(
            origin.workflow_id,
            Some(origin.task_id.as_str()),
            EventKind::CircuitOpened,
            serde_json::json!({
                "agent_id": agent_id,
                "consecutive_failures": b.consecutive_failures,
                "reset_timeout_ms": b.reset_timeout.as_millis() as u64,
                "error": error.to_string(),
            }),
        );
    }

    /// Current state; agents never seen are closed.
    pub fn state(&self, agent_id: &str) -> CircuitState {
        self.breakers
            .read()
            .get(agent_id)
            .map_or(CircuitState::Closed, |b| b.lock().state)
    }

    /// Time until the agent's breaker admits a call, `None` when closed.
    pub fn retry_after(&self, agent_id: &str) -> Option<Duration> {
        self.breakers
            .read()
            .get(agent_id)
            .and_then(|b| b.lock().retry_after())
    }

    /// Snapshot of one agent's breaker.
    pub fn snapshot(&self, agent_id: &str) -> Option<BreakerSnapshot> {
        let b = self.breakers.read().get(agent_id)?.clone();
        let b = b.lock();
        Some(BreakerSnapshot {
            agent_id: agent_id.to_string(),
            state: b.state,
            consecutive_failures: b.consecutive_failures,
            failure_threshold: b.failure_threshold,
            retry_after_ms: b.retry_after().map(|d| d.as_millis() as u64),
            total_calls: b.total_calls,
            total_failures: b.total_failures,
            rejected: b.rejected,
        })
    }

    /// Snapshots of every known agent, sorted by agent id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut ids: Vec<AgentId> = self.breakers.read().keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Force an agent's breaker back to closed.
    pub fn reset(&self, agent_id: &str) {
        let (threshold, reset) = self.config.for_agent(agent_id);
        if let Some(b) = self.breakers.read().get(agent_id) {
            *b.lock() = Breaker::new(threshold, reset);
            info!(agent_id, "Circuit breaker reset");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::ExecutionError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry(threshold: u32, reset: Duration) -> (CircuitBreakerRegistry, Arc<EventBus>) {
        let events = Arc::new(EventBus::default());
        let config = BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout(reset);
        (CircuitBreakerRegistry::new(config, events.clone()), events)
    }

    fn origin() -> CallOrigin {
        CallOrigin::new(WorkflowId::new(), "task")
    }

    async fn fail(reg: &CircuitBreakerRegistry, agent: &str, o: &CallOrigin) -> MaestroError {
        reg.guard(agent, o, || async {
            Err::<(), _>(MaestroError::from(ExecutionError::transient("boom")))
        })
        .await
        .unwrap_err()
    }

    async fn succeed(reg: &CircuitBreakerRegistry, agent: &str, o: &CallOrigin) -> MaestroResult<u32> {
        reg.guard(agent, o, || async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let (reg, events) = registry(3, Duration::from_secs(60));
        let o = origin();
        for _ in 0..3 {
            fail(&reg, "X", &o).await;
        }
        assert_eq!(reg.state("X"), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = reg
            .guard("X", &o, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let opened = events
            .events(o.workflow_id)
            .into_iter()
            .filter(|e| e.kind == EventKind::CircuitOpened)
            .count();
        assert_eq!(opened, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (reg, _) = registry(3, Duration::from_secs(60));
        let o = origin();
        fail(&reg, "X", &o).await;
        fail(&reg, "X", &o).await;
        succeed(&reg, "X", &o).await.unwrap();
        fail(&reg, "X", &o).await;
        fail(&reg, "X", &o).await;
        assert_eq!(reg.state("X"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes() {
        let (reg, events) = registry(1, Duration::from_millis(20));
        let o = origin();
        fail(&reg, "X", &o).await;
        assert_eq!(reg.state("X"), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(succeed(&reg, "X", &o).await.unwrap(), 7);
        assert_eq!(reg.state("X"), CircuitState::Closed);
        assert!(events
            .events(o.workflow_id)
            .iter()
            .any(|e| e.kind == EventKind::CircuitClosed));
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens() {
        let (reg, _) = registry(1, Duration::from_millis(20));
        let o = origin();
        fail(&reg, "X", &o).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&reg, "X", &o).await;
        assert_eq!(reg.state("X"), CircuitState::Open);
        let retry = reg.retry_after("X").unwrap();
        assert!(retry > Duration::from_millis(5));
    }

    #[tokio::test]
    async fn half_open_admits_single_trial() {
        let (reg, _) = registry(1, Duration::from_millis(10));
        let reg = Arc::new(reg);
        let o = origin();
        fail(&reg, "X", &o).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let reg = reg.clone();
            let o = o.clone();
            tokio::spawn(async move {
                reg.guard("X", &o, || async {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };
        for _ in 0..100 {
            if reg.state("X") == CircuitState::HalfOpen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = succeed(&reg, "X", &o).await.unwrap_err();
        assert!(matches!(err, MaestroError::CircuitOpen { .. }));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(reg.state("X"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_releases_slot() {
        let (reg, _) = registry(1, Duration::from_millis(10));
        let o = origin();
        fail(&reg, "X", &o).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = reg.guard("X", &o, || std::future::pending::<MaestroResult<()>>());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert_eq!(reg.state("X"), CircuitState::HalfOpen);

        succeed(&reg, "X", &o).await.unwrap();
        assert_eq!(reg.state("X"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn agents_are_independent() {
        let (reg, _) = registry(1, Duration::from_secs(60));
        let o = origin();
        fail(&reg, "X", &o).await;
        assert_eq!(reg.state("X"), CircuitState::Open);
        assert_eq!(reg.state("Y"), CircuitState::Closed);
        succeed(&reg, "Y", &o).await.unwrap();
    }

    #[tokio::test]
    async fn overrides_and_reset() {
        let events = Arc::new(EventBus::default());
        let config = BreakerConfig::default().with_failure_threshold(10).with_override(
            "fragile",
            BreakerOverride {
                failure_threshold: Some(1),
                reset_timeout_ms: None,
            },
        );
        let reg = CircuitBreakerRegistry::new(config, events);
        let o = origin();
        fail(&reg, "fragile", &o).await;
        fail(&reg, "sturdy", &o).await;
        assert_eq!(reg.state("fragile"), CircuitState::Open);
        assert_eq!(reg.state("sturdy"), CircuitState::Closed);

        let snaps = reg.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].agent_id, "fragile");
        assert_eq!(snaps[0].total_failures, 1);

        reg.reset("fragile");
        assert_eq!(reg.state("fragile"), CircuitState::Closed);
        assert!(reg.retry_after("fragile").is_none());
    }
}
