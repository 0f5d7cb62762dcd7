use crate::config::EventsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroResult, TaskId, WorkflowId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Kind of a state-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task was registered.
    TaskCreated,
    /// All dependencies of a task are satisfied.
    TaskReady,
    /// A task was dispatched to its agent.
    TaskStarted,
    /// A task produced a result.
    TaskCompleted,
    /// A task failed for good.
    TaskFailed,
    /// A task will not run.
    TaskSkipped,
    /// A failed attempt will be retried.
    TaskRetried,
    /// An agent's breaker opened.
    CircuitOpened,
    /// An agent's breaker closed again.
    CircuitClosed,
    /// Every task completed.
    WorkflowCompleted,
    /// The workflow failed.
    WorkflowFailed,
    /// The workflow was cancelled.
    WorkflowCancelled,
    /// A budget bound stopped the workflow.
    WorkflowBudgetExceeded,
    /// Dispatch of new tasks was paused.
    WorkflowPaused,
    /// Dispatch of new tasks was unpaused.
    WorkflowResumed,
    /// A subscriber kept failing on an event; never re-reported.
    SubscriberFailed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskReady => "task_ready",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskSkipped => "task_skipped",
            EventKind::TaskRetried => "task_retried",
            EventKind::CircuitOpened => "circuit_opened",
            EventKind::CircuitClosed => "circuit_closed",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::WorkflowCancelled => "workflow_cancelled",
            EventKind::WorkflowBudgetExceeded => "workflow_budget_exceeded",
            EventKind::WorkflowPaused => "workflow_paused",
            EventKind::WorkflowResumed => "workflow_resumed",
            EventKind::SubscriberFailed => "subscriber_failed",
        };
        f.write_str(s)
    }
}

/// One entry of a workflow's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing within a workflow, starting at 1.
    pub sequence: u64,
    /// Workflow the event belongs to.
    pub workflow_id: WorkflowId,
    /// Task the event concerns, absent for workflow events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Kind-specific details.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

/// Receives events asynchronously. Delivery is at-least-once, so handlers
/// must tolerate seeing the same sequence number twice.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str {
        "subscriber"
    }

    async fn handle(&self, event: &Event) -> MaestroResult<()>;
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Only events of this workflow, when set.
    pub workflow_id: Option<WorkflowId>,
    /// Only these kinds, when set.
    pub kinds: Option<Vec<EventKind>>,
}

impl SubscriptionFilter {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches events of one workflow.
    pub fn workflow(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            kinds: None,
        }
    }

    /// Restricts the filter to `kinds`.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.workflow_id.map_or(true, |id| id == event.workflow_id)
            && self
                .kinds
                .as_ref()
                .map_or(true, |kinds| kinds.contains(&event.kind))
    }
}

/// Handle returned by the subscribe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Counters reported by [`EventBus::statistics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStatistics {
    /// Events published.
    pub total_events: u64,
    /// Events published per kind.
    pub by_kind: HashMap<EventKind, u64>,
    /// Workflows with a retained log.
    pub workflows: usize,
    /// Active subscriptions.
    pub subscribers: usize,
    /// Deliveries that exhausted their attempts.
    pub delivery_failures: u64,
}

#[derive(Debug, Default)]
struct WorkflowLog {
    /// Sequence number preceding the first retained event.
    base: u64,
    events: Vec<Arc<Event>>,
}

impl WorkflowLog {
    fn last_sequence(&self) -> u64 {
        self.base + self.events.len() as u64
    }
}

struct Subscription {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

struct BusInner {
    config: EventsConfig,
    logs: RwLock<HashMap<WorkflowId, Arc<Mutex<WorkflowLog>>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    counts: Mutex<HashMap<EventKind, u64>>,
    delivery_failures: AtomicU64,
}

impl BusInner {
    fn log(&self, workflow_id: WorkflowId) -> Arc<Mutex<WorkflowLog>> {
        if let Some(log) = self.logs.read().get(&workflow_id) {
            return log.clone();
        }
        self.logs.write().entry(workflow_id).or_default().clone()
    }

    fn publish(
        &self,
        workflow_id: WorkflowId,
        task_id: Option<&str>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> u64 {
        let log = self.log(workflow_id);
        let mut log = log.lock();
        let sequence = log.last_sequence() + 1;
        let event = Arc::new(Event {
            sequence,
            workflow_id,
            task_id: task_id.map(str::to_string),
            kind,
            payload,
            timestamp: Utc::now(),
        });
        log.events.push(event.clone());
        *self.counts.lock().entry(kind).or_default() += 1;

        // Fan out under the log lock so every subscriber sees a workflow's
        // events in sequence order.
        for sub in self.subscriptions.read().iter() {
            if sub.filter.matches(&event) && sub.tx.send(event.clone()).is_err() {
                debug!(subscription = sub.id.0, "Subscriber channel closed");
            }
        }
        debug!(workflow_id = %workflow_id, sequence, kind = %kind, "Event published");
        sequence
    }
}

/// Per-workflow, sequenced, append-only event log with asynchronous fan-out.
///
/// `publish` appends and returns immediately; each subscriber is fed by its
/// own channel and background task, so a slow or failing subscriber never
/// blocks the publisher or the other subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventsConfig::default())
    }
}

impl EventBus {
    /// Creates a bus with the given delivery settings.
    pub fn new(config: EventsConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                logs: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                counts: Mutex::new(HashMap::new()),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Append an event and return its sequence number.
    pub fn publish(
        &self,
        workflow_id: WorkflowId,
        task_id: Option<&str>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> u64 {
        self.inner.publish(workflow_id, task_id, kind, payload)
    }

    /// Highest sequence number assigned in this workflow, 0 if none.
    pub fn last_sequence(&self, workflow_id: WorkflowId) -> u64 {
        self.inner
            .logs
            .read()
            .get(&workflow_id)
            .map_or(0, |log| log.lock().last_sequence())
    }

    /// Continue numbering after `sequence` for a workflow whose log was lost.
    ///
    /// Has no effect once the workflow already has events at or past it.
    pub fn resume_sequence(&self, workflow_id: WorkflowId, sequence: u64) {
        let log = self.inner.log(workflow_id);
        let mut log = log.lock();
        if log.events.is_empty() && log.base < sequence {
            log.base = sequence;
        }
    }

    /// Lazily iterate events with `sequence >= from`, up to the last event
    /// present when this call was made.
    pub fn replay(&self, workflow_id: WorkflowId, from: u64) -> Replay {
        let log = self.inner.logs.read().get(&workflow_id).cloned();
        let tail = log.as_ref().map_or(0, |l| l.lock().last_sequence());
        let from = from.max(1);
        Replay {
            log,
            from,
            next: from,
            tail,
        }
    }

    /// Every retained event of a workflow.
    pub fn events(&self, workflow_id: WorkflowId) -> Vec<Event> {
        self.replay(workflow_id, 1).collect()
    }

    /// Register a handler. Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_subscription(filter, tx);
        tokio::spawn(deliver(
            Arc::downgrade(&self.inner),
            subscriber,
            rx,
            self.inner.config.delivery_attempts.max(1),
            Duration::from_millis(self.inner.config.redelivery_delay_ms),
        ));
        id
    }

    /// Subscribe through a plain channel instead of a handler.
    pub fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.add_subscription(filter, tx), rx)
    }

    fn add_subscription(
        &self,
        filter: SubscriptionFilter,
        tx: mpsc::UnboundedSender<Arc<Event>>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .write()
            .push(Subscription { id, filter, tx });
        id
    }

    /// Stop delivering to a subscription. Events already queued are still handled.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Drop a workflow's log.
    pub fn remove_workflow(&self, workflow_id: WorkflowId) -> bool {
        self.inner.logs.write().remove(&workflow_id).is_some()
    }

    /// Bus-wide counters.
    pub fn statistics(&self) -> EventStatistics {
        let by_kind = self.inner.counts.lock().clone();
        EventStatistics {
            total_events: by_kind.values().sum(),
            by_kind,
            workflows: self.inner.logs.read().len(),
            subscribers: self.inner.subscriptions.read().len(),
            delivery_failures: self.inner.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Background loop feeding one subscriber.
async fn deliver(
    bus: Weak<BusInner>,
    subscriber: Arc<dyn EventSubscriber>,
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    attempts: u32,
    delay: Duration,
) {
    while let Some(event) = rx.recv().await {
        let mut last_error = None;
        for attempt in 1..=attempts {
            match subscriber.handle(&event).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    debug!(
                        subscriber = subscriber.name(),
                        sequence = event.sequence,
                        attempt,
                        error = %e,
                        "Event delivery failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay * attempt).await;
                    }
                }
            }
        }

        let Some(error) = last_error else { continue };
        let Some(bus) = bus.upgrade() else { return };
        bus.delivery_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscriber = subscriber.name(),
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            kind = %event.kind,
            error = %error,
            "Subscriber gave up on event"
        );
        if event.kind != EventKind::SubscriberFailed {
            bus.publish(
                event.workflow_id,
                event.task_id.as_deref(),
                EventKind::SubscriberFailed,
                serde_json::json!({
                    "subscriber": subscriber.name(),
                    "failed_sequence": event.sequence,
                    "failed_type": event.kind,
                    "error": error.to_string(),
                }),
            );
        }
    }
}

/// Restartable cursor over a workflow's log.
///
/// Reads one event at a time under the log lock, so events published after
/// the cursor was created are never yielded and publishers are never held up
/// for the whole replay.
#[derive(Clone)]
pub struct Replay {
    log: Option<Arc<Mutex<WorkflowLog>>>,
    from: u64,
    next: u64,
    tail: u64,
}

impl Replay {
    /// Rewind to the first sequence this cursor was created with.
    pub fn restart(&mut self) {
        self.next = self.from;
    }

    /// Last sequence this cursor will yield.
    pub fn tail(&self) -> u64 {
        self.tail
    }
}

impl Iterator for Replay {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let log = self.log.as_ref()?;
        if self.next > self.tail {
            return None;
        }
        let log = log.lock();
        if self.next <= log.base {
            self.next = log.base + 1;
            if self.next > self.tail {
                return None;
            }
        }
        let index = (self.next - log.base - 1) as usize;
        let event = log.events.get(index)?;
        self.next += 1;
        Some(Event::clone(event))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::MaestroError;
    use std::sync::atomic::AtomicUsize;

    fn publish_n(bus: &EventBus, wf: WorkflowId, n: usize) {
        for i in 0..n {
            bus.publish(wf, Some(format!("t{i}").as_str()), EventKind::TaskCreated, serde_json::Value::Null);
        }
    }

    #[test]
    fn test_sequence_starts_at_one_per_workflow() {
        let bus = EventBus::default();
        let a = WorkflowId::new();
        let b = WorkflowId::new();
        assert_eq!(bus.publish(a, None, EventKind::WorkflowCompleted, serde_json::Value::Null), 1);
        assert_eq!(bus.publish(a, None, EventKind::WorkflowCompleted, serde_json::Value::Null), 2);
        assert_eq!(bus.publish(b, None, EventKind::WorkflowCompleted, serde_json::Value::Null), 1);
        assert_eq!(bus.last_sequence(a), 2);
        assert_eq!(bus.last_sequence(WorkflowId::new()), 0);
    }

    #[test]
    fn test_concurrent_publishers_get_unique_sequences() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || publish_n(&bus, wf, 250))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seqs: Vec<u64> = bus.events(wf).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_replay_from_middle_and_restart() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        publish_n(&bus, wf, 8);

        let mut replay = bus.replay(wf, 6);
        let first: Vec<u64> = replay.by_ref().map(|e| e.sequence).collect();
        assert_eq!(first, vec![6, 7, 8]);

        replay.restart();
        assert_eq!(replay.count(), 3);
    }

    #[test]
    fn test_replay_stops_at_tail_captured_at_creation() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        publish_n(&bus, wf, 3);
        let replay = bus.replay(wf, 1);
        publish_n(&bus, wf, 3);
        assert_eq!(replay.tail(), 3);
        assert_eq!(replay.count(), 3);
    }

    #[test]
    fn test_replay_of_unknown_workflow_is_empty() {
        let bus = EventBus::default();
        assert_eq!(bus.replay(WorkflowId::new(), 1).count(), 0);
    }

    #[test]
    fn test_resume_sequence_after_lost_log() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        bus.resume_sequence(wf, 5);
        assert_eq!(bus.last_sequence(wf), 5);
        assert_eq!(bus.publish(wf, None, EventKind::TaskReady, serde_json::Value::Null), 6);
        assert_eq!(bus.replay(wf, 1).map(|e| e.sequence).collect::<Vec<_>>(), vec![6]);
        bus.resume_sequence(wf, 100);
        assert_eq!(bus.last_sequence(wf), 6);
    }

    #[test]
    fn test_remove_workflow_and_statistics() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        publish_n(&bus, wf, 2);
        bus.publish(wf, None, EventKind::WorkflowCompleted, serde_json::Value::Null);
        let stats = bus.statistics();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.by_kind.get(&EventKind::TaskCreated), Some(&2));
        assert_eq!(stats.workflows, 1);

        assert!(bus.remove_workflow(wf));
        assert_eq!(bus.last_sequence(wf), 0);
        assert_eq!(bus.statistics().workflows, 0);
    }

    #[test]
    fn test_event_serializes_kind_as_type() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        bus.publish(wf, Some("a"), EventKind::TaskCompleted, serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&bus.events(wf)[0]).unwrap();
        assert_eq!(json["type"], "task_completed");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["task_id"], "a");
    }

    #[tokio::test]
    async fn test_channel_subscription_filters_by_workflow() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        let (_, mut rx) = bus.subscribe_channel(SubscriptionFilter::workflow(wf));
        bus.publish(WorkflowId::new(), None, EventKind::TaskReady, serde_json::Value::Null);
        bus.publish(wf, Some("a"), EventKind::TaskReady, serde_json::Value::Null);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.workflow_id, wf);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let wf = WorkflowId::new();
        let (id, mut rx) = bus.subscribe_channel(SubscriptionFilter::all());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(wf, None, EventKind::TaskReady, serde_json::Value::Null);
        assert!(rx.recv().await.is_none());
    }

    struct Flaky {
        failures_left: AtomicUsize,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl EventSubscriber for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, event: &Event) -> MaestroResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(MaestroError::Config("not yet".into()));
            }
            self.seen.lock().push(event.sequence);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventSubscriber for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }

        async fn handle(&self, _event: &Event) -> MaestroResult<()> {
            Err(MaestroError::Config("down".into()))
        }
    }

    fn fast_bus() -> EventBus {
        EventBus::new(EventsConfig {
            delivery_attempts: 3,
            redelivery_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_subscriber_is_retried_until_success() {
        let bus = fast_bus();
        let wf = WorkflowId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            SubscriptionFilter::all(),
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(2),
                seen: seen.clone(),
            }),
        );
        bus.publish(wf, None, EventKind::TaskReady, serde_json::Value::Null);

        for _ in 0..100 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(bus.statistics().delivery_failures, 0);
    }

    #[tokio::test]
    async fn test_failing_subscriber_emits_subscriber_failed_once() {
        let bus = fast_bus();
        let wf = WorkflowId::new();
        bus.subscribe(SubscriptionFilter::all(), Arc::new(AlwaysFails));
        bus.publish(wf, Some("a"), EventKind::TaskReady, serde_json::Value::Null);

        for _ in 0..200 {
            if bus.statistics().delivery_failures >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The synthetic event is delivered to the same subscriber and fails too,
        // but is not reported again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failed: Vec<Event> = bus
            .events(wf)
            .into_iter()
            .filter(|e| e.kind == EventKind::SubscriberFailed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload["failed_sequence"], 1);
        assert_eq!(failed[0].payload["subscriber"], "broken");
        assert_eq!(bus.statistics().delivery_failures, 2);
    }
}
