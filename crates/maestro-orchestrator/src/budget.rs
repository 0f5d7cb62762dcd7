use crate::types::Budget;
use maestro_core::BudgetResource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Remaining budget as seen by an executor.
///
/// `None` in a `*_remaining` field means that resource is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetView {
    /// Calls reserved so far, including the caller's own.
    pub calls_used: u64,
    /// Calls still admissible.
    pub calls_remaining: Option<u64>,
    /// Tokens charged so far.
    pub tokens_used: u64,
    /// Tokens left before further dispatch stops.
    pub tokens_remaining: Option<u64>,
    /// Time left on the workflow's time bound.
    #[serde(default)]
    pub time_remaining_ms: Option<u64>,
}

/// Lock-free accounting of a workflow's quota.
///
/// Calls are reserved before dispatch so concurrent workers can never overshoot
/// `max_calls`. Tokens are only known after a call returns and are charged then.
/// Time counts from submission, plus whatever earlier runs of the same
/// workflow consumed before a restart.
#[derive(Debug)]
pub struct BudgetTracker {
    budget: Budget,
    calls: AtomicU64,
    tokens: AtomicU64,
    started: Instant,
    carried: Duration,
}

impl BudgetTracker {
    /// Fresh accounting for a newly submitted workflow.
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            calls: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            started: Instant::now(),
            carried: Duration::ZERO,
        }
    }

    /// Resume accounting with usage carried over from a checkpoint.
    pub fn with_usage(budget: Budget, calls: u64, tokens: u64, elapsed: Duration) -> Self {
        let mut tracker = Self::new(budget);
        tracker.calls = AtomicU64::new(calls);
        tracker.tokens = AtomicU64::new(tokens);
        tracker.carried = elapsed;
        tracker
    }

    /// Limits being enforced.
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Reserve one executor call, or report which limit stands in the way.
    pub fn reserve_call(&self) -> Result<(), BudgetResource> {
        if let Some(resource) = self.exhausted() {
            return Err(resource);
        }
        let max = self.budget.max_calls;
        self.calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| match max {
                Some(max) if used >= max => None,
                _ => Some(used + 1),
            })
            .map(|_| ())
            .map_err(|_| BudgetResource::Calls)
    }

    /// Record tokens reported by a finished call.
    ///
    /// The work has already happened, so the tokens are always counted; an
    /// error only signals that the limit is now reached.
    pub fn charge_tokens(&self, tokens: u64) -> Result<(), BudgetResource> {
        let total = self.tokens.fetch_add(tokens, Ordering::AcqRel) + tokens;
        match self.budget.max_tokens {
            Some(max) if total >= max => Err(BudgetResource::Tokens),
            _ => Ok(()),
        }
    }

    /// The first limit that no longer admits a call, if any.
    ///
    /// `max_calls` is only reported once every reserved call is used up.
    pub fn exhausted(&self) -> Option<BudgetResource> {
        if self.budget.time_bound().is_some_and(|bound| self.elapsed() >= bound) {
            return Some(BudgetResource::Time);
        }
        if self
            .budget
            .max_tokens
            .is_some_and(|max| self.tokens.load(Ordering::Acquire) >= max)
        {
            return Some(BudgetResource::Tokens);
        }
        if self
            .budget
            .max_calls
            .is_some_and(|max| self.calls.load(Ordering::Acquire) >= max)
        {
            return Some(BudgetResource::Calls);
        }
        None
    }

    /// Calls reserved so far.
    pub fn calls_used(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    /// Tokens charged so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Time consumed by this workflow across restarts.
    pub fn elapsed(&self) -> Duration {
        self.carried + self.started.elapsed()
    }

    /// Snapshot handed to executors.
    pub fn view(&self) -> BudgetView {
        let calls_used = self.calls_used();
        let tokens_used = self.tokens_used();
        BudgetView {
            calls_used,
            calls_remaining: self.budget.max_calls.map(|m| m.saturating_sub(calls_used)),
            tokens_used,
            tokens_remaining: self.budget.max_tokens.map(|m| m.saturating_sub(tokens_used)),
            time_remaining_ms: self
                .budget
                .time_bound()
                .map(|b| b.saturating_sub(self.elapsed()).as_millis() as u64),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unlimited_budget_always_admits() {
        let tracker = BudgetTracker::new(Budget::unlimited());
        for _ in 0..1000 {
            tracker.reserve_call().unwrap();
        }
        assert_eq!(tracker.calls_used(), 1000);
        assert!(tracker.exhausted().is_none());
    }

    #[test]
    fn test_call_limit_never_overshoots_under_contention() {
        let tracker = Arc::new(BudgetTracker::new(Budget::default().with_max_calls(50)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = tracker.clone();
                std::thread::spawn(move || (0..20).filter(|_| t.reserve_call().is_ok()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(tracker.calls_used(), 50);
        assert_eq!(tracker.reserve_call(), Err(BudgetResource::Calls));
    }

    #[test]
    fn test_tokens_block_further_calls() {
        let tracker = BudgetTracker::new(Budget::default().with_max_tokens(100));
        tracker.reserve_call().unwrap();
        assert!(tracker.charge_tokens(60).is_ok());
        assert_eq!(tracker.charge_tokens(60), Err(BudgetResource::Tokens));
        assert_eq!(tracker.tokens_used(), 120);
        assert_eq!(tracker.reserve_call(), Err(BudgetResource::Tokens));
    }

    #[test]
    fn test_time_bound() {
        let tracker = BudgetTracker::new(Budget::default().with_time_bound(Duration::ZERO));
        assert_eq!(tracker.reserve_call(), Err(BudgetResource::Time));
    }

    #[test]
    fn test_view_and_resume() {
        let tracker = BudgetTracker::with_usage(
            Budget::default().with_max_calls(10).with_max_tokens(1000),
            4,
            250,
            Duration::ZERO,
        );
        let view = tracker.view();
        assert_eq!(view.calls_used, 4);
        assert_eq!(view.calls_remaining, Some(6));
        assert_eq!(view.tokens_remaining, Some(750));
        assert_eq!(view.time_remaining_ms, None);
    }

    #[test]
    fn test_resumed_time_counts_earlier_runs() {
        let budget = Budget::default().with_time_bound(Duration::from_millis(200));
        let tracker = BudgetTracker::with_usage(budget.clone(), 2, 0, Duration::from_millis(150));
        assert!(tracker.elapsed() >= Duration::from_millis(150));
        assert!(tracker.view().time_remaining_ms.unwrap() <= 50);
        assert!(tracker.reserve_call().is_ok());

        let spent = BudgetTracker::with_usage(budget, 2, 0, Duration::from_millis(300));
        assert_eq!(spent.reserve_call(), Err(BudgetResource::Time));
        assert_eq!(spent.view().time_remaining_ms, Some(0));
    }
}
