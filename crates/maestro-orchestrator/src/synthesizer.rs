use crate::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Weights closer than this are treated as equal when breaking ties.
const WEIGHT_EPSILON: f64 = 1e-9;

/// One completed result offered for synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Contributing task.
    pub task_id: TaskId,
    /// Agent that produced it.
    pub agent_id: AgentId,
    /// Produced value.
    pub value: serde_json::Value,
    /// Agent confidence.
    pub confidence: f64,
    /// Authority of the agent for this task.
    pub authority_weight: f64,
    /// Completion time, used to break ties.
    pub completed_at: DateTime<Utc>,
}

impl Contribution {
    /// Build from a completed task; `None` for any other status.
    pub fn from_task(task: &Task) -> Option<Self> {
        if task.status != TaskStatus::Completed {
            return None;
        }
        let result = task.result.as_ref()?;
        Some(Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            value: result.value.clone(),
            confidence: result.confidence,
            authority_weight: result.authority_weight,
            completed_at: result.completed_at,
        })
    }

    fn raw_weight(&self) -> f64 {
        let w = self.confidence * self.authority_weight;
        if w.is_finite() && w > 0.0 {
            w
        } else {
            0.0
        }
    }
}

/// How a contribution was counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Contributing task.
    pub task_id: TaskId,
    /// Agent that produced it.
    pub agent_id: AgentId,
    /// Normalized weight, summing to 1 across contributions.
    pub weight: f64,
    /// Agent confidence.
    pub confidence: f64,
    /// Authority of the agent for this task.
    pub authority_weight: f64,
    /// Whether this contribution's value equals the synthesized value.
    pub agrees: bool,
}

/// Overall outcome of a synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    /// Every expected contribution was merged.
    Completed,
    /// Some required contributors produced nothing.
    PartialSuccess,
    /// No contributor produced anything.
    Failed,
}

/// Reconciled answer plus how it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// Merged value, absent when nothing completed.
    pub value: Option<serde_json::Value>,
    /// Weighted confidence of the merged value.
    pub confidence: f64,
    /// Outcome of the merge.
    pub status: SynthesisStatus,
    /// True when contributors disagreed and one value had to win.
    pub conflict: bool,
    /// One entry per contribution.
    pub provenance: Vec<Provenance>,
    /// Required contributors that did not complete.
    pub missing: Vec<TaskId>,
}

/// Reconcile the results of the given tasks.
///
/// Completed tasks contribute; any other non-optional task is reported as
/// missing and downgrades the outcome to partial success.
pub fn synthesize_tasks<'a, I>(tasks: I) -> Synthesis
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut contributions = Vec::new();
    let mut missing = Vec::new();
    for task in tasks {
        match Contribution::from_task(task) {
            Some(c) => contributions.push(c),
            None if !task.optional => missing.push(task.id.clone()),
            None => {}
        }
    }
    synthesize(&contributions, missing)
}

/// Weighted-vote synthesis.
///
/// Each contribution weighs `confidence * authority_weight`, normalized over
/// all contributions (uniform when every weight is zero). Contributions with
/// equal values are grouped. Unanimous input keeps the weighted mean of
/// confidences. Otherwise the heaviest group wins with its normalized weight
/// as confidence; ties go to the highest single confidence, then to the
/// earliest completion.
pub fn synthesize(contributions: &[Contribution], missing: Vec<TaskId>) -> Synthesis {
    if contributions.is_empty() {
        return Synthesis {
            value: None,
            confidence: 0.0,
            status: SynthesisStatus::Failed,
            conflict: false,
            provenance: Vec::new(),
            missing,
        };
    }

    let raw: Vec<f64> = contributions.iter().map(Contribution::raw_weight).collect();
    let total: f64 = raw.iter().sum();
    let weights: Vec<f64> = if total > 0.0 {
        raw.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / contributions.len() as f64; contributions.len()]
    };

    // Groups of indices with equal values, in first-seen order.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, c) in contributions.iter().enumerate() {
        match groups
            .iter_mut()
            .find(|g| contributions[g[0]].value == c.value)
        {
            Some(g) => g.push(i),
            None => groups.push(vec![i]),
        }
    }

    let group_weight = |g: &[usize]| g.iter().map(|&i| weights[i]).sum::<f64>();
    let (winner, confidence, conflict) = if groups.len() == 1 {
        let mean = contributions
            .iter()
            .zip(&weights)
            .map(|(c, w)| c.confidence * w)
            .sum::<f64>();
        (0, mean, false)
    } else {
        let best = (0..groups.len())
            .max_by(|&a, &b| compare_groups(contributions, &groups[a], &groups[b], &group_weight))
            .unwrap_or(0);
        (best, group_weight(&groups[best]), true)
    };

    let value = contributions[groups[winner][0]].value.clone();
    let provenance = contributions
        .iter()
        .zip(&weights)
        .map(|(c, &weight)| Provenance {
            task_id: c.task_id.clone(),
            agent_id: c.agent_id.clone(),
            weight,
            confidence: c.confidence,
            authority_weight: c.authority_weight,
            agrees: c.value == value,
        })
        .collect();

    Synthesis {
        value: Some(value),
        confidence: confidence.clamp(0.0, 1.0),
        status: if missing.is_empty() {
            SynthesisStatus::Completed
        } else {
            SynthesisStatus::PartialSuccess
        },
        conflict,
        provenance,
        missing,
    }
}

/// Orders groups so that the preferred one compares greatest.
fn compare_groups(
    contributions: &[Contribution],
    a: &[usize],
    b: &[usize],
    weight: &dyn Fn(&[usize]) -> f64,
) -> Ordering {
    let (wa, wb) = (weight(a), weight(b));
    if (wa - wb).abs() > WEIGHT_EPSILON {
        return wa.total_cmp(&wb);
    }
    let max_conf = |g: &[usize]| {
        g.iter()
            .map(|&i| contributions[i].confidence)
            .fold(f64::MIN, f64::max)
    };
    let (ca, cb) = (max_conf(a), max_conf(b));
    if (ca - cb).abs() > WEIGHT_EPSILON {
        return ca.total_cmp(&cb);
    }
    let earliest = |g: &[usize]| g.iter().map(|&i| contributions[i].completed_at).min();
    // Earlier completion wins, so it must compare greater.
    earliest(b).cmp(&earliest(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn c(task: &str, value: serde_json::Value, confidence: f64, authority: f64) -> Contribution {
        Contribution {
            task_id: task.into(),
            agent_id: format!("agent-{task}"),
            value,
            confidence,
            authority_weight: authority,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_weighted_conflict_resolution() {
        let out = synthesize(
            &[c("a", json!("A"), 0.9, 1.0), c("b", json!("B"), 0.5, 0.5)],
            Vec::new(),
        );
        assert_eq!(out.value, Some(json!("A")));
        assert!((out.confidence - 0.9 / 1.15).abs() < 1e-3);
        assert!((out.confidence - 0.783).abs() < 1e-3);
        assert!(out.conflict);
        assert_eq!(out.status, SynthesisStatus::Completed);
        assert!(out.provenance[0].agrees);
        assert!(!out.provenance[1].agrees);
        let sum: f64 = out.provenance.iter().map(|p| p.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_agreement_keeps_weighted_mean_confidence() {
        let out = synthesize(
            &[c("a", json!({"x": 1}), 0.8, 1.0), c("b", json!({"x": 1}), 0.4, 1.0)],
            Vec::new(),
        );
        assert!(!out.conflict);
        // Weights 2/3 and 1/3.
        assert!((out.confidence - (0.8 * 2.0 / 3.0 + 0.4 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_grouped_minority_can_outvote() {
        let out = synthesize(
            &[
                c("a", json!("X"), 0.6, 1.0),
                c("b", json!("Y"), 0.5, 1.0),
                c("c", json!("Y"), 0.5, 1.0),
            ],
            Vec::new(),
        );
        assert_eq!(out.value, Some(json!("Y")));
        assert!((out.confidence - 1.0 / 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_tie_breaks_on_confidence_then_time() {
        // Equal weight 0.5 each: higher raw confidence wins.
        let out = synthesize(
            &[c("a", json!("low"), 0.5, 1.0), c("b", json!("high"), 1.0, 0.5)],
            Vec::new(),
        );
        assert_eq!(out.value, Some(json!("high")));

        let mut early = c("early", json!("E"), 0.5, 1.0);
        let late = c("late", json!("L"), 0.5, 1.0);
        early.completed_at = late.completed_at - Duration::seconds(5);
        let out = synthesize(&[late, early], Vec::new());
        assert_eq!(out.value, Some(json!("E")));
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let out = synthesize(
            &[c("a", json!(1), 0.0, 1.0), c("b", json!(2), 0.7, 0.0)],
            Vec::new(),
        );
        assert!(out.provenance.iter().all(|p| (p.weight - 0.5).abs() < 1e-9));
        // Tie on weight; "b" has the higher raw confidence.
        assert_eq!(out.value, Some(json!(2)));
    }

    #[test]
    fn test_empty_is_failed() {
        let out = synthesize(&[], vec!["a".into()]);
        assert_eq!(out.status, SynthesisStatus::Failed);
        assert!(out.value.is_none());
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn test_missing_contributor_is_partial() {
        let out = synthesize(&[c("a", json!(1), 0.9, 1.0)], vec!["b".into()]);
        assert_eq!(out.status, SynthesisStatus::PartialSuccess);
        assert_eq!(out.missing, vec!["b".to_string()]);
        assert!((out.confidence - 0.9).abs() < 1e-9);
    }
}
