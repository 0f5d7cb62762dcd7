//! Dependency-graph validation.
//!
//! Uses Kahn's algorithm so that arbitrarily deep graphs never recurse, and so
//! that the reported cycle is the same on every run for the same submission.

use crate::types::WorkflowSpec;
use maestro_core::{TaskId, ValidationError};
use std::collections::{HashMap, HashSet, VecDeque};

/// A validated dependency graph, indexed by declaration order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    ids: Vec<TaskId>,
    /// Deduplicated dependencies per task, as indices.
    dependencies: Vec<Vec<usize>>,
    /// Reverse edges: tasks that depend on each task.
    dependents: Vec<Vec<usize>>,
    /// Kahn order; dependencies always precede dependents.
    order: Vec<usize>,
}

impl TaskGraph {
    /// Validate a submission and build its graph.
    ///
    /// Fails on an empty workflow, duplicate ids, unknown dependencies, invalid
    /// budget or weights, and on any cycle (including self-dependencies).
    pub fn build(spec: &WorkflowSpec) -> Result<Self, ValidationError> {
        if spec.tasks.is_empty() {
            return Err(ValidationError::Empty);
        }
        if spec.budget.max_calls == Some(0) {
            return Err(ValidationError::InvalidParameter(
                "budget.max_calls must be greater than zero".into(),
            ));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(spec.tasks.len());
        for (i, task) in spec.tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(ValidationError::DuplicateTask(task.id.clone()));
            }
            if let Some(w) = task.authority_weight {
                if !w.is_finite() || w < 0.0 {
                    return Err(ValidationError::InvalidParameter(format!(
                        "task '{}' has invalid authority weight {w}",
                        task.id
                    )));
                }
            }
        }

        let n = spec.tasks.len();
        let mut dependencies = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        for (i, task) in spec.tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                let &d = index
                    .get(dep.as_str())
                    .ok_or_else(|| ValidationError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })?;
                if seen.insert(d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        let ids: Vec<TaskId> = spec.tasks.iter().map(|t| t.id.clone()).collect();

        if order.len() < n {
            let cycle = find_cycle(&ids, &dependencies, &in_degree);
            return Err(ValidationError::Cycle { cycle });
        }

        Ok(Self {
            ids,
            dependencies,
            dependents,
            order,
        })
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Always false for a validated graph.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Task ids in declaration order.
    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    /// Deduplicated dependency indices of task `i`.
    pub fn dependencies_of(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    /// Indices of the tasks that depend directly on task `i`.
    pub fn dependents_of(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Task ids in a valid execution order.
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.order.iter().map(|&i| self.ids[i].clone()).collect()
    }

    /// Tasks nothing depends on; their results feed synthesis.
    pub fn sinks(&self) -> Vec<usize> {
        (0..self.ids.len())
            .filter(|&i| self.dependents[i].is_empty())
            .collect()
    }

    /// Every task reachable through dependent edges from `start`, excluding `start`,
    /// in breadth-first order.
    pub fn transitive_dependents(&self, start: usize) -> Vec<usize> {
        let mut seen = vec![false; self.ids.len()];
        seen[start] = true;
        let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
        let mut out = Vec::new();
        while let Some(i) = queue.pop_front() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(i);
            queue.extend(self.dependents[i].iter().copied());
        }
        out
    }
}

/// Walk dependency edges among the tasks Kahn could not order until a node repeats.
///
/// Every leftover task has at least one leftover dependency, so the walk always
/// closes a loop. The first leftover task in declaration order is the start and
/// its first leftover dependency is always taken, which keeps the result stable.
fn find_cycle(ids: &[TaskId], dependencies: &[Vec<usize>], in_degree: &[usize]) -> Vec<TaskId> {
    let leftover = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..ids.len()).find(|&i| leftover(i)) else {
        return Vec::new();
    };

    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut path = Vec::new();
    let mut current = start;
    loop {
        if let Some(&at) = position.get(&current) {
            let mut cycle: Vec<TaskId> = path[at..].iter().map(|&i: &usize| ids[i].clone()).collect();
            cycle.push(ids[current].clone());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);
        match dependencies[current].iter().copied().find(|&d| leftover(d)) {
            Some(next) => current = next,
            None => return path.iter().map(|&i| ids[i].clone()).collect(),
        }
    }
}
