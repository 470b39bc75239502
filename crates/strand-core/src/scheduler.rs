//! DAG scheduler: stable topological order plus ready-set scheduling.
//!
//! Built on `petgraph`: the step list becomes a `DiGraph`, `toposort`
//! rejects cycles up front, and the resulting stable order drives
//! [`DagScheduler::runnable`], which emits the prefix of pending steps whose
//! dependencies have completed, bounded by the caller's global cap.
//!
//! Failure is terminal within the scheduler: a failed step leaves `running`
//! but never returns to `pending`. Recovery wrappers re-drive a failing step
//! *inside* one scheduler slot by creating fresh execution records, so the
//! scheduler only ever sees the final verdict.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use strand_types::error::EngineError;
use strand_types::workflow::Step;

/// Validate that steps form a DAG with known dependencies.
pub fn validate_dag(steps: &[Step]) -> Result<(), EngineError> {
    build_topo_order(steps).map(|_| ())
}

/// Compute a stable topological order of step ids.
///
/// Stability: `petgraph::algo::toposort` visits nodes in insertion order, so
/// independent steps keep their declaration order.
fn build_topo_order(steps: &[Step]) -> Result<Vec<String>, EngineError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    if id_to_idx.len() != steps.len() {
        let mut seen = HashSet::new();
        let dup = steps
            .iter()
            .find(|s| !seen.insert(s.id.as_str()))
            .map(|s| s.id.clone())
            .unwrap_or_default();
        return Err(EngineError::Config(format!(
            "duplicate step id '{dup}'"
        )));
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.needs {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                EngineError::Config(format!(
                    "step '{}' needs unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        EngineError::Config(format!("cycle detected involving step '{node_id}'"))
    })?;

    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

// ---------------------------------------------------------------------------
// DagScheduler
// ---------------------------------------------------------------------------

/// Tracks which steps are pending, running, and completed, and emits the
/// runnable set under a global concurrency cap.
pub struct DagScheduler {
    /// Stable topological order over all step ids.
    order: Vec<String>,
    /// needs[] per step id.
    needs: HashMap<String, Vec<String>>,
    pending: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
}

impl DagScheduler {
    /// Build a scheduler for `steps`, seeding `completed` from hydration.
    /// Completed ids that are not in the workflow are ignored (a resumed run
    /// may carry records for steps a newer definition dropped).
    pub fn new(steps: &[Step], completed: &HashSet<String>) -> Result<Self, EngineError> {
        let order = build_topo_order(steps)?;
        let needs: HashMap<String, Vec<String>> = steps
            .iter()
            .map(|s| (s.id.clone(), s.needs.clone()))
            .collect();

        let completed: HashSet<String> = order
            .iter()
            .filter(|id| completed.contains(*id))
            .cloned()
            .collect();
        let pending: HashSet<String> = order
            .iter()
            .filter(|id| !completed.contains(*id))
            .cloned()
            .collect();

        Ok(Self {
            order,
            needs,
            pending,
            running: HashSet::new(),
            completed,
            failed: HashSet::new(),
        })
    }

    /// The stable topological order over every step id.
    pub fn topo_order(&self) -> &[String] {
        &self.order
    }

    /// Pending steps whose every dependency has completed, in topological
    /// order, limited so that `returned + current_running <= global_cap`.
    pub fn runnable(&self, current_running: usize, global_cap: Option<usize>) -> Vec<String> {
        let budget = match global_cap {
            Some(cap) => cap.saturating_sub(current_running),
            None => usize::MAX,
        };
        if budget == 0 {
            return Vec::new();
        }

        self.order
            .iter()
            .filter(|id| self.pending.contains(*id))
            .filter(|id| {
                self.needs
                    .get(*id)
                    .map(|needs| needs.iter().all(|n| self.completed.contains(n)))
                    .unwrap_or(true)
            })
            .take(budget)
            .cloned()
            .collect()
    }

    /// Move a step from pending to running.
    pub fn start(&mut self, id: &str) {
        if self.pending.remove(id) {
            self.running.insert(id.to_string());
        }
    }

    /// Move a step from running to completed, unblocking dependents.
    pub fn mark_complete(&mut self, id: &str) {
        self.running.remove(id);
        self.pending.remove(id);
        self.completed.insert(id.to_string());
    }

    /// Record terminal failure: the step leaves running and never returns to
    /// pending.
    pub fn mark_failed(&mut self, id: &str) {
        self.running.remove(id);
        self.pending.remove(id);
        self.failed.insert(id.to_string());
    }

    /// Steps that can never run because a transitive dependency failed.
    /// They drain from pending so `is_complete` converges.
    pub fn drain_unreachable(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        loop {
            let stuck: Vec<String> = self
                .pending
                .iter()
                .filter(|id| {
                    self.needs
                        .get(*id)
                        .map(|needs| {
                            needs.iter().any(|n| {
                                self.failed.contains(n)
                            })
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if stuck.is_empty() {
                break;
            }
            for id in stuck {
                self.pending.remove(&id);
                self.failed.insert(id.clone());
                drained.push(id);
            }
        }
        drained
    }

    /// True once nothing is pending or running.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    pub fn completed(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn failed(&self) -> &HashSet<String> {
        &self.failed
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
