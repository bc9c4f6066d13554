//! Dependency Graph
//!
//! DAG of tasks keyed by id. Edges run prerequisite -> dependent and are
//! created at insertion; inserting an edge that would close a cycle is
//! rejected. The graph tracks each node's lifecycle state so readiness
//! (all prerequisites succeeded) and cancellation cascades can be computed
//! locally, without consulting task records.
//!
//! The scheduler is the only writer. Readers get value snapshots.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskmesh_types::{TaskId, TaskState};

/// Cause string recorded on dependents cancelled by an upstream failure.
pub const UPSTREAM_FAILURE: &str = "upstream failure";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task already exists: {0}")]
    Duplicate(TaskId),

    #[error("Unknown prerequisite: {0}")]
    UnknownPrereq(TaskId),

    #[error("Edge would create a cycle")]
    CycleDetected,

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task {0} is not in a terminal state")]
    NotTerminal(TaskId),

    #[error("Task {id} is terminal ({state}); transition rejected")]
    Terminal { id: TaskId, state: TaskState },
}

/// One node: lifecycle state plus both edge directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    state: TaskState,
    prereqs: BTreeSet<TaskId>,
    dependents: BTreeSet<TaskId>,
    estimated_ms: u64,
    submitted_at: DateTime<Utc>,
}

/// The dependency graph. Need not be connected.
#[derive(Debug, Default, Clone)]
pub struct DepGraph {
    nodes: HashMap<TaskId, Node>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.nodes.get(id).map(|n| n.state)
    }

    /// Insert a new task. Every prerequisite must already exist; the new
    /// node starts `ready` when it has none or all are already succeeded.
    pub fn insert(
        &mut self,
        id: TaskId,
        prereqs: &[TaskId],
        estimated_ms: u64,
        submitted_at: DateTime<Utc>,
    ) -> Result<TaskState, GraphError> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::Duplicate(id));
        }
        for p in prereqs {
            if !self.nodes.contains_key(p) {
                return Err(GraphError::UnknownPrereq(p.clone()));
            }
        }

        let prereq_set: BTreeSet<TaskId> = prereqs.iter().cloned().collect();
        let state = if self.all_succeeded(&prereq_set) {
            TaskState::Ready
        } else {
            TaskState::Pending
        };

        for p in &prereq_set {
            self.nodes
                .get_mut(p)
                .expect("prereq checked above")
                .dependents
                .insert(id.clone());
        }
        self.nodes.insert(
            id,
            Node {
                state,
                prereqs: prereq_set,
                dependents: BTreeSet::new(),
                estimated_ms,
                submitted_at,
            },
        );
        Ok(state)
    }

    /// Add an edge between two existing tasks. Rejected when the dependent
    /// is already an ancestor of the prerequisite (the edge would close a
    /// cycle); the check walks ancestors from the edge's tail.
    pub fn add_edge(&mut self, prereq: &TaskId, dependent: &TaskId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(prereq) {
            return Err(GraphError::UnknownPrereq(prereq.clone()));
        }
        if !self.nodes.contains_key(dependent) {
            return Err(GraphError::UnknownTask(dependent.clone()));
        }
        if prereq == dependent || self.is_ancestor(dependent, prereq) {
            return Err(GraphError::CycleDetected);
        }

        let prereq_succeeded = self.nodes[prereq].state == TaskState::Succeeded;
        self.nodes
            .get_mut(prereq)
            .expect("checked")
            .dependents
            .insert(dependent.clone());
        let node = self.nodes.get_mut(dependent).expect("checked");
        node.prereqs.insert(prereq.clone());
        // A ready dependent regresses to pending if the new prereq is
        // still outstanding.
        if node.state == TaskState::Ready && !prereq_succeeded {
            node.state = TaskState::Pending;
        }
        Ok(())
    }

    /// Depth-first walk over ancestors of `from`, looking for `target`.
    fn is_ancestor(&self, target: &TaskId, from: &TaskId) -> bool {
        let mut stack: Vec<&TaskId> = vec![from];
        let mut seen: BTreeSet<&TaskId> = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.prereqs.iter());
            }
        }
        false
    }

    fn all_succeeded(&self, prereqs: &BTreeSet<TaskId>) -> bool {
        prereqs
            .iter()
            .all(|p| self.nodes.get(p).map(|n| n.state) == Some(TaskState::Succeeded))
    }

    /// Transition a node through a non-structural state change
    /// (ready -> assigned -> running, retry back to ready). Terminal nodes
    /// never leave their state.
    pub fn set_state(&mut self, id: &TaskId, state: TaskState) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        if node.state.is_terminal() {
            return Err(GraphError::Terminal {
                id: id.clone(),
                state: node.state,
            });
        }
        node.state = state;
        Ok(())
    }

    /// Mark a task succeeded and return the dependents that became ready
    /// (every prerequisite now succeeded).
    pub fn mark_succeeded(&mut self, id: &TaskId) -> Result<BTreeSet<TaskId>, GraphError> {
        {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
            if node.state.is_terminal() {
                return Err(GraphError::Terminal {
                    id: id.clone(),
                    state: node.state,
                });
            }
            node.state = TaskState::Succeeded;
        }

        let dependents: Vec<TaskId> = self.nodes[id].dependents.iter().cloned().collect();
        let mut newly_ready = BTreeSet::new();
        for d in dependents {
            let ready = {
                let node = &self.nodes[&d];
                node.state == TaskState::Pending && self.all_succeeded(&node.prereqs)
            };
            if ready {
                self.nodes.get_mut(&d).expect("dependent exists").state = TaskState::Ready;
                newly_ready.insert(d);
            }
        }
        Ok(newly_ready)
    }

    /// Mark a task permanently failed. Its transitive dependents are
    /// cancelled with cause "upstream failure"; the cancelled set is
    /// returned in breadth-first order.
    pub fn mark_failed_permanent(&mut self, id: &TaskId) -> Result<Vec<TaskId>, GraphError> {
        {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
            if node.state.is_terminal() {
                return Err(GraphError::Terminal {
                    id: id.clone(),
                    state: node.state,
                });
            }
            node.state = TaskState::Failed;
        }
        Ok(self.cascade_cancel(id))
    }

    /// Mark a task cancelled and cascade to its transitive dependents.
    /// Idempotent on already-cancelled tasks (returns an empty cascade).
    pub fn mark_cancelled(&mut self, id: &TaskId) -> Result<Vec<TaskId>, GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        match node.state {
            TaskState::Cancelled => return Ok(Vec::new()),
            s if s.is_terminal() => {
                return Err(GraphError::Terminal {
                    id: id.clone(),
                    state: s,
                })
            }
            _ => node.state = TaskState::Cancelled,
        }
        Ok(self.cascade_cancel(id))
    }

    /// Cancel every non-terminal transitive dependent of `id`. Returns the
    /// cancelled ids in the order they were reached.
    fn cascade_cancel(&mut self, id: &TaskId) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut queue: VecDeque<TaskId> = self.nodes[id].dependents.iter().cloned().collect();
        let mut seen: BTreeSet<TaskId> = queue.iter().cloned().collect();
        while let Some(d) = queue.pop_front() {
            let node = self.nodes.get_mut(&d).expect("edges only between nodes");
            if !node.state.is_terminal() {
                node.state = TaskState::Cancelled;
                cancelled.push(d.clone());
            }
            for next in self.nodes[&d].dependents.iter() {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        cancelled
    }

    /// Pending nodes whose every prerequisite has already succeeded.
    /// Recovery can leave such nodes behind when a crash landed between a
    /// prerequisite's completion and the dependent's ready transition.
    pub fn pending_satisfied(&self) -> BTreeSet<TaskId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.state == TaskState::Pending && self.all_succeeded(&n.prereqs))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// All nodes currently in `ready`.
    pub fn ready_set(&self) -> BTreeSet<TaskId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.state == TaskState::Ready)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Transitive dependents of `id` not yet succeeded, each counted once.
    /// Feeds the queue's dependent-count bonus.
    pub fn unresolved_dependent_count(&self, id: &TaskId) -> usize {
        let Some(node) = self.nodes.get(id) else {
            return 0;
        };
        let mut count = 0;
        let mut queue: VecDeque<&TaskId> = node.dependents.iter().collect();
        let mut seen: BTreeSet<&TaskId> = queue.iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            let n = &self.nodes[d];
            if n.state != TaskState::Succeeded {
                count += 1;
            }
            for next in &n.dependents {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        count
    }

    /// Longest path by summed estimated duration through the unresolved
    /// (non-terminal) portion, ties broken by earlier submission. Returns
    /// the path from its head task onward.
    pub fn critical_path(&self) -> Vec<TaskId> {
        // Memoized longest tail weight starting at each live node.
        let mut memo: HashMap<TaskId, (u64, Option<TaskId>)> = HashMap::new();
        let live: Vec<&TaskId> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.state.is_terminal())
            .map(|(id, _)| id)
            .collect();

        for id in &live {
            self.longest_from(id, &mut memo);
        }

        let mut best: Option<(&TaskId, u64)> = None;
        for id in &live {
            // Only consider path heads: live nodes with no live prerequisite.
            let node = &self.nodes[*id];
            let has_live_prereq = node
                .prereqs
                .iter()
                .any(|p| !self.nodes[p].state.is_terminal());
            if has_live_prereq {
                continue;
            }
            let weight = memo[*id].0;
            let better = match best {
                None => true,
                Some((cur, w)) => {
                    weight > w
                        || (weight == w
                            && node.submitted_at < self.nodes[cur].submitted_at)
                }
            };
            if better {
                best = Some((id, weight));
            }
        }

        let mut path = Vec::new();
        let mut cursor = best.map(|(id, _)| id.clone());
        while let Some(id) = cursor {
            cursor = memo[&id].1.clone();
            path.push(id);
        }
        path
    }

    fn longest_from(&self, id: &TaskId, memo: &mut HashMap<TaskId, (u64, Option<TaskId>)>) -> u64 {
        if let Some((w, _)) = memo.get(id) {
            return *w;
        }
        let node = &self.nodes[id];
        let mut best_next: Option<TaskId> = None;
        let mut best_w = 0u64;
        for d in &node.dependents {
            if self.nodes[d].state.is_terminal() {
                continue;
            }
            let w = self.longest_from(d, memo);
            let better = w > best_w
                || (w == best_w
                    && best_next
                        .as_ref()
                        .map(|b| self.nodes[d].submitted_at < self.nodes[b].submitted_at)
                        .unwrap_or(true));
            if better {
                best_w = w;
                best_next = Some(d.clone());
            }
        }
        let total = node.estimated_ms + best_w;
        memo.insert(id.clone(), (total, best_next));
        total
    }

    /// Topological order over every node, deterministic within a level by
    /// (submission time, id). Planning display only; dispatch order comes
    /// from the priority queue.
    pub fn execution_order(&self) -> Vec<TaskId> {
        let mut indegree: HashMap<&TaskId, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id, n.prereqs.len()))
            .collect();
        let mut frontier: Vec<&TaskId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while !frontier.is_empty() {
            frontier.sort_by(|a, b| {
                let (na, nb) = (&self.nodes[*a], &self.nodes[*b]);
                (na.submitted_at, *a).cmp(&(nb.submitted_at, *b))
            });
            let mut next = Vec::new();
            for id in frontier.drain(..) {
                order.push(id.clone());
                for d in &self.nodes[id].dependents {
                    let deg = indegree.get_mut(d).expect("dependent tracked");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(d);
                    }
                }
            }
            frontier = next;
        }
        order
    }

    /// Remove a terminal task, garbage-collecting its incoming edges.
    /// Outgoing edges to live dependents keep the prerequisite entry so
    /// readiness history is not rewritten; removal is rejected while any
    /// dependent is still live.
    pub fn remove(&mut self, id: &TaskId) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))?;
        if !node.state.is_terminal() {
            return Err(GraphError::NotTerminal(id.clone()));
        }
        if node
            .dependents
            .iter()
            .any(|d| !self.nodes[d].state.is_terminal())
        {
            return Err(GraphError::NotTerminal(id.clone()));
        }
        let node = self.nodes.remove(id).expect("present");
        for p in &node.prereqs {
            if let Some(pn) = self.nodes.get_mut(p) {
                pn.dependents.remove(id);
            }
        }
        for d in &node.dependents {
            if let Some(dn) = self.nodes.get_mut(d) {
                dn.prereqs.remove(id);
            }
        }
        Ok(())
    }

    /// All edges as (prerequisite, dependent) pairs, for persistence.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut out = Vec::new();
        for (id, node) in &self.nodes {
            for d in &node.dependents {
                out.push((id.clone(), d.clone()));
            }
        }
        out.sort();
        out
    }

    /// Rebuild a graph from persisted task facts. Nodes first, then edges;
    /// the inputs came out of a previously valid graph so edge insertion
    /// bypasses the cycle walk.
    pub fn restore(
        tasks: impl IntoIterator<Item = (TaskId, TaskState, u64, DateTime<Utc>)>,
        edges: impl IntoIterator<Item = (TaskId, TaskId)>,
    ) -> Self {
        let mut graph = Self::new();
        for (id, state, estimated_ms, submitted_at) in tasks {
            graph.nodes.insert(
                id,
                Node {
                    state,
                    prereqs: BTreeSet::new(),
                    dependents: BTreeSet::new(),
                    estimated_ms,
                    submitted_at,
                },
            );
        }
        for (prereq, dependent) in edges {
            if graph.nodes.contains_key(&prereq) && graph.nodes.contains_key(&dependent) {
                graph
                    .nodes
                    .get_mut(&prereq)
                    .expect("checked")
                    .dependents
                    .insert(dependent.clone());
                graph
                    .nodes
                    .get_mut(&dependent)
                    .expect("checked")
                    .prereqs
                    .insert(prereq);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s)
    }

    fn chain(graph: &mut DepGraph, ids: &[&str]) {
        let mut prev: Option<TaskId> = None;
        for (i, id) in ids.iter().enumerate() {
            let prereqs: Vec<TaskId> = prev.iter().cloned().collect();
            graph
                .insert(
                    tid(id),
                    &prereqs,
                    1_000,
                    Utc::now() + chrono::Duration::milliseconds(i as i64),
                )
                .unwrap();
            prev = Some(tid(id));
        }
    }

    #[test]
    fn test_insert_no_deps_is_ready() {
        let mut g = DepGraph::new();
        let state = g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        assert_eq!(state, TaskState::Ready);
        assert!(g.ready_set().contains(&tid("t1")));
    }

    #[test]
    fn test_insert_with_deps_is_pending() {
        let mut g = DepGraph::new();
        g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        let state = g.insert(tid("t2"), &[tid("t1")], 0, Utc::now()).unwrap();
        assert_eq!(state, TaskState::Pending);
        assert!(!g.ready_set().contains(&tid("t2")));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut g = DepGraph::new();
        g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        assert_eq!(
            g.insert(tid("t1"), &[], 0, Utc::now()),
            Err(GraphError::Duplicate(tid("t1")))
        );
    }

    #[test]
    fn test_unknown_prereq_rejected() {
        let mut g = DepGraph::new();
        assert_eq!(
            g.insert(tid("t2"), &[tid("missing")], 0, Utc::now()),
            Err(GraphError::UnknownPrereq(tid("missing")))
        );
    }

    #[test]
    fn test_cycle_rejected_graph_unchanged() {
        // T1 <- T2 <- T3, then a back edge T3 -> T1 must be rejected.
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2", "t3"]);
        let edges_before = g.edges();
        assert_eq!(g.add_edge(&tid("t3"), &tid("t1")), Err(GraphError::CycleDetected));
        assert_eq!(g.edges(), edges_before);
        // T3 still has exactly T2 as prerequisite.
        assert_eq!(g.nodes[&tid("t3")].prereqs.len(), 1);
        assert!(g.nodes[&tid("t3")].prereqs.contains(&tid("t2")));
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut g = DepGraph::new();
        g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        assert_eq!(g.add_edge(&tid("t1"), &tid("t1")), Err(GraphError::CycleDetected));
    }

    #[test]
    fn test_success_unblocks_dependents() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2", "t3"]);
        let ready = g.mark_succeeded(&tid("t1")).unwrap();
        assert_eq!(ready, [tid("t2")].into_iter().collect());
        // T3 still blocked on T2.
        assert_eq!(g.state(&tid("t3")), Some(TaskState::Pending));
        let ready = g.mark_succeeded(&tid("t2")).unwrap();
        assert_eq!(ready, [tid("t3")].into_iter().collect());
    }

    #[test]
    fn test_diamond_unblocks_only_when_both_sides_done() {
        let mut g = DepGraph::new();
        let now = Utc::now();
        g.insert(tid("a"), &[], 0, now).unwrap();
        g.insert(tid("b"), &[tid("a")], 0, now).unwrap();
        g.insert(tid("c"), &[tid("a")], 0, now).unwrap();
        g.insert(tid("d"), &[tid("b"), tid("c")], 0, now).unwrap();

        g.mark_succeeded(&tid("a")).unwrap();
        assert!(g.mark_succeeded(&tid("b")).unwrap().is_empty());
        let ready = g.mark_succeeded(&tid("c")).unwrap();
        assert_eq!(ready, [tid("d")].into_iter().collect());
    }

    #[test]
    fn test_permanent_failure_cancels_transitively() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2", "t3"]);
        let cancelled = g.mark_failed_permanent(&tid("t1")).unwrap();
        assert_eq!(cancelled, vec![tid("t2"), tid("t3")]);
        assert_eq!(g.state(&tid("t1")), Some(TaskState::Failed));
        assert_eq!(g.state(&tid("t2")), Some(TaskState::Cancelled));
        assert_eq!(g.state(&tid("t3")), Some(TaskState::Cancelled));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2"]);
        let first = g.mark_cancelled(&tid("t1")).unwrap();
        assert_eq!(first, vec![tid("t2")]);
        let second = g.mark_cancelled(&tid("t1")).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut g = DepGraph::new();
        g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        g.mark_succeeded(&tid("t1")).unwrap();
        assert!(matches!(
            g.set_state(&tid("t1"), TaskState::Ready),
            Err(GraphError::Terminal { .. })
        ));
        assert!(matches!(
            g.mark_failed_permanent(&tid("t1")),
            Err(GraphError::Terminal { .. })
        ));
    }

    #[test]
    fn test_unresolved_dependent_count_counts_once() {
        let mut g = DepGraph::new();
        let now = Utc::now();
        g.insert(tid("a"), &[], 0, now).unwrap();
        g.insert(tid("b"), &[tid("a")], 0, now).unwrap();
        g.insert(tid("c"), &[tid("a")], 0, now).unwrap();
        // d depends on both b and c; reachable twice from a but counted once.
        g.insert(tid("d"), &[tid("b"), tid("c")], 0, now).unwrap();
        assert_eq!(g.unresolved_dependent_count(&tid("a")), 3);
        assert_eq!(g.unresolved_dependent_count(&tid("b")), 1);
        assert_eq!(g.unresolved_dependent_count(&tid("d")), 0);
    }

    #[test]
    fn test_critical_path_longest_estimate() {
        let mut g = DepGraph::new();
        let now = Utc::now();
        g.insert(tid("root"), &[], 100, now).unwrap();
        // Short branch: 100 + 50.
        g.insert(tid("short"), &[tid("root")], 50, now).unwrap();
        // Long branch: 100 + 400 + 10.
        g.insert(tid("long1"), &[tid("root")], 400, now).unwrap();
        g.insert(tid("long2"), &[tid("long1")], 10, now).unwrap();

        assert_eq!(
            g.critical_path(),
            vec![tid("root"), tid("long1"), tid("long2")]
        );
    }

    #[test]
    fn test_critical_path_skips_resolved_nodes() {
        let mut g = DepGraph::new();
        let now = Utc::now();
        g.insert(tid("done"), &[], 10_000, now).unwrap();
        g.insert(tid("next"), &[tid("done")], 100, now).unwrap();
        g.mark_succeeded(&tid("done")).unwrap();
        assert_eq!(g.critical_path(), vec![tid("next")]);
    }

    #[test]
    fn test_execution_order_respects_edges() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2", "t3"]);
        assert_eq!(g.execution_order(), vec![tid("t1"), tid("t2"), tid("t3")]);
    }

    #[test]
    fn test_remove_requires_terminal() {
        let mut g = DepGraph::new();
        g.insert(tid("t1"), &[], 0, Utc::now()).unwrap();
        assert_eq!(g.remove(&tid("t1")), Err(GraphError::NotTerminal(tid("t1"))));
        g.mark_succeeded(&tid("t1")).unwrap();
        g.remove(&tid("t1")).unwrap();
        assert!(!g.contains(&tid("t1")));
    }

    #[test]
    fn test_remove_gc_edges() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2"]);
        g.mark_succeeded(&tid("t1")).unwrap();
        g.mark_succeeded(&tid("t2")).unwrap();
        g.remove(&tid("t2")).unwrap();
        assert!(g.nodes[&tid("t1")].dependents.is_empty());
        g.remove(&tid("t1")).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn test_restore_round_trip() {
        let mut g = DepGraph::new();
        chain(&mut g, &["t1", "t2", "t3"]);
        g.mark_succeeded(&tid("t1")).unwrap();

        let tasks: Vec<_> = ["t1", "t2", "t3"]
            .iter()
            .map(|id| {
                let n = &g.nodes[&tid(id)];
                (tid(id), n.state, n.estimated_ms, n.submitted_at)
            })
            .collect();
        let restored = DepGraph::restore(tasks, g.edges());
        assert_eq!(restored.edges(), g.edges());
        assert_eq!(restored.state(&tid("t1")), Some(TaskState::Succeeded));
        assert_eq!(restored.ready_set(), g.ready_set());
    }
}
