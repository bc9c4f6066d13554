//! Ready Queue
//!
//! Holds tasks in `ready` state, ordered by a composite score; FIFO by
//! ready-timestamp within equal score. Backed by a max-heap with lazy
//! deletion: removals and rescores leave stale heap entries behind, which
//! `pop`/`peek` discard by generation check. A periodic sweep refreshes
//! the wait bonus for the top of the queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

use taskmesh_types::{Priority, TaskId};

/// Wait bonus cap. The bonus grows one point per second waited until here.
const WAIT_BONUS_CAP: u64 = 600;

/// Deadline bonus reaches this as the deadline arrives.
const DEADLINE_BONUS_MAX: u64 = 5_000;

/// Horizon inside which the deadline bonus starts to apply.
const DEADLINE_HORIZON_MS: i64 = 60_000;

/// Everything the composite score is a function of.
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    pub priority: Priority,
    /// Transitive dependents not yet succeeded, counted once.
    pub unresolved_dependents: usize,
    pub ready_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Composite queue score. Monotone in every input: higher priority, more
/// dependents, longer waits, and nearer deadlines all raise it.
pub fn compose_score(inputs: &ScoreInputs, now: DateTime<Utc>) -> u64 {
    let base = inputs.priority.base_score();
    let dependents = 10 * inputs.unresolved_dependents as u64;

    let waited_secs = (now - inputs.ready_at).num_seconds().max(0) as u64;
    let wait_bonus = waited_secs.min(WAIT_BONUS_CAP);

    let deadline_bonus = match inputs.deadline {
        Some(deadline) => {
            let remaining_ms = (deadline - now).num_milliseconds();
            if remaining_ms <= 0 {
                DEADLINE_BONUS_MAX
            } else if remaining_ms < DEADLINE_HORIZON_MS {
                DEADLINE_BONUS_MAX * (DEADLINE_HORIZON_MS - remaining_ms) as u64
                    / DEADLINE_HORIZON_MS as u64
            } else {
                0
            }
        }
        None => 0,
    };

    base + dependents + wait_bonus + deadline_bonus
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    score: u64,
    ready_at: DateTime<Utc>,
    seq: u64,
    generation: u64,
    id: TaskId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score first, then earlier ready time, then
        // insertion order.
        self.score
            .cmp(&other.score)
            .then_with(|| other.ready_at.cmp(&self.ready_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct EntryMeta {
    score: u64,
    ready_at: DateTime<Utc>,
    generation: u64,
}

/// The ready queue.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<HeapEntry>,
    entries: HashMap<TaskId, EntryMeta>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or re-insert a task. Re-pushing an existing id rescores it.
    pub fn push(&mut self, id: TaskId, score: u64, ready_at: DateTime<Utc>) {
        let generation = match self.entries.get(&id) {
            Some(meta) => meta.generation + 1,
            None => 0,
        };
        self.entries.insert(
            id.clone(),
            EntryMeta {
                score,
                ready_at,
                generation,
            },
        );
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            score,
            ready_at,
            seq: self.next_seq,
            generation,
            id,
        });
    }

    /// Update the score of a queued task; no-op for absent ids.
    pub fn update_score(&mut self, id: &TaskId, score: u64) {
        let Some(meta) = self.entries.get_mut(id) else {
            return;
        };
        if meta.score == score {
            return;
        }
        meta.score = score;
        meta.generation += 1;
        let entry = HeapEntry {
            score,
            ready_at: meta.ready_at,
            seq: {
                self.next_seq += 1;
                self.next_seq
            },
            generation: meta.generation,
            id: id.clone(),
        };
        self.heap.push(entry);
    }

    /// Drop stale heap entries off the top.
    fn settle(&mut self) {
        while let Some(top) = self.heap.peek() {
            let live = self
                .entries
                .get(&top.id)
                .map(|meta| meta.generation == top.generation)
                .unwrap_or(false);
            if live {
                return;
            }
            self.heap.pop();
        }
    }

    /// Highest-scored task without removing it.
    pub fn peek(&mut self) -> Option<&TaskId> {
        self.settle();
        self.heap.peek().map(|entry| &entry.id)
    }

    /// Remove and return the highest-scored task.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.settle();
        let entry = self.heap.pop()?;
        self.entries.remove(&entry.id);
        Some(entry.id)
    }

    /// Remove a task wherever it sits. Lazy: the heap entry dies by
    /// generation mismatch.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Refresh the scores of up to `top_k` queue heads using `rescore`.
    pub fn sweep<F>(&mut self, top_k: usize, mut rescore: F)
    where
        F: FnMut(&TaskId, DateTime<Utc>) -> u64,
    {
        let heads: Vec<(TaskId, DateTime<Utc>)> = {
            let mut scratch = self.heap.clone();
            let mut out = Vec::with_capacity(top_k);
            while out.len() < top_k {
                let Some(entry) = scratch.pop() else { break };
                let live = self
                    .entries
                    .get(&entry.id)
                    .map(|meta| meta.generation == entry.generation)
                    .unwrap_or(false);
                if live {
                    out.push((entry.id, entry.ready_at));
                }
            }
            out
        };
        for (id, ready_at) in heads {
            let score = rescore(&id, ready_at);
            self.update_score(&id, score);
        }
    }

    /// Queue contents in dequeue order, with scores. Used by checkpoints.
    pub fn ordered_snapshot(&self) -> Vec<(TaskId, u64)> {
        let mut scratch = self.heap.clone();
        let mut out = Vec::with_capacity(self.entries.len());
        let mut seen: std::collections::HashSet<TaskId> = std::collections::HashSet::new();
        while let Some(entry) = scratch.pop() {
            let live = self
                .entries
                .get(&entry.id)
                .map(|meta| meta.generation == entry.generation)
                .unwrap_or(false);
            if live && seen.insert(entry.id.clone()) {
                out.push((entry.id, entry.score));
            }
        }
        out
    }
}
