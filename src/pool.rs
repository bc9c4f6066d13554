//! Worker Pool
//!
//! Registry of executor slots. Reservations are atomic: selection, load
//! accounting, and lease issue happen under one lock. Workers that stop
//! heartbeating are marked stopped and their in-flight tasks handed back
//! for requeue; idle workers decay stale load toward zero so a lost
//! release can never wedge a slot forever.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use taskmesh_types::{LeaseToken, TaskId, WorkerId, WorkerRecord, WorkerSpec, WorkerState};

/// EWMA smoothing factor for worker latency.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No worker available for the requested capabilities")]
    NoWorker,

    #[error("Worker already registered: {0}")]
    Duplicate(WorkerId),

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Unknown lease: {0}")]
    UnknownLease(Uuid),
}

/// Outcome reported on release.
#[derive(Debug, Clone, Copy)]
pub struct WorkOutcome {
    pub success: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
struct Lease {
    worker: WorkerId,
    task: TaskId,
}

#[derive(Default)]
struct PoolInner {
    workers: HashMap<WorkerId, WorkerRecord>,
    leases: HashMap<Uuid, Lease>,
}

/// A worker that expired and the tasks it was holding.
#[derive(Debug, Clone)]
pub struct ExpiredWorker {
    pub worker: WorkerId,
    pub orphaned_tasks: Vec<TaskId>,
}

/// The worker pool.
pub struct WorkerPool {
    inner: RwLock<PoolInner>,
    heartbeat_timeout: Duration,
    decay_after: Duration,
    decay_factor: f64,
}

impl WorkerPool {
    pub fn new(heartbeat_timeout_ms: u64, decay_after_ms: u64, decay_factor: f64) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            heartbeat_timeout: Duration::milliseconds(heartbeat_timeout_ms as i64),
            decay_after: Duration::milliseconds(decay_after_ms as i64),
            decay_factor,
        }
    }

    /// Register a worker; it is immediately eligible for reservations.
    pub fn register(&self, spec: WorkerSpec, now: DateTime<Utc>) -> Result<WorkerRecord, PoolError> {
        let id = spec.id.clone().unwrap_or_else(WorkerId::generate);
        let mut inner = self.inner.write().expect("pool lock");
        if inner.workers.contains_key(&id) {
            return Err(PoolError::Duplicate(id));
        }
        let mut record = WorkerRecord::from_spec(id.clone(), spec, now);
        record.state = WorkerState::Ready;
        inner.workers.insert(id, record.clone());
        Ok(record)
    }

    /// Begin draining: current work finishes, no new assignments.
    pub fn drain(&self, id: &WorkerId) -> Result<(), PoolError> {
        let mut inner = self.inner.write().expect("pool lock");
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownWorker(id.clone()))?;
        worker.state = WorkerState::Draining;
        Ok(())
    }

    /// Remove a worker. Outstanding leases are returned so their tasks can
    /// be requeued.
    pub fn remove(&self, id: &WorkerId) -> Result<Vec<TaskId>, PoolError> {
        let mut inner = self.inner.write().expect("pool lock");
        if inner.workers.remove(id).is_none() {
            return Err(PoolError::UnknownWorker(id.clone()));
        }
        let orphaned: Vec<Uuid> = inner
            .leases
            .iter()
            .filter(|(_, lease)| &lease.worker == id)
            .map(|(lease_id, _)| *lease_id)
            .collect();
        Ok(orphaned
            .into_iter()
            .filter_map(|lease_id| inner.leases.remove(&lease_id))
            .map(|lease| lease.task)
            .collect())
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<(), PoolError> {
        let mut inner = self.inner.write().expect("pool lock");
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownWorker(id.clone()))?;
        worker.last_active = now;
        if worker.state == WorkerState::Starting {
            worker.state = WorkerState::Ready;
        }
        Ok(())
    }

    /// Reserve a worker able to execute `required`. Atomic with respect to
    /// concurrent reservations. Selection prefers fully idle workers, then
    /// the weighted score of success rate, latency, and load.
    pub fn reserve(
        &self,
        required: &BTreeSet<String>,
        task: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<LeaseToken, PoolError> {
        let mut inner = self.inner.write().expect("pool lock");

        let max_latency = inner
            .workers
            .values()
            .map(|w| w.ewma_latency_ms)
            .fold(0.0f64, f64::max);

        let chosen = inner
            .workers
            .values()
            .filter(|w| w.can_execute(required) && w.has_free_slot())
            .map(|w| {
                let normalized_latency = if max_latency > 0.0 {
                    w.ewma_latency_ms / max_latency
                } else {
                    0.0
                };
                let score = w.success_rate() * 0.4
                    + (1.0 - normalized_latency) * 0.3
                    + (1.0 - w.load) * 0.3;
                (w.id.clone(), w.load <= f64::EPSILON, score)
            })
            // Fully idle beats loaded; within a tier the weighted score wins.
            .max_by(|(_, a_idle, a_score), (_, b_idle, b_score)| {
                (a_idle, a_score)
                    .partial_cmp(&(b_idle, b_score))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _, _)| id)
            .ok_or(PoolError::NoWorker)?;

        let worker = inner.workers.get_mut(&chosen).expect("chosen exists");
        worker.load = (worker.load + worker.load_step()).min(1.0);
        worker.state = WorkerState::Busy;
        worker.last_active = now;

        let token = LeaseToken {
            lease_id: Uuid::new_v4(),
            worker: chosen.clone(),
            issued_at: now,
        };
        inner.leases.insert(
            token.lease_id,
            Lease {
                worker: chosen,
                task: task.clone(),
            },
        );
        debug!(worker = %token.worker, task = %task, "Reserved worker");
        Ok(token)
    }

    /// Release a lease with its outcome, updating load and counters.
    pub fn release(&self, token: &LeaseToken, outcome: WorkOutcome) -> Result<(), PoolError> {
        self.finish_lease(token, Some(outcome))
    }

    /// Release a lease without an outcome. Used when an assignment is
    /// abandoned before dispatch (no provider available).
    pub fn cancel_lease(&self, token: &LeaseToken) -> Result<(), PoolError> {
        self.finish_lease(token, None)
    }

    fn finish_lease(
        &self,
        token: &LeaseToken,
        outcome: Option<WorkOutcome>,
    ) -> Result<(), PoolError> {
        let mut inner = self.inner.write().expect("pool lock");
        let lease = inner
            .leases
            .remove(&token.lease_id)
            .ok_or(PoolError::UnknownLease(token.lease_id))?;

        let still_leased = inner.leases.values().any(|l| l.worker == lease.worker);
        let Some(worker) = inner.workers.get_mut(&lease.worker) else {
            // Worker expired or was removed while the task ran.
            return Ok(());
        };

        worker.load = (worker.load - worker.load_step()).max(0.0);
        worker.last_active = Utc::now();
        if let Some(outcome) = outcome {
            if outcome.success {
                worker.successes += 1;
            } else {
                worker.failures += 1;
            }
            worker.ewma_latency_ms = if worker.ewma_latency_ms == 0.0 {
                outcome.latency_ms as f64
            } else {
                LATENCY_ALPHA * outcome.latency_ms as f64
                    + (1.0 - LATENCY_ALPHA) * worker.ewma_latency_ms
            };
        }
        if worker.state == WorkerState::Busy && !still_leased {
            worker.state = WorkerState::Idle;
        }
        Ok(())
    }

    /// Periodic housekeeping. Returns workers that missed their heartbeat
    /// window, along with the tasks they were holding.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<ExpiredWorker> {
        let mut inner = self.inner.write().expect("pool lock");

        let expired_ids: Vec<WorkerId> = inner
            .workers
            .values()
            .filter(|w| {
                w.state != WorkerState::Stopped && now - w.last_active > self.heartbeat_timeout
            })
            .map(|w| w.id.clone())
            .collect();

        let mut expired = Vec::new();
        for id in expired_ids {
            warn!(worker = %id, "Worker heartbeat expired");
            if let Some(worker) = inner.workers.get_mut(&id) {
                worker.state = WorkerState::Stopped;
                worker.load = 0.0;
            }
            let lease_ids: Vec<Uuid> = inner
                .leases
                .iter()
                .filter(|(_, lease)| lease.worker == id)
                .map(|(lease_id, _)| *lease_id)
                .collect();
            let orphaned_tasks = lease_ids
                .into_iter()
                .filter_map(|lease_id| inner.leases.remove(&lease_id))
                .map(|lease| lease.task)
                .collect();
            expired.push(ExpiredWorker {
                worker: id,
                orphaned_tasks,
            });
        }

        // Load decay for workers inactive past the threshold. Covers
        // reservations whose release was lost.
        for worker in inner.workers.values_mut() {
            if worker.state == WorkerState::Stopped {
                continue;
            }
            if worker.load > 0.0 && now - worker.last_active > self.decay_after {
                worker.load *= self.decay_factor;
                if worker.load < worker.load_step() / 10.0 {
                    worker.load = 0.0;
                }
            }
        }

        expired
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerRecord> {
        self.inner.read().expect("pool lock").workers.get(id).cloned()
    }

    pub fn list(&self) -> Vec<WorkerRecord> {
        let inner = self.inner.read().expect("pool lock");
        let mut workers: Vec<WorkerRecord> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn lease_count(&self) -> usize {
        self.inner.read().expect("pool lock").leases.len()
    }

    /// Reinstall workers from a snapshot: identities and capabilities only,
    /// with load cleared and no leases.
    pub fn restore(&self, workers: Vec<WorkerRecord>, now: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("pool lock");
        inner.leases.clear();
        inner.workers.clear();
        for mut worker in workers {
            worker.load = 0.0;
            worker.last_active = now;
            if worker.state != WorkerState::Stopped && worker.state != WorkerState::Draining {
                worker.state = WorkerState::Ready;
            }
            inner.workers.insert(worker.id.clone(), worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn spec(id: &str, capabilities: &[&str], concurrency: u32) -> WorkerSpec {
        WorkerSpec {
            id: Some(WorkerId::new(id)),
            capabilities: caps(capabilities),
            concurrency,
            preferred_providers: vec![],
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(30_000, 60_000, 0.5)
    }

    #[test]
    fn test_register_and_duplicate() {
        let pool = pool();
        let now = Utc::now();
        let record = pool.register(spec("w1", &["summarize"], 2), now).unwrap();
        assert_eq!(record.state, WorkerState::Ready);
        assert_eq!(
            pool.register(spec("w1", &["summarize"], 2), now),
            Err(PoolError::Duplicate(WorkerId::new("w1")))
        );
    }

    #[test]
    fn test_reserve_respects_capabilities() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("w1", &["summarize"], 1), now).unwrap();

        assert_eq!(
            pool.reserve(&caps(&["translate"]), &TaskId::new("t1"), now)
                .unwrap_err(),
            PoolError::NoWorker
        );
        let token = pool
            .reserve(&caps(&["summarize"]), &TaskId::new("t1"), now)
            .unwrap();
        assert_eq!(token.worker, WorkerId::new("w1"));
    }

    #[test]
    fn test_concurrency_limit_enforced() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("w1", &[], 2), now).unwrap();

        let t1 = pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap();
        let _t2 = pool.reserve(&caps(&[]), &TaskId::new("t2"), now).unwrap();
        assert_eq!(
            pool.reserve(&caps(&[]), &TaskId::new("t3"), now).unwrap_err(),
            PoolError::NoWorker
        );

        // Releasing frees a slot again.
        pool.release(
            &t1,
            WorkOutcome {
                success: true,
                latency_ms: 10,
            },
        )
        .unwrap();
        pool.reserve(&caps(&[]), &TaskId::new("t3"), now).unwrap();
    }

    #[test]
    fn test_load_accounting_round_trips() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("w1", &[], 4), now).unwrap();

        let token = pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap();
        assert!((pool.get(&WorkerId::new("w1")).unwrap().load - 0.25).abs() < 1e-9);

        pool.release(
            &token,
            WorkOutcome {
                success: true,
                latency_ms: 50,
            },
        )
        .unwrap();
        let worker = pool.get(&WorkerId::new("w1")).unwrap();
        assert_eq!(worker.load, 0.0);
        assert_eq!(worker.successes, 1);
        assert_eq!(worker.state, WorkerState::Idle);
    }

    #[test]
    fn test_draining_worker_not_reserved() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("w1", &[], 1), now).unwrap();
        pool.drain(&WorkerId::new("w1")).unwrap();
        assert_eq!(
            pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap_err(),
            PoolError::NoWorker
        );
    }

    #[test]
    fn test_idle_worker_preferred_over_loaded() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("busy", &[], 4), now).unwrap();
        pool.register(spec("idle", &[], 4), now).unwrap();
        // Occupy one slot of "busy".
        let mut found_busy = false;
        let token = pool.reserve(&caps(&[]), &TaskId::new("warm"), now).unwrap();
        let first_worker = token.worker.clone();
        // The next reservation must land on the other, fully idle worker.
        let second = pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap();
        assert_ne!(second.worker, first_worker);
        found_busy |= second.worker != first_worker;
        assert!(found_busy);
    }

    #[test]
    fn test_heartbeat_expiry_returns_orphans() {
        let pool = WorkerPool::new(1_000, 60_000, 0.5);
        let now = Utc::now();
        pool.register(spec("w1", &[], 1), now).unwrap();
        pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap();

        let later = now + Duration::milliseconds(5_000);
        let expired = pool.tick(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].worker, WorkerId::new("w1"));
        assert_eq!(expired[0].orphaned_tasks, vec![TaskId::new("t1")]);
        assert_eq!(
            pool.get(&WorkerId::new("w1")).unwrap().state,
            WorkerState::Stopped
        );
        assert_eq!(pool.lease_count(), 0);
    }

    #[test]
    fn test_stale_load_decays() {
        let pool = WorkerPool::new(3_600_000, 1_000, 0.5);
        let now = Utc::now();
        pool.register(spec("w1", &[], 2), now).unwrap();
        pool.reserve(&caps(&[]), &TaskId::new("t1"), now).unwrap();

        let later = now + Duration::milliseconds(5_000);
        pool.tick(later);
        let load = pool.get(&WorkerId::new("w1")).unwrap().load;
        assert!(load < 0.5 && load > 0.0);

        // Repeated ticks drive it to zero.
        for i in 0..20 {
            pool.tick(later + Duration::milliseconds(i));
        }
        assert_eq!(pool.get(&WorkerId::new("w1")).unwrap().load, 0.0);
    }

    #[test]
    fn test_restore_clears_transient_state() {
        let pool = pool();
        let now = Utc::now();
        pool.register(spec("w1", &["a"], 2), now).unwrap();
        pool.reserve(&caps(&["a"]), &TaskId::new("t1"), now).unwrap();

        let mut snapshot = pool.list();
        snapshot[0].load = 0.7;
        let restored = pool;
        restored.restore(snapshot, now);

        let worker = restored.get(&WorkerId::new("w1")).unwrap();
        assert_eq!(worker.load, 0.0);
        assert_eq!(worker.state, WorkerState::Ready);
        assert_eq!(restored.lease_count(), 0);
    }
}
