//! Metrics Aggregator
//!
//! Event-fed rollups: per-worker, per-provider, per-department, and
//! system-wide. A pure observer — it consumes the bus feed on its own
//! buffer and its failures or drops never reach the scheduler. Threshold
//! crossings emit alert events back onto the bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::bus::EventBus;
use taskmesh_types::{Event, EventBody, ProviderId, TaskId};

/// Alert thresholds; `None` disables a check.
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub queue_depth_max: Option<u64>,
    /// Minimum acceptable system success rate, checked once enough
    /// completions have accumulated.
    pub min_success_rate: Option<f64>,
    /// Fraction of a provider's daily budget that triggers a cost alert.
    pub provider_budget_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth_max: Some(1_000),
            min_success_rate: Some(0.5),
            provider_budget_ratio: 0.9,
        }
    }
}

/// Completions before the success-rate alert can fire.
const SUCCESS_RATE_MIN_SAMPLES: u64 = 20;

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerRollup {
    pub completed: u64,
    pub failed: u64,
    pub total_latency_ms: u64,
}

impl WorkerRollup {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.completed as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderRollup {
    pub requests: u64,
    pub failures: u64,
    pub tokens_consumed: u64,
    /// Accumulated cost in account currency units.
    pub cost: f64,
}

impl ProviderRollup {
    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DepartmentRollup {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Read-only view over the aggregate state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub per_worker: BTreeMap<String, WorkerRollup>,
    pub per_provider: BTreeMap<String, ProviderRollup>,
    pub per_department: BTreeMap<String, DepartmentRollup>,
    pub queue_depth: u64,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub wait_samples: u64,
    pub total_wait_ms: u64,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed;
        if finished == 0 {
            1.0
        } else {
            self.succeeded as f64 / finished as f64
        }
    }

    pub fn avg_wait_ms(&self) -> f64 {
        if self.wait_samples == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.wait_samples as f64
        }
    }
}

#[derive(Default)]
struct MetricsState {
    snapshot: MetricsSnapshot,
    /// Ready timestamps awaiting assignment, for wait-time rollups.
    pending_waits: HashMap<TaskId, DateTime<Utc>>,
    /// Edge-triggered alert latches.
    queue_alert_active: bool,
    success_alert_active: bool,
    cost_alert_active: HashMap<ProviderId, bool>,
}

/// Per-provider pricing the aggregator needs for cost rollups.
#[derive(Debug, Clone)]
pub struct ProviderPricing {
    pub id: ProviderId,
    pub cost_per_1k_tokens: f64,
    pub daily_token_budget: u64,
}

/// The metrics aggregator.
pub struct MetricsAggregator {
    state: RwLock<MetricsState>,
    thresholds: AlertThresholds,
    pricing: HashMap<ProviderId, ProviderPricing>,
}

impl MetricsAggregator {
    pub fn new(thresholds: AlertThresholds, pricing: Vec<ProviderPricing>) -> Self {
        Self {
            state: RwLock::new(MetricsState::default()),
            thresholds,
            pricing: pricing.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Current rollups.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().expect("metrics lock").snapshot.clone()
    }

    /// The scheduler reports queue depth each housekeeping pass.
    pub fn set_queue_depth(&self, depth: u64) -> Vec<Event> {
        let mut state = self.state.write().expect("metrics lock");
        state.snapshot.queue_depth = depth;
        let mut alerts = Vec::new();
        if let Some(max) = self.thresholds.queue_depth_max {
            if depth > max && !state.queue_alert_active {
                state.queue_alert_active = true;
                alerts.push(alert(
                    "queue_depth",
                    format!("queue depth {} exceeds threshold {}", depth, max),
                ));
            } else if depth <= max {
                state.queue_alert_active = false;
            }
        }
        alerts
    }

    /// Fold one event into the rollups. Returns any threshold alerts.
    pub fn observe(&self, event: &Event) -> Vec<Event> {
        let mut state = self.state.write().expect("metrics lock");
        let mut alerts = Vec::new();

        match &event.body {
            EventBody::TaskSubmitted { department, .. } => {
                state.snapshot.submitted += 1;
                state
                    .snapshot
                    .per_department
                    .entry(department.as_str().to_string())
                    .or_default()
                    .submitted += 1;
            }
            EventBody::TaskReady { task } => {
                state.pending_waits.insert(task.clone(), event.ts);
            }
            EventBody::TaskAssigned { task, .. } => {
                if let Some(ready_at) = state.pending_waits.remove(task) {
                    let wait = (event.ts - ready_at).num_milliseconds().max(0) as u64;
                    state.snapshot.wait_samples += 1;
                    state.snapshot.total_wait_ms += wait;
                }
            }
            EventBody::TaskCompleted {
                worker,
                provider,
                tokens_consumed,
                latency_ms,
                ..
            } => {
                state.snapshot.succeeded += 1;
                let rollup = state
                    .snapshot
                    .per_worker
                    .entry(worker.as_str().to_string())
                    .or_default();
                rollup.completed += 1;
                rollup.total_latency_ms += latency_ms;

                let pricing = self.pricing.get(provider);
                let provider_rollup = state
                    .snapshot
                    .per_provider
                    .entry(provider.as_str().to_string())
                    .or_default();
                provider_rollup.requests += 1;
                provider_rollup.tokens_consumed += tokens_consumed;
                if let Some(pricing) = pricing {
                    provider_rollup.cost +=
                        *tokens_consumed as f64 / 1000.0 * pricing.cost_per_1k_tokens;
                    let cost_so_far = provider_rollup.cost;

                    let budget_cost = pricing.daily_token_budget as f64 / 1000.0
                        * pricing.cost_per_1k_tokens;
                    let tripped = budget_cost > 0.0
                        && cost_so_far > budget_cost * self.thresholds.provider_budget_ratio;
                    let active = state
                        .cost_alert_active
                        .entry(provider.clone())
                        .or_default();
                    if tripped && !*active {
                        *active = true;
                        alerts.push(alert(
                            "provider_cost",
                            format!("provider {} cost approaching daily budget", provider),
                        ));
                    }
                }
            }
            EventBody::TaskFailed {
                task,
                provider,
                terminal,
                ..
            } => {
                if *terminal {
                    state.snapshot.failed += 1;
                }
                if let Some(provider) = provider {
                    let rollup = state
                        .snapshot
                        .per_provider
                        .entry(provider.as_str().to_string())
                        .or_default();
                    rollup.requests += 1;
                    rollup.failures += 1;
                }
                state.pending_waits.remove(task);
            }
            EventBody::TaskRetried { .. } => {
                state.snapshot.retried += 1;
            }
            EventBody::TaskCancelled { task, .. } => {
                state.snapshot.cancelled += 1;
                state.pending_waits.remove(task);
            }
            _ => {}
        }

        if let Some(min) = self.thresholds.min_success_rate {
            let finished = state.snapshot.succeeded + state.snapshot.failed;
            if finished >= SUCCESS_RATE_MIN_SAMPLES {
                let rate = state.snapshot.success_rate();
                if rate < min && !state.success_alert_active {
                    state.success_alert_active = true;
                    alerts.push(alert(
                        "success_rate",
                        format!("system success rate {:.2} below threshold {:.2}", rate, min),
                    ));
                } else if rate >= min {
                    state.success_alert_active = false;
                }
            }
        }

        alerts
    }

    /// Consume a bus subscription until the bus goes away, publishing any
    /// alerts back. Runs in its own task; never propagates errors.
    pub async fn run(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut tasks = bus.subscribe("task", None, false);
        info!("Metrics aggregator started");
        while let Some(event) = tasks.recv().await {
            for alert_event in self.observe(&event) {
                debug!(body = ?alert_event.body, "Metrics alert");
                bus.publish("alert", &alert_event);
            }
        }
    }
}

fn alert(code: &str, message: String) -> Event {
    Event::new(EventBody::Alert {
        code: code.to_string(),
        message,
    })
}
