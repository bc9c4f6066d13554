//! Provider Registry
//!
//! Owns all provider counters and breaker state. Selection walks the cost
//! mode's members cheapest first and returns the first provider that is
//! admitting traffic, supports the required capabilities, and has daily
//! quota left. All operations are atomic with respect to concurrent
//! callers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::{info, warn};

use taskmesh_types::{CostMode, ProviderConfig, ProviderId, ProviderStatus};

use super::breaker::{BreakerEvent, CircuitBreaker};

/// EWMA smoothing factor for provider latency.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No provider available for the requested capabilities and mode")]
    NoProviderAvailable,

    #[error("Unknown provider: {0}")]
    UnknownProvider(ProviderId),
}

#[derive(Debug)]
struct ProviderEntry {
    config: ProviderConfig,
    breaker: CircuitBreaker,
    tokens_consumed_today: u64,
    requests: u64,
    failures: u64,
    ewma_latency_ms: f64,
    last_reset: DateTime<Utc>,
}

impl ProviderEntry {
    fn new(config: ProviderConfig, now: DateTime<Utc>) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.breaker),
            config,
            tokens_consumed_today: 0,
            requests: 0,
            failures: 0,
            ewma_latency_ms: 0.0,
            last_reset: now,
        }
    }

    fn quota_remaining(&self) -> bool {
        self.tokens_consumed_today < self.config.daily_token_budget
    }

    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            id: self.config.id.clone(),
            breaker: self.breaker.state(),
            tokens_consumed_today: self.tokens_consumed_today,
            requests: self.requests,
            failures: self.failures,
            window_failures: self.breaker.window_failures(),
            ewma_latency_ms: self.ewma_latency_ms,
            last_reset: self.last_reset,
            opened_at: self.breaker.opened_at(),
        }
    }
}

/// The provider registry.
pub struct ProviderRegistry {
    entries: Mutex<HashMap<ProviderId, ProviderEntry>>,
    modes: HashMap<String, Vec<ProviderId>>,
    default_mode: String,
}

impl ProviderRegistry {
    pub fn new(
        providers: Vec<ProviderConfig>,
        modes: Vec<CostMode>,
        default_mode: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = providers
            .into_iter()
            .map(|config| (config.id.clone(), ProviderEntry::new(config, now)))
            .collect();
        Self {
            entries: Mutex::new(entries),
            modes: modes.into_iter().map(|m| (m.name, m.providers)).collect(),
            default_mode: default_mode.into(),
        }
    }

    /// Cost of one provider per 1k tokens; used by metrics rollups.
    pub fn cost_of(&self, id: &ProviderId) -> Option<f64> {
        self.entries
            .lock()
            .expect("registry lock")
            .get(id)
            .map(|e| e.config.cost_per_1k_tokens)
    }

    /// Daily budget of one provider.
    pub fn budget_of(&self, id: &ProviderId) -> Option<u64> {
        self.entries
            .lock()
            .expect("registry lock")
            .get(id)
            .map(|e| e.config.daily_token_budget)
    }

    /// Select a provider for the given capabilities under a cost mode.
    /// Claims the half-open probe slot when it picks a half-open provider;
    /// callers that abandon the assignment must call `abort`.
    pub fn select(
        &self,
        required: &BTreeSet<String>,
        mode: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProviderId, RegistryError> {
        let mode_name = mode.unwrap_or(&self.default_mode);
        let Some(members) = self.modes.get(mode_name) else {
            warn!(mode = mode_name, "Unknown cost mode; no provider selected");
            return Err(RegistryError::NoProviderAvailable);
        };

        let mut entries = self.entries.lock().expect("registry lock");

        // Cheapest first within the mode's member set.
        let mut ordered: Vec<ProviderId> = members.clone();
        ordered.sort_by(|a, b| {
            let ca = entries.get(a).map(|e| e.config.cost_per_1k_tokens);
            let cb = entries.get(b).map(|e| e.config.cost_per_1k_tokens);
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });

        for id in ordered {
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            if !required.is_subset(&entry.config.capabilities) {
                continue;
            }
            if !entry.quota_remaining() {
                continue;
            }
            if entry.breaker.try_admit(now) {
                return Ok(id);
            }
        }
        Err(RegistryError::NoProviderAvailable)
    }

    /// Release a selection that never dispatched (frees a claimed probe).
    pub fn abort(&self, id: &ProviderId) {
        if let Some(entry) = self.entries.lock().expect("registry lock").get_mut(id) {
            entry.breaker.abort_probe();
        }
    }

    /// Record a successful call: consume quota, update latency, reset the
    /// failure window. Returns a breaker event when half-open closed.
    pub fn record_success(
        &self,
        id: &ProviderId,
        tokens_consumed: u64,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakerEvent>, RegistryError> {
        let mut entries = self.entries.lock().expect("registry lock");
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownProvider(id.clone()))?;
        entry.requests += 1;
        entry.tokens_consumed_today = entry.tokens_consumed_today.saturating_add(tokens_consumed);
        entry.ewma_latency_ms = if entry.ewma_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            LATENCY_ALPHA * latency_ms as f64 + (1.0 - LATENCY_ALPHA) * entry.ewma_latency_ms
        };
        let event = entry.breaker.on_success(now);
        if event.is_some() {
            info!(provider = %id, "Provider breaker closed");
        }
        Ok(event)
    }

    /// Record a failed call. Returns a breaker event when the failure
    /// tripped or reopened the breaker.
    pub fn record_failure(
        &self,
        id: &ProviderId,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakerEvent>, RegistryError> {
        let mut entries = self.entries.lock().expect("registry lock");
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownProvider(id.clone()))?;
        entry.requests += 1;
        entry.failures += 1;
        let event = entry.breaker.on_failure(now);
        if event == Some(BreakerEvent::Opened) {
            warn!(provider = %id, "Provider breaker opened");
        }
        Ok(event)
    }

    /// Advance time: cooldowns elapse and daily quotas reset at the UTC
    /// day boundary. Returns any breaker transitions.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<(ProviderId, BreakerEvent)> {
        let mut entries = self.entries.lock().expect("registry lock");
        let mut events = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if let Some(event) = entry.breaker.tick(now) {
                events.push((id.clone(), event));
            }
            if now.num_days_from_ce() > entry.last_reset.num_days_from_ce() {
                entry.tokens_consumed_today = 0;
                entry.last_reset = now;
                info!(provider = %id, "Daily token quota reset");
            }
        }
        events
    }

    /// Point-in-time status of every provider, sorted by id.
    pub fn status(&self) -> Vec<ProviderStatus> {
        let entries = self.entries.lock().expect("registry lock");
        let mut statuses: Vec<ProviderStatus> = entries.values().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Reinstall persisted provider state over the configured entries.
    /// Half-open breakers are reset to open pending a fresh cooldown.
    pub fn restore(&self, statuses: Vec<ProviderStatus>, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().expect("registry lock");
        for status in statuses {
            let Some(entry) = entries.get_mut(&status.id) else {
                warn!(provider = %status.id, "Persisted provider absent from configuration");
                continue;
            };
            entry.tokens_consumed_today = status.tokens_consumed_today;
            entry.requests = status.requests;
            entry.failures = status.failures;
            entry.ewma_latency_ms = status.ewma_latency_ms;
            entry.last_reset = status.last_reset;
            entry.breaker = CircuitBreaker::restore(
                entry.config.breaker,
                status.breaker,
                status.window_failures,
                status.opened_at,
                now,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_types::{BreakerPolicy, BreakerState, PriorityClass, ProviderKind};

    fn provider(id: &str, cost: f64, caps: &[&str]) -> ProviderConfig {
        ProviderConfig {
            id: ProviderId::new(id),
            kind: ProviderKind::OpenAi,
            endpoint: "http://localhost".to_string(),
            model: None,
            cost_per_1k_tokens: cost,
            daily_token_budget: 10_000,
            breaker: BreakerPolicy {
                consecutive_failures: 3,
                window_ms: 60_000,
                cooldown_ms: 10_000,
            },
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            class: PriorityClass::Balanced,
        }
    }

    fn registry(providers: Vec<ProviderConfig>) -> ProviderRegistry {
        let ids: Vec<ProviderId> = providers.iter().map(|p| p.id.clone()).collect();
        ProviderRegistry::new(
            providers,
            vec![CostMode {
                name: "balanced".to_string(),
                providers: ids,
            }],
            "balanced",
            Utc::now(),
        )
    }

    fn no_caps() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_select_cheapest_eligible() {
        let reg = registry(vec![
            provider("pricey", 10.0, &[]),
            provider("cheap", 1.0, &[]),
        ]);
        let picked = reg.select(&no_caps(), None, Utc::now()).unwrap();
        assert_eq!(picked, ProviderId::new("cheap"));
    }

    #[test]
    fn test_select_respects_capabilities() {
        let reg = registry(vec![
            provider("cheap", 1.0, &[]),
            provider("capable", 5.0, &["vision"]),
        ]);
        let required: BTreeSet<String> = ["vision".to_string()].into_iter().collect();
        let picked = reg.select(&required, None, Utc::now()).unwrap();
        assert_eq!(picked, ProviderId::new("capable"));
    }

    #[test]
    fn test_open_provider_never_selected() {
        let now = Utc::now();
        let reg = registry(vec![provider("only", 1.0, &[])]);
        let id = ProviderId::new("only");
        for _ in 0..3 {
            reg.record_failure(&id, now).unwrap();
        }
        assert_eq!(
            reg.select(&no_caps(), None, now).unwrap_err(),
            RegistryError::NoProviderAvailable
        );
    }

    #[test]
    fn test_breaker_full_cycle() {
        let now = Utc::now();
        let reg = registry(vec![provider("p", 1.0, &[])]);
        let id = ProviderId::new("p");

        // Trip it.
        assert_eq!(reg.record_failure(&id, now).unwrap(), None);
        assert_eq!(reg.record_failure(&id, now).unwrap(), None);
        assert_eq!(
            reg.record_failure(&id, now).unwrap(),
            Some(BreakerEvent::Opened)
        );

        // Cooldown elapses -> half-open, one probe only.
        let later = now + chrono::Duration::milliseconds(10_000);
        let events = reg.tick(later);
        assert_eq!(events, vec![(id.clone(), BreakerEvent::HalfOpened)]);
        assert_eq!(reg.select(&no_caps(), None, later).unwrap(), id);
        assert_eq!(
            reg.select(&no_caps(), None, later).unwrap_err(),
            RegistryError::NoProviderAvailable
        );

        // Probe success closes.
        assert_eq!(
            reg.record_success(&id, 100, 50, later).unwrap(),
            Some(BreakerEvent::Closed)
        );
        assert_eq!(reg.select(&no_caps(), None, later).unwrap(), id);
    }

    #[test]
    fn test_quota_exhaustion_excludes_provider() {
        let now = Utc::now();
        let reg = registry(vec![provider("p", 1.0, &[])]);
        let id = ProviderId::new("p");
        reg.record_success(&id, 10_000, 10, now).unwrap();
        assert_eq!(
            reg.select(&no_caps(), None, now).unwrap_err(),
            RegistryError::NoProviderAvailable
        );
    }

    #[test]
    fn test_daily_reset_restores_quota() {
        let now = Utc::now();
        let reg = registry(vec![provider("p", 1.0, &[])]);
        let id = ProviderId::new("p");
        reg.record_success(&id, 10_000, 10, now).unwrap();
        assert!(reg.select(&no_caps(), None, now).is_err());

        let tomorrow = now + chrono::Duration::days(1);
        reg.tick(tomorrow);
        assert_eq!(reg.select(&no_caps(), None, tomorrow).unwrap(), id);
    }

    #[test]
    fn test_unknown_mode_yields_no_provider() {
        let reg = registry(vec![provider("p", 1.0, &[])]);
        assert_eq!(
            reg.select(&no_caps(), Some("luxury"), Utc::now()).unwrap_err(),
            RegistryError::NoProviderAvailable
        );
    }

    #[test]
    fn test_restore_resets_half_open() {
        let now = Utc::now();
        let reg = registry(vec![provider("p", 1.0, &[])]);
        let id = ProviderId::new("p");
        for _ in 0..3 {
            reg.record_failure(&id, now).unwrap();
        }
        reg.tick(now + chrono::Duration::milliseconds(10_000));
        let statuses = reg.status();
        assert_eq!(statuses[0].breaker, BreakerState::HalfOpen);

        let fresh = registry(vec![provider("p", 1.0, &[])]);
        fresh.restore(statuses, now);
        assert_eq!(fresh.status()[0].breaker, BreakerState::Open);
    }
}
