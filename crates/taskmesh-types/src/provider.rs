//! Provider Types
//!
//! External LLM endpoint identity: cost model, daily quota, circuit-breaker
//! policy and state, and the named cost modes the scheduler selects under.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which client implementation talks to this provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    /// Any endpoint speaking the OpenAI chat-completions dialect.
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

/// Pricing tier of a provider. Cost modes are built from class sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Economy,
    Balanced,
    Premium,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Balanced => "balanced",
            Self::Premium => "premium",
        }
    }
}

impl std::str::FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "economy" => Ok(Self::Economy),
            "balanced" => Ok(Self::Balanced),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown priority class: {}", s)),
        }
    }
}

/// Circuit-breaker state machine position.
///
/// `closed` routes traffic, `open` routes nothing, `half-open` admits a
/// single probe request at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-provider breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Consecutive failures within the window that trip the breaker.
    pub consecutive_failures: u32,
    /// Rolling window the failure count is evaluated over, in milliseconds.
    pub window_ms: u64,
    /// Cooldown before an open breaker admits a probe, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Static configuration for one provider, as loaded from the providers file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub kind: ProviderKind,
    /// Endpoint descriptor (base URL for HTTP providers).
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Cost per 1000 tokens, in account currency units.
    pub cost_per_1k_tokens: f64,
    pub daily_token_budget: u64,
    #[serde(default)]
    pub breaker: BreakerPolicy,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub class: PriorityClass,
}

/// A named, ordered preference set over providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMode {
    pub name: String,
    /// Provider ids in preference order. Selection walks this order after
    /// sorting eligible entries by cost.
    pub providers: Vec<ProviderId>,
}

/// Point-in-time provider state, as published to metrics and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub breaker: BreakerState,
    pub tokens_consumed_today: u64,
    pub requests: u64,
    pub failures: u64,
    /// Failure timestamps still inside the rolling window.
    pub window_failures: Vec<DateTime<Utc>>,
    pub ewma_latency_ms: f64,
    pub last_reset: DateTime<Utc>,
    /// When the breaker last opened (drives the cooldown clock).
    pub opened_at: Option<DateTime<Utc>>,
}
