//! Runtime Configuration
//!
//! Engine tunables come from environment variables with defaults; the
//! provider catalog and cost modes come from a YAML file. Everything is
//! readable at runtime through the engine handle.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskmesh_types::{CostMode, PriorityClass, ProviderConfig, ProviderId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {detail}")]
    InvalidValue { var: String, detail: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse providers file {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Duplicate provider id in providers file: {0}")]
    DuplicateProvider(ProviderId),

    #[error("Cost mode {mode} references unknown provider {provider}")]
    UnknownProviderInMode { mode: String, provider: ProviderId },
}

fn env_parse<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            detail: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// All engine tunables. Milliseconds throughout; zero disables an interval.
#[derive(Debug, Clone, Serialize)]
pub struct MeshConfig {
    pub data_dir: PathBuf,
    pub providers_file: Option<PathBuf>,
    /// Scheduler shards; tasks partition by id hash. Must be >= 1.
    pub shard_count: usize,
    pub retry_base_delay_ms: u64,
    pub max_payload_bytes: usize,
    /// Queue wait-bonus sweep cadence.
    pub rescore_interval_ms: u64,
    /// How many queue heads the sweep rescoring touches.
    pub rescore_top_k: usize,
    pub snapshot_interval_ms: u64,
    /// Per-subscriber event-bus buffer; past it, messages drop.
    pub bus_high_water: usize,
    pub heartbeat_timeout_ms: u64,
    /// Idle span after which worker load starts decaying.
    pub load_decay_after_ms: u64,
    /// Fraction of load retained per decay tick.
    pub load_decay_factor: f64,
    /// How long a cancelled dispatch may take to acknowledge.
    pub cancel_grace_ms: u64,
    /// Default dispatch deadline for tasks without one.
    pub dispatch_timeout_ms: u64,
    /// Scheduler housekeeping cadence (retries due, breaker ticks, decay).
    pub tick_interval_ms: u64,
    pub default_cost_mode: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meshdata"),
            providers_file: None,
            shard_count: 1,
            retry_base_delay_ms: 1_000,
            max_payload_bytes: 1024 * 1024,
            rescore_interval_ms: 1_000,
            rescore_top_k: 32,
            snapshot_interval_ms: 30_000,
            bus_high_water: 256,
            heartbeat_timeout_ms: 30_000,
            load_decay_after_ms: 60_000,
            load_decay_factor: 0.5,
            cancel_grace_ms: 5_000,
            dispatch_timeout_ms: 120_000,
            tick_interval_ms: 100,
            default_cost_mode: "balanced".to_string(),
        }
    }
}

impl MeshConfig {
    /// Build from `MESH_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            data_dir: env_parse("MESH_DATA_DIR", defaults.data_dir)?,
            providers_file: std::env::var("MESH_PROVIDERS_FILE").ok().map(PathBuf::from),
            shard_count: env_parse("MESH_SHARD_COUNT", defaults.shard_count)?,
            retry_base_delay_ms: env_parse("MESH_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            max_payload_bytes: env_parse("MESH_MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            rescore_interval_ms: env_parse("MESH_RESCORE_INTERVAL_MS", defaults.rescore_interval_ms)?,
            rescore_top_k: env_parse("MESH_RESCORE_TOP_K", defaults.rescore_top_k)?,
            snapshot_interval_ms: env_parse("MESH_SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval_ms)?,
            bus_high_water: env_parse("MESH_BUS_HIGH_WATER", defaults.bus_high_water)?,
            heartbeat_timeout_ms: env_parse("MESH_HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout_ms)?,
            load_decay_after_ms: env_parse("MESH_LOAD_DECAY_AFTER_MS", defaults.load_decay_after_ms)?,
            load_decay_factor: env_parse("MESH_LOAD_DECAY_FACTOR", defaults.load_decay_factor)?,
            cancel_grace_ms: env_parse("MESH_CANCEL_GRACE_MS", defaults.cancel_grace_ms)?,
            dispatch_timeout_ms: env_parse("MESH_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout_ms)?,
            tick_interval_ms: env_parse("MESH_TICK_INTERVAL_MS", defaults.tick_interval_ms)?,
            default_cost_mode: env_parse("MESH_DEFAULT_COST_MODE", defaults.default_cost_mode)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MESH_SHARD_COUNT".to_string(),
                detail: "must be at least 1".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.load_decay_factor) {
            return Err(ConfigError::InvalidValue {
                var: "MESH_LOAD_DECAY_FACTOR".to_string(),
                detail: "must be in [0, 1)".to_string(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MESH_TICK_INTERVAL_MS".to_string(),
                detail: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

/// The provider catalog plus named cost modes, as loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Named ordered provider sets. When empty, modes are derived from
    /// provider classes.
    #[serde(default)]
    pub modes: BTreeMap<String, Vec<ProviderId>>,
}

impl ProvidersFile {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.clone()) {
                return Err(ConfigError::DuplicateProvider(p.id.clone()));
            }
        }
        for (mode, members) in &self.modes {
            for provider in members {
                if !seen.contains(provider) {
                    return Err(ConfigError::UnknownProviderInMode {
                        mode: mode.clone(),
                        provider: provider.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Modes to run with: the configured ones, or class-derived defaults.
    ///
    /// Derived modes: `economy` is economy-class providers cheapest first,
    /// `balanced` is everything cheapest first, `premium` is premium and
    /// balanced classes most expensive first.
    pub fn effective_modes(&self) -> Vec<CostMode> {
        if !self.modes.is_empty() {
            return self
                .modes
                .iter()
                .map(|(name, providers)| CostMode {
                    name: name.clone(),
                    providers: providers.clone(),
                })
                .collect();
        }

        let mut by_cost: Vec<&ProviderConfig> = self.providers.iter().collect();
        by_cost.sort_by(|a, b| {
            a.cost_per_1k_tokens
                .partial_cmp(&b.cost_per_1k_tokens)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let economy = by_cost
            .iter()
            .filter(|p| p.class == PriorityClass::Economy)
            .map(|p| p.id.clone())
            .collect();
        let balanced = by_cost.iter().map(|p| p.id.clone()).collect();
        let premium = by_cost
            .iter()
            .rev()
            .filter(|p| matches!(p.class, PriorityClass::Premium | PriorityClass::Balanced))
            .map(|p| p.id.clone())
            .collect();

        vec![
            CostMode {
                name: "economy".to_string(),
                providers: economy,
            },
            CostMode {
                name: "balanced".to_string(),
                providers: balanced,
            },
            CostMode {
                name: "premium".to_string(),
                providers: premium,
            },
        ]
    }
}
