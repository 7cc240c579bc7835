//! Engine configuration.
//!
//! Values come from, in increasing priority:
//! 1. Built-in defaults
//! 2. An optional YAML/TOML/JSON file
//! 3. `REBAC__<SECTION>__<KEY>` environment variables

use crate::{
    check::TraversalLimits,
    consistency::{ConsistencyLevel, StorageConsistency},
    error::RebacError,
    models::DEFAULT_ZONE,
};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Zone used when a request names none.
    pub default_zone: String,
    pub traversal: TraversalConfig,
    pub cache: CacheConfig,
    pub consistency: ConsistencyConfig,
    /// Emit per-stage spans and metrics for checks.
    pub tracing_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_zone: DEFAULT_ZONE.to_string(),
            traversal: TraversalConfig::default(),
            cache: CacheConfig::default(),
            consistency: ConsistencyConfig::default(),
            tracing_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_depth: u32,
    pub max_visited_nodes: usize,
    pub timeout_ms: u64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_visited_nodes: 10_000,
            timeout_ms: 1_000,
        }
    }
}

impl TraversalConfig {
    pub fn limits(&self) -> TraversalLimits {
        TraversalLimits {
            max_depth: self.max_depth,
            max_visited_nodes: self.max_visited_nodes,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub l1_capacity: usize,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    /// Consecutive L2 failures before the breaker opens.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_capacity: 10_000,
            l1_ttl_secs: 300,
            l2_ttl_secs: 300,
            failure_threshold: 5,
            cooldown_secs: 30,
            key_prefix: "rebac".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Level applied to checks that don't ask for one.
    pub default_level: ConsistencyLevel,
    pub wait_timeout_ms: u64,
    /// Overrides the mode reported by the repository.
    pub storage_mode: Option<StorageConsistency>,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            default_level: ConsistencyLevel::CloseToOpen,
            wait_timeout_ms: 5_000,
            storage_mode: None,
        }
    }
}

impl ConsistencyConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus `REBAC__*` environment
    /// variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self, RebacError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "loading engine config file");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("REBAC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RebacError> {
        if self.default_zone.trim().is_empty() {
            return Err(RebacError::ValidationError("default_zone must not be empty".to_string()));
        }
        if self.traversal.max_depth == 0 {
            return Err(RebacError::ValidationError("traversal.max_depth must be > 0".to_string()));
        }
        if self.traversal.max_visited_nodes == 0 {
            return Err(RebacError::ValidationError(
                "traversal.max_visited_nodes must be > 0".to_string(),
            ));
        }
        if self.traversal.timeout_ms == 0 {
            return Err(RebacError::ValidationError("traversal.timeout_ms must be > 0".to_string()));
        }
        if self.consistency.wait_timeout_ms == 0 {
            return Err(RebacError::ValidationError(
                "consistency.wait_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.cache.enabled {
            if self.cache.l1_capacity == 0 {
                return Err(RebacError::ValidationError("cache.l1_capacity must be > 0".to_string()));
            }
            if self.cache.failure_threshold == 0 {
                return Err(RebacError::ValidationError(
                    "cache.failure_threshold must be > 0".to_string(),
                ));
            }
            if self.cache.key_prefix.is_empty() {
                return Err(RebacError::ValidationError("cache.key_prefix must not be empty".to_string()));
            }
        }
        Ok(())
    }
}
