use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SluiceError, SluiceResult};

/// Top-level router configuration (`sluice.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub plan_cache: PlanCacheConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub consolidator: ConsolidatorConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Plan cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    /// Number of plans kept before LRU eviction (default: 5000).
    pub capacity: usize,
    /// Upper bound for `capacity` (default: 50_000).
    pub max_capacity: usize,
    /// Cache keys longer than this are never cached (default: 16 KiB).
    pub max_key_bytes: usize,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 5000,
            max_capacity: 50_000,
            max_key_bytes: 16 * 1024,
        }
    }
}

impl PlanCacheConfig {
    /// Capacity actually used by the cache.
    pub fn effective_capacity(&self) -> usize {
        self.capacity.min(self.max_capacity)
    }
}

/// Per-statement execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Hard cap on rows held in memory by one primitive (default: 300_000).
    pub max_memory_rows: usize,
    /// Log a warning once a result reaches this many rows (0 = off).
    pub warn_memory_rows: usize,
    /// Max shard sub-queries in flight for one fan-out (default: 16).
    pub max_parallelism: usize,
    /// Statement deadline in milliseconds (0 = no timeout).
    pub query_timeout_ms: u64,
    /// Batches buffered per shard stream before the producer blocks.
    pub stream_buffer_batches: usize,
    /// Rows per streamed batch.
    pub stream_batch_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_memory_rows: 300_000,
            warn_memory_rows: 0,
            max_parallelism: 16,
            query_timeout_ms: 0,
            stream_buffer_batches: 4,
            stream_batch_rows: 1024,
        }
    }
}

/// Read-query consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub enabled: bool,
    /// How long a follower waits for the leader before giving up.
    pub wait_timeout_ms: u64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Wait up to this long for target shards to report serving (0 = don't wait).
    pub wait_for_serving_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            wait_for_serving_ms: 0,
            poll_interval_ms: 10,
        }
    }
}

impl RouterConfig {
    pub fn from_toml_str(s: &str) -> SluiceResult<Self> {
        let cfg: RouterConfig =
            toml::from_str(s).map_err(|e| SluiceError::Config(format!("invalid config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> SluiceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            SluiceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let cfg = Self::from_toml_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn validate(&self) -> SluiceResult<()> {
        if self.plan_cache.capacity == 0 {
            return Err(SluiceError::Config(
                "plan_cache.capacity must be > 0".into(),
            ));
        }
        if self.plan_cache.capacity > self.plan_cache.max_capacity {
            return Err(SluiceError::Config(format!(
                "plan_cache.capacity ({}) exceeds plan_cache.max_capacity ({})",
                self.plan_cache.capacity, self.plan_cache.max_capacity
            )));
        }
        if self.execution.max_parallelism == 0 {
            return Err(SluiceError::Config(
                "execution.max_parallelism must be > 0".into(),
            ));
        }
        if self.execution.stream_batch_rows == 0 {
            return Err(SluiceError::Config(
                "execution.stream_batch_rows must be > 0".into(),
            ));
        }
        if self.health.wait_for_serving_ms > 0 && self.health.poll_interval_ms == 0 {
            return Err(SluiceError::Config(
                "health.poll_interval_ms must be > 0 when wait_for_serving_ms is set".into(),
            ));
        }
        if self.execution.warn_memory_rows > self.execution.max_memory_rows {
            tracing::warn!(
                warn = self.execution.warn_memory_rows,
                max = self.execution.max_memory_rows,
                "execution.warn_memory_rows is above max_memory_rows and will never fire"
            );
        }
        Ok(())
    }
}
