use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hash key holding one field per claimed KB index.
pub const DEFAULT_REGISTRY_KEY: &str = "kb.__global_db_index";

/// Keys an engine writes into its index; any match marks the index occupied.
pub const DEFAULT_OCCUPANCY_PATTERN: &str = "internal/*";

/// Every knob the daemon core reads. Built once at startup and handed to the
/// components by reference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub kb: KbConfig,
    pub engine: EngineConfig,
    pub runner: RunnerConfig,
    pub reaper: ReaperConfig,
}

/// Where the KB store lives and how hard we try to reach it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379` or
    /// `unix:///run/redis/redis.sock`.
    pub address: String,
    /// Connection attempts before giving up for good.
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts (ms).
    pub retry_delay_ms: u64,
    /// Hash key of the index allocation registry in database 0.
    pub registry_key: String,
    /// Glob matched in a candidate index to detect leftover content.
    pub occupancy_pattern: String,
}

impl KbConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            address: "unix:///run/redis/redis.sock".to_string(),
            connect_attempts: 5,
            retry_delay_ms: 1_000,
            registry_key: DEFAULT_REGISTRY_KEY.to_string(),
            occupancy_pattern: DEFAULT_OCCUPANCY_PATTERN.to_string(),
        }
    }
}

/// How the external engine binary is invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub path: String,
    /// Argument template. `{index}` and `{scan_id}` are substituted per worker.
    pub args: Vec<String>,
    /// How long a fresh engine may take to acknowledge its index (ms).
    pub handshake_timeout_ms: u64,
    /// Grace period between the stop marker and a hard kill (ms).
    pub stop_grace_ms: u64,
}

impl EngineConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: "openvas".to_string(),
            args: vec!["--scan-start".to_string(), "{scan_id}".to_string()],
            handshake_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
        }
    }
}

/// Worker pool tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Parallelism used when a start request does not carry one.
    pub default_parallel: usize,
    /// Upper bound applied to any requested parallelism.
    pub max_parallel: usize,
    /// Cadence of liveness polls and KB drains (ms).
    pub poll_interval_ms: u64,
    /// Back-off before retrying an exhausted index pool (ms).
    pub pool_retry_interval_ms: u64,
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pool_retry_interval(&self) -> Duration {
        Duration::from_millis(self.pool_retry_interval_ms)
    }

    /// Requested parallelism clamped into `1..=max_parallel`.
    pub fn effective_parallel(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_parallel)
            .clamp(1, self.max_parallel.max(1))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_parallel: 1,
            max_parallel: 16,
            poll_interval_ms: 500,
            pool_retry_interval_ms: 2_000,
        }
    }
}

/// Retention sweep for finished scans.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How long a finished scan stays queryable (seconds).
    pub retention_secs: u64,
    /// Sweep cadence (seconds).
    pub interval_secs: u64,
}

impl ReaperConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            interval_secs: 60,
        }
    }
}
