use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vigil_core::config::{EngineConfig, KbConfig, ReaperConfig, RunnerConfig};

/// Raw configuration as defined in a TOML file. Missing sections take the
/// daemon defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub kb: KbConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub kb_address: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub engine_path: Option<String>,
    pub max_parallel: Option<usize>,
    pub scan_retention_secs: Option<u64>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds from an arbitrary variable source. Unparseable numbers are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            config_path: non_empty("VIGIL_CONFIG").map(PathBuf::from),
            kb_address: non_empty("VIGIL_KB_ADDRESS"),
            server_host: non_empty("VIGIL_SERVER_HOST"),
            server_port: non_empty("VIGIL_SERVER_PORT").and_then(|s| s.trim().parse().ok()),
            engine_path: non_empty("VIGIL_ENGINE_PATH"),
            max_parallel: non_empty("VIGIL_MAX_PARALLEL").and_then(|s| s.trim().parse().ok()),
            scan_retention_secs: non_empty("VIGIL_SCAN_RETENTION_SECS")
                .and_then(|s| s.trim().parse().ok()),
        }
    }
}
