use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("runner.default_parallel ({default}) exceeds runner.max_parallel ({max})")]
    ParallelismInverted { default: usize, max: usize },
    #[error("engine.path is empty")]
    MissingEnginePath,
    #[error("kb.address is empty")]
    MissingKbAddress,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Rejects settings the daemon cannot run with and flags the merely odd.
pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let daemon = &config.daemon;

    if daemon.kb.address.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingKbAddress);
    }
    if daemon.engine.path.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingEnginePath);
    }
    if daemon.kb.connect_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: "kb.connect_attempts",
        });
    }
    if daemon.runner.max_parallel == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: "runner.max_parallel",
        });
    }
    if daemon.runner.poll_interval_ms == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: "runner.poll_interval_ms",
        });
    }
    if daemon.reaper.interval_secs == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: "reaper.interval_secs",
        });
    }
    if daemon.runner.default_parallel > daemon.runner.max_parallel {
        return Err(ConfigGuardRailError::ParallelismInverted {
            default: daemon.runner.default_parallel,
            max: daemon.runner.max_parallel,
        });
    }

    if !daemon.kb.occupancy_pattern.contains('*') {
        warnings.push_with_hint(
            format!(
                "kb.occupancy_pattern `{}` has no wildcard; only an exact key marks an index occupied",
                daemon.kb.occupancy_pattern
            ),
            "The engine writes keys under internal/, so `internal/*` is usually what you want",
        );
    }

    if !daemon
        .engine
        .args
        .iter()
        .any(|arg| arg.contains("{index}") || arg.contains("{scan_id}"))
    {
        warnings.push_with_hint(
            "engine.args never mention {index} or {scan_id}",
            "The engine cannot locate its KB index unless it is told the scan id or the index",
        );
    }

    if daemon.engine.handshake_timeout_ms < daemon.runner.poll_interval_ms {
        warnings.push(
            "engine.handshake_timeout_ms is shorter than runner.poll_interval_ms; every handshake may time out",
        );
    }

    if daemon.reaper.retention_secs == 0 {
        warnings.push_with_hint(
            "reaper.retention_secs is 0; finished scans are dropped on the next sweep",
            "Clients polling for results may miss them",
        );
    }

    Ok(warnings)
}
