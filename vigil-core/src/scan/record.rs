use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ScanResult, ScanTarget, TargetError};
use crate::error::{Result, ScanError};

/// Opaque scan identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Init,
    Running,
    Stopped,
    Finished,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Init => "init",
            ScanStatus::Running => "running",
            ScanStatus::Stopped => "stopped",
            ScanStatus::Finished => "finished",
        }
    }

    /// Runner-side work may still be happening.
    pub fn is_active(&self) -> bool {
        matches!(self, ScanStatus::Init | ScanStatus::Running)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A start request as received from the control layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub scan_id: Option<String>,
    pub targets: Vec<ScanTarget>,
    /// Single-target form: hosts.
    pub target: Option<String>,
    /// Single-target form: ports.
    pub ports: Option<String>,
    pub scanner_params: HashMap<String, String>,
    pub vts: Vec<String>,
    pub parallel: Option<usize>,
}

impl ScanRequest {
    /// Target list, accepting the single-target form when no target blocks
    /// are present.
    pub fn resolved_targets(&self) -> Result<Vec<ScanTarget>> {
        if !self.targets.is_empty() {
            return Ok(self.targets.clone());
        }
        match &self.target {
            Some(hosts) if !hosts.trim().is_empty() => Ok(vec![ScanTarget::new(
                hosts.clone(),
                self.ports.clone().unwrap_or_default(),
            )]),
            _ => Err(ScanError::InvalidRequest("no scan targets given".into())),
        }
    }
}

/// Hosts handed to one engine worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostGroup {
    pub hosts: Vec<String>,
    pub ports: String,
}

#[derive(Clone, Debug)]
struct TargetEntry {
    spec: ScanTarget,
    hosts: Vec<String>,
}

/// Daemon-side bookkeeping for one scan.
#[derive(Debug)]
pub struct ScanRecord {
    id: ScanId,
    targets: Vec<TargetEntry>,
    scanner_params: HashMap<String, String>,
    vts: Vec<String>,
    parallel: usize,
    status: ScanStatus,
    start_time: i64,
    end_time: i64,
    results: VecDeque<ScanResult>,
    host_progress: HashMap<String, u8>,
    finished_hosts: BTreeSet<String>,
}

impl ScanRecord {
    /// New record in `Init`. Target hosts are expanded here, so a bad
    /// target never produces a record.
    pub fn new(
        id: ScanId,
        targets: Vec<ScanTarget>,
        scanner_params: HashMap<String, String>,
        vts: Vec<String>,
        parallel: usize,
        now: i64,
    ) -> std::result::Result<Self, TargetError> {
        let mut finished_hosts = BTreeSet::new();
        let mut entries = Vec::with_capacity(targets.len());
        for spec in targets {
            let hosts = spec.expanded_hosts()?;
            finished_hosts.extend(spec.expanded_finished_hosts()?);
            entries.push(TargetEntry { spec, hosts });
        }

        Ok(Self {
            id,
            targets: entries,
            scanner_params,
            vts,
            parallel: parallel.max(1),
            status: ScanStatus::Init,
            start_time: now,
            end_time: 0,
            results: VecDeque::new(),
            host_progress: HashMap::new(),
            finished_hosts,
        })
    }

    pub fn id(&self) -> &ScanId {
        &self.id
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// 0 while the scan is `Init` or `Running`.
    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    pub fn scanner_params(&self) -> &HashMap<String, String> {
        &self.scanner_params
    }

    pub fn vts(&self) -> &[String] {
        &self.vts
    }

    pub fn mark_running(&mut self) {
        if self.status == ScanStatus::Init {
            self.status = ScanStatus::Running;
        }
    }

    /// Returns whether the scan was active and is now stopped.
    pub fn stop(&mut self, now: i64) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.status = ScanStatus::Stopped;
        self.end_time = now.max(1);
        true
    }

    /// Terminal success. A stopped scan stays stopped.
    pub fn finish(&mut self, now: i64) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.status = ScanStatus::Finished;
        self.end_time = now.max(1);
        true
    }

    /// `Stopped` back to `Running`. Results, progress and finished hosts
    /// are kept.
    pub fn resume(&mut self) -> Result<()> {
        match self.status {
            ScanStatus::Stopped => {
                self.status = ScanStatus::Running;
                self.end_time = 0;
                Ok(())
            }
            ScanStatus::Finished => Err(ScanError::InvalidRequest(format!(
                "scan {} already finished",
                self.id
            ))),
            ScanStatus::Init | ScanStatus::Running => Err(ScanError::InvalidRequest(format!(
                "scan {} is already running",
                self.id
            ))),
        }
    }

    pub fn set_host_progress(&mut self, host: &str, value: i64) {
        self.host_progress
            .insert(host.to_string(), value.clamp(0, 100) as u8);
    }

    pub fn host_progress(&self, host: &str) -> Option<u8> {
        self.host_progress.get(host).copied()
    }

    /// Rounded mean over tracked hosts; 0 when nothing is tracked.
    pub fn overall_progress(&self) -> u8 {
        if self.host_progress.is_empty() {
            return 0;
        }
        let sum: u32 = self.host_progress.values().map(|v| u32::from(*v)).sum();
        (f64::from(sum) / self.host_progress.len() as f64).round() as u8
    }

    pub fn mark_host_finished(&mut self, host: &str) {
        self.finished_hosts.insert(host.to_string());
    }

    pub fn finished_hosts(&self) -> Vec<String> {
        self.finished_hosts.iter().cloned().collect()
    }

    /// Target hosts in target order, minus finished ones.
    pub fn unfinished_hosts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.targets
            .iter()
            .flat_map(|t| t.hosts.iter())
            .filter(|h| !self.finished_hosts.contains(*h) && seen.insert(h.as_str()))
            .cloned()
            .collect()
    }

    /// One group per target that still has unfinished hosts.
    pub fn host_groups(&self) -> Vec<HostGroup> {
        self.targets
            .iter()
            .filter_map(|t| {
                let hosts: Vec<String> = t
                    .hosts
                    .iter()
                    .filter(|h| !self.finished_hosts.contains(*h))
                    .cloned()
                    .collect();
                (!hosts.is_empty()).then(|| HostGroup {
                    hosts,
                    ports: t.spec.ports.clone(),
                })
            })
            .collect()
    }

    /// Comma join of each target's host specification.
    pub fn target_string(&self) -> String {
        self.targets
            .iter()
            .map(|t| t.spec.hosts.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The target whose host specification is exactly `hosts`.
    pub fn target(&self, hosts: &str) -> Option<&ScanTarget> {
        self.targets
            .iter()
            .map(|t| &t.spec)
            .find(|spec| spec.hosts == hosts)
    }

    pub fn append_result(&mut self, result: ScanResult) {
        self.results.push_back(result);
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Up to `max` oldest results. A destructive drain removes what it
    /// returns.
    pub fn drain_results(&mut self, max: Option<usize>, destructive: bool) -> Vec<ScanResult> {
        let n = max.unwrap_or(usize::MAX).min(self.results.len());
        if destructive {
            self.results.drain(..n).collect()
        } else {
            self.results.iter().take(n).cloned().collect()
        }
    }
}
