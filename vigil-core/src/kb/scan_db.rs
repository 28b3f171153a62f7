use tracing::warn;

use super::{KbConnector, KbContext, KbResult};

const RESULTS: &str = "internal/results";
const STATUS: &str = "status";
const SCAN_ID: &str = "internal/scanid";
const HOSTS: &str = "internal/hosts";
const PORTS: &str = "internal/ports";
const HOST_PROGRESS: &str = "internal/host_progress";
const FINISHED_HOSTS: &str = "internal/finished_hosts";
const START_TIME: &str = "internal/start_time";
const END_TIME: &str = "internal/end_time";
const HOST_IP: &str = "internal/ip";

/// Separator between host and value in progress entries.
const PROGRESS_SEPARATOR: &str = "|||";

/// Status written before the engine starts; anything else is its handshake.
pub const STATUS_NEW: &str = "new";
/// Status asking the engine to wind down.
pub const STATUS_STOP_ALL: &str = "stop_all";

/// Scan-scoped view of one claimed KB index.
///
/// The engine pushes to the head of its lists, so popping from the tail
/// drains entries in the order they were written.
#[derive(Debug)]
pub struct ScanDb {
    ctx: KbContext,
}

impl ScanDb {
    pub fn new(ctx: KbContext) -> Self {
        Self { ctx }
    }

    pub fn index(&self) -> usize {
        self.ctx.index()
    }

    /// Raw client access for callers that need more than the scan view.
    pub fn context(&mut self) -> &mut KbContext {
        &mut self.ctx
    }

    /// Rebinds to another index on the same connection.
    pub async fn select(&mut self, index: usize) -> KbResult<&mut Self> {
        self.ctx.select_database(index).await?;
        Ok(self)
    }

    /// Pops the oldest unread engine result. Destructive.
    pub async fn get_result(&mut self) -> KbResult<Option<String>> {
        self.ctx.pop_last(RESULTS).await
    }

    pub async fn get_status(&mut self, name: &str) -> KbResult<Option<String>> {
        self.ctx.read_single(&format!("internal/{name}")).await
    }

    pub async fn get_start_time(&mut self) -> KbResult<Option<String>> {
        self.ctx.read_at(START_TIME, -1).await
    }

    pub async fn get_end_time(&mut self) -> KbResult<Option<String>> {
        self.ctx.read_at(END_TIME, -1).await
    }

    pub async fn get_host_ip(&mut self) -> KbResult<Option<String>> {
        self.ctx.read_single(HOST_IP).await
    }

    /// Seeds the index for a fresh engine run. The status goes last so the
    /// engine never sees `new` before its inputs are in place.
    pub async fn prepare(&mut self, scan_id: &str, hosts: &[String], ports: &str) -> KbResult<()> {
        self.ctx.set_single(SCAN_ID, scan_id).await?;
        if !hosts.is_empty() {
            self.ctx.overwrite(HOSTS, hosts).await?;
        }
        self.ctx.set_single(PORTS, ports).await?;
        self.ctx.set_single(&format!("internal/{STATUS}"), STATUS_NEW).await
    }

    pub async fn request_stop(&mut self) -> KbResult<()> {
        self.ctx
            .set_single(&format!("internal/{STATUS}"), STATUS_STOP_ALL)
            .await
    }

    /// Engine status, `None` until the index has been prepared.
    pub async fn engine_status(&mut self) -> KbResult<Option<String>> {
        self.get_status(STATUS).await
    }

    /// Pops the oldest pending `host|||percent` entry. Malformed entries
    /// are dropped with a warning.
    pub async fn next_host_progress(&mut self) -> KbResult<Option<(String, i64)>> {
        while let Some(entry) = self.ctx.pop_last(HOST_PROGRESS).await? {
            match parse_progress(&entry) {
                Some(progress) => return Ok(Some(progress)),
                None => warn!(
                    target: "scan::runner",
                    index = self.index(),
                    entry = %entry,
                    "Ignoring malformed host progress entry"
                ),
            }
        }
        Ok(None)
    }

    pub async fn next_finished_host(&mut self) -> KbResult<Option<String>> {
        self.ctx.pop_last(FINISHED_HOSTS).await
    }

    /// Replaces a connection the store dropped, staying on the same index.
    pub async fn reconnect(&mut self, connector: &dyn KbConnector) -> KbResult<()> {
        let index = self.index();
        let mut ctx = connector.connect().await?;
        ctx.select_database(index).await?;
        self.ctx = ctx;
        Ok(())
    }

    /// Removes everything the engine left in this index.
    pub async fn flush(&mut self) -> KbResult<()> {
        self.ctx.flush_database().await
    }
}

fn parse_progress(entry: &str) -> Option<(String, i64)> {
    let (host, value) = entry.split_once(PROGRESS_SEPARATOR)?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), value.trim().parse().ok()?))
}
