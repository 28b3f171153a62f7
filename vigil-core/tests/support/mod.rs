#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use vigil_core::{
    Daemon, GetScansQuery, ScanSnapshot,
    config::{DaemonConfig, EngineConfig, RunnerConfig},
    kb::{KbConnector, KbContext, KbResult, MemoryConnector, MemoryKb, RetryPolicy},
    scan::{EngineExit, EngineInvocation, EngineLauncher, EngineProcess, ScanId, ScanStatus},
};

/// How the simulated engine treats a host group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Reports every host and exits cleanly.
    Complete,
    /// Acknowledges, reports 50% and runs until told to stop.
    Hang,
    /// Reports one result and exits with a failure status.
    Crash,
    /// Never acknowledges its index.
    Silent,
    /// Acknowledges, reports 50% and ignores stop requests until killed.
    Stubborn,
}

#[derive(Debug, Default)]
struct Script {
    hang: HashSet<String>,
    crash: HashSet<String>,
    silent: HashSet<String>,
    stubborn: HashSet<String>,
    results_per_host: usize,
    launches: Vec<Vec<String>>,
    /// Engine processes the daemon currently holds, per host.
    live: HashMap<String, usize>,
    overlaps: usize,
}

/// Counts a process as live for its hosts until dropped or killed.
#[derive(Debug)]
struct LiveHosts {
    script: Arc<Mutex<Script>>,
    hosts: Vec<String>,
}

impl LiveHosts {
    fn register(script: &Arc<Mutex<Script>>, hosts: &[String]) -> Self {
        let mut guard = script.lock().unwrap();
        let guard = &mut *guard;
        for host in hosts {
            let live = guard.live.entry(host.clone()).or_default();
            if *live > 0 {
                guard.overlaps += 1;
            }
            *live += 1;
        }
        Self {
            script: Arc::clone(script),
            hosts: hosts.to_vec(),
        }
    }
}

impl Drop for LiveHosts {
    fn drop(&mut self) {
        let mut guard = self.script.lock().unwrap();
        for host in &self.hosts {
            if let Some(live) = guard.live.get_mut(host) {
                *live -= 1;
            }
        }
    }
}

/// Engine stand-in that runs as a task and talks to the daemon only
/// through the shared in-memory KB.
#[derive(Clone, Debug)]
pub struct SimulatedEngine {
    kb: MemoryKb,
    script: Arc<Mutex<Script>>,
}

impl SimulatedEngine {
    pub fn new(kb: MemoryKb) -> Self {
        Self {
            kb,
            script: Arc::new(Mutex::new(Script {
                results_per_host: 1,
                ..Script::default()
            })),
        }
    }

    pub fn set_behavior(&self, host: &str, behavior: Behavior) {
        let mut script = self.script.lock().unwrap();
        script.hang.remove(host);
        script.crash.remove(host);
        script.silent.remove(host);
        script.stubborn.remove(host);
        match behavior {
            Behavior::Complete => {}
            Behavior::Hang => {
                script.hang.insert(host.to_string());
            }
            Behavior::Crash => {
                script.crash.insert(host.to_string());
            }
            Behavior::Silent => {
                script.silent.insert(host.to_string());
            }
            Behavior::Stubborn => {
                script.stubborn.insert(host.to_string());
            }
        }
    }

    pub fn set_results_per_host(&self, n: usize) {
        self.script.lock().unwrap().results_per_host = n;
    }

    /// Host groups in launch order.
    pub fn launches(&self) -> Vec<Vec<String>> {
        self.script.lock().unwrap().launches.clone()
    }

    /// Launches that started while another engine was still held for one
    /// of their hosts.
    pub fn overlapping_launches(&self) -> usize {
        self.script.lock().unwrap().overlaps
    }

    fn behavior_for(&self, hosts: &[String]) -> Behavior {
        let script = self.script.lock().unwrap();
        if hosts.iter().any(|h| script.silent.contains(h)) {
            Behavior::Silent
        } else if hosts.iter().any(|h| script.crash.contains(h)) {
            Behavior::Crash
        } else if hosts.iter().any(|h| script.stubborn.contains(h)) {
            Behavior::Stubborn
        } else if hosts.iter().any(|h| script.hang.contains(h)) {
            Behavior::Hang
        } else {
            Behavior::Complete
        }
    }
}

#[async_trait]
impl EngineLauncher for SimulatedEngine {
    async fn launch(&self, invocation: &EngineInvocation) -> io::Result<Box<dyn EngineProcess>> {
        let behavior = self.behavior_for(&invocation.hosts);
        let results_per_host = {
            let mut script = self.script.lock().unwrap();
            script.launches.push(invocation.hosts.clone());
            script.results_per_host
        };

        let live = LiveHosts::register(&self.script, &invocation.hosts);
        let mut ctx = self.kb.context();
        let index = invocation.index;
        let handle = tokio::spawn(async move {
            if ctx.select_database(index).await.is_err() {
                return EngineExit::Failure("bad index".into());
            }
            run(ctx, behavior, results_per_host)
                .await
                .unwrap_or_else(|err| EngineExit::Failure(err.to_string()))
        });
        Ok(Box::new(SimulatedProcess {
            handle,
            exit: None,
            live: Some(live),
        }))
    }
}

async fn run(mut ctx: KbContext, behavior: Behavior, results_per_host: usize) -> KbResult<EngineExit> {
    if behavior == Behavior::Silent {
        std::future::pending::<()>().await;
    }

    let hosts = ctx.list_items("internal/hosts").await?;
    ctx.set_single("internal/status", "ready").await?;
    ctx.prepend_item("internal/start_time", "1700000000").await?;

    match behavior {
        Behavior::Complete => {
            for host in &hosts {
                for n in 0..results_per_host {
                    let entry = format!(
                        r#"{{"type":"log","host":"{host}","name":"check","value":"result {n}"}}"#
                    );
                    ctx.prepend_item("internal/results", &entry).await?;
                }
                ctx.prepend_item("internal/host_progress", &format!("{host}|||100"))
                    .await?;
                ctx.prepend_item("internal/finished_hosts", host).await?;
            }
            ctx.set_single("internal/status", "finished").await?;
            Ok(EngineExit::Success)
        }
        Behavior::Stubborn => {
            for host in &hosts {
                ctx.prepend_item("internal/host_progress", &format!("{host}|||50"))
                    .await?;
            }
            std::future::pending().await
        }
        Behavior::Hang => {
            for host in &hosts {
                ctx.prepend_item("internal/host_progress", &format!("{host}|||50"))
                    .await?;
            }
            loop {
                if ctx.read_single("internal/status").await?.as_deref() == Some("stop_all") {
                    return Ok(EngineExit::Success);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Behavior::Crash => {
            let host = hosts.first().cloned().unwrap_or_default();
            let entry = format!(r#"{{"type":"alarm","host":"{host}","name":"partial","value":"before crash"}}"#);
            ctx.prepend_item("internal/results", &entry).await?;
            Ok(EngineExit::Failure("signal: 11".into()))
        }
        Behavior::Silent => unreachable!(),
    }
}

#[derive(Debug)]
struct SimulatedProcess {
    handle: JoinHandle<EngineExit>,
    exit: Option<EngineExit>,
    live: Option<LiveHosts>,
}

#[async_trait]
impl EngineProcess for SimulatedProcess {
    fn try_wait(&mut self) -> io::Result<Option<EngineExit>> {
        if self.exit.is_none() && self.handle.is_finished() {
            self.exit = match (&mut self.handle).now_or_never() {
                Some(Ok(exit)) => Some(exit),
                Some(Err(err)) => Some(EngineExit::Failure(err.to_string())),
                None => None,
            };
        }
        Ok(self.exit.clone())
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.handle.abort();
        self.live = None;
        if self.exit.is_none() {
            self.exit = Some(EngineExit::Failure("killed".into()));
        }
        Ok(())
    }
}

pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        engine: EngineConfig {
            handshake_timeout_ms: 300,
            stop_grace_ms: 300,
            ..EngineConfig::default()
        },
        runner: RunnerConfig {
            default_parallel: 2,
            max_parallel: 4,
            poll_interval_ms: 5,
            pool_retry_interval_ms: 10,
        },
        ..DaemonConfig::default()
    }
}

pub fn connector(kb: &MemoryKb) -> Arc<dyn KbConnector> {
    Arc::new(MemoryConnector::new(
        kb.clone(),
        RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        },
    ))
}

/// Connector whose every connection attempt takes `delay`.
#[derive(Debug)]
pub struct SlowConnector {
    inner: MemoryConnector,
    delay: Duration,
}

#[async_trait]
impl KbConnector for SlowConnector {
    async fn connect(&self) -> KbResult<KbContext> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect().await
    }
}

pub fn slow_connector(kb: &MemoryKb, delay: Duration) -> Arc<dyn KbConnector> {
    Arc::new(SlowConnector {
        inner: MemoryConnector::new(
            kb.clone(),
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
        ),
        delay,
    })
}

pub async fn daemon_with(kb: &MemoryKb, engine: &SimulatedEngine) -> Daemon {
    Daemon::new(test_config(), connector(kb), Arc::new(engine.clone()))
        .await
        .expect("daemon starts")
}

pub async fn snapshot(daemon: &Daemon, id: &ScanId) -> ScanSnapshot {
    daemon
        .get_scans(GetScansQuery {
            scan_id: Some(id.clone()),
            details: false,
            ..GetScansQuery::default()
        })
        .await
        .expect("scan exists")
        .remove(0)
}

/// Polls until `check` holds, failing the test after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

pub async fn wait_for_status(daemon: &Daemon, id: &ScanId, status: ScanStatus) -> ScanSnapshot {
    wait_until(move || async move { snapshot(daemon, id).await.status == status }).await;
    snapshot(daemon, id).await
}

/// Whether any KB index is still claimed in the registry.
pub async fn registry_in_use(kb: &MemoryKb) -> bool {
    let mut ctx = kb.context();
    ctx.count_keys_matching("kb.__global_db_index").await.unwrap() > 0
}

/// Keys left behind in a KB index.
pub async fn keys_in(kb: &MemoryKb, index: usize) -> usize {
    let mut ctx = kb.context();
    ctx.select_database(index).await.unwrap();
    ctx.count_keys().await.unwrap()
}
