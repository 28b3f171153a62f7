//! Seam between the runner and the external engine executable.

use std::{fmt, io, process::Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::ScanId;
use crate::config::EngineConfig;

/// Everything one engine run is started with. The engine reads its hosts
/// from the KB index; the index and scan id also go on the command line.
#[derive(Clone, Debug)]
pub struct EngineInvocation {
    pub scan_id: ScanId,
    pub index: usize,
    pub hosts: Vec<String>,
    pub ports: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineExit {
    Success,
    Failure(String),
}

#[async_trait]
pub trait EngineLauncher: Send + Sync + fmt::Debug {
    async fn launch(&self, invocation: &EngineInvocation) -> io::Result<Box<dyn EngineProcess>>;
}

/// A running engine. Liveness is polled, never awaited.
#[async_trait]
pub trait EngineProcess: Send + fmt::Debug {
    fn try_wait(&mut self) -> io::Result<Option<EngineExit>>;

    /// Kill the process and reap it.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Spawns the configured engine binary.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    path: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            path: config.path.clone(),
            args: config.args.clone(),
        }
    }

    fn render_args(&self, invocation: &EngineInvocation) -> Vec<String> {
        let index = invocation.index.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{index}", &index)
                    .replace("{scan_id}", invocation.scan_id.as_str())
            })
            .collect()
    }
}

#[async_trait]
impl EngineLauncher for CommandLauncher {
    async fn launch(&self, invocation: &EngineInvocation) -> io::Result<Box<dyn EngineProcess>> {
        let args = self.render_args(invocation);
        debug!(target: "scan::runner", path = %self.path, ?args, "Spawning engine");
        let child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Debug)]
struct ChildProcess {
    child: Child,
}

#[async_trait]
impl EngineProcess for ChildProcess {
    fn try_wait(&mut self) -> io::Result<Option<EngineExit>> {
        Ok(self.child.try_wait()?.map(|status| {
            if status.success() {
                EngineExit::Success
            } else {
                EngineExit::Failure(status.to_string())
            }
        }))
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.start_kill()?;
        }
        self.child.wait().await.map(drop)
    }
}
