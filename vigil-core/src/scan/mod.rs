//! Scan lifecycle: records, targets, results, engine workers and the reaper.

pub mod collection;
pub mod engine;
pub mod reaper;
pub mod record;
pub mod result;
pub mod runner;
pub mod target;

pub use collection::{ScanCollection, SharedRecord, StartKind};
pub use engine::{CommandLauncher, EngineExit, EngineInvocation, EngineLauncher, EngineProcess};
pub use reaper::Reaper;
pub use record::{HostGroup, ScanId, ScanRecord, ScanRequest, ScanStatus};
pub use result::{ResultType, ScanResult};
pub use runner::ScanRunner;
pub use target::{Credential, ScanTarget, TargetError, expand_hosts};
