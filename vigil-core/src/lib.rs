//! # Vigil Core
//!
//! Core library for the vigil scan daemon. It fronts an external scanning
//! engine that writes its findings into a shared knowledge-base (KB) store
//! and provides:
//!
//! - **KB client**: a thin async client over the KB store's numbered logical
//!   databases ([`kb::KbContext`]) with Redis and in-memory backends
//! - **Index allocation**: cross-process claims on the store's database pool
//!   with leak recovery for crashed holders ([`kb::DbIndexAllocator`])
//! - **Scan context**: the scan-scoped view of one claimed index
//!   ([`kb::ScanDb`])
//! - **Scan lifecycle**: per-scan records, progress, buffered results and
//!   stop/resume ([`scan::ScanCollection`])
//! - **Supervision**: engine worker processes ([`scan::ScanRunner`]) and the
//!   retention sweep ([`scan::Reaper`])
//!
//! The [`daemon::Daemon`] facade ties these together behind the calls a
//! control-protocol handler needs.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod daemon;
pub mod error;
pub mod kb;
pub mod scan;

pub use daemon::{Daemon, GetScansQuery, ScanSnapshot};
pub use error::{Result, ScanError};
