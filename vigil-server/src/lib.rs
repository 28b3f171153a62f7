//! # Vigil Server
//!
//! Control surface of the vigil scan daemon.
//!
//! The server accepts scan requests over HTTP/JSON and hands them to the
//! [`vigil_core::Daemon`], which partitions targets into worker groups,
//! claims a private knowledge-base index for each, launches the external
//! engine and streams its results back into the scan record. Losing the
//! knowledge base for good is fatal: the process exits with status 1.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
