use thiserror::Error;

use crate::kb::KbError;
use crate::scan::{ScanId, TargetError};

/// Errors surfaced to callers of the scan lifecycle API.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan not found: {0}")]
    NotFound(ScanId),

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("No free KB index available (pool of {max} databases exhausted)")]
    PoolExhausted { max: usize },

    #[error("KB error: {0}")]
    Kb(#[from] KbError),
}

impl ScanError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Kb(err) if err.is_fatal())
    }
}

impl From<TargetError> for ScanError {
    fn from(err: TargetError) -> Self {
        ScanError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
