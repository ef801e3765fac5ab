use thiserror::Error;

use crate::backend::BackendError;
use crate::bus::BusError;
use crate::kernel::runner::RunnerError;
use crate::resources::InsufficientResource;
use crate::types::KernelId;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The kernel may have terminated concurrently; the caller may retry.
    #[error("kernel not found: {0} (may have terminated, retry later)")]
    KernelNotFound(KernelId),

    #[error(transparent)]
    InsufficientResource(#[from] InsufficientResource),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the manager may retry the failed call as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::KernelNotFound(_) | AgentError::Bus(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
