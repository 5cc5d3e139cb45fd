//! Error types for simfleet

use std::time::Duration;
use thiserror::Error;

use crate::boot::BootError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("device not found in fleet: {0}")]
    NotFound(String),

    #[error("device {0} no longer belongs to this fleet")]
    OwnershipMismatch(String),

    #[error("device already shut down: {0}")]
    AlreadyShutdown(String),

    #[error("registry {operation} failed: {source}")]
    Registry {
        operation: &'static str,
        #[source]
        source: RegistryError,
    },

    #[error("{operation} for {udid} timed out after {waited:?}")]
    Timeout {
        operation: &'static str,
        udid: String,
        waited: Duration,
    },

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error("batch operation failed for {} device(s)", .0.len())]
    PartialFailure(Vec<BatchFailure>),
}

/// One failed item from a batch operation.
#[derive(Error, Debug)]
#[error("{udid}: {error}")]
pub struct BatchFailure {
    pub udid: String,
    #[source]
    pub error: Error,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn registry(operation: &'static str, source: RegistryError) -> Self {
        Error::Registry { operation, source }
    }

    /// Check whether this error is an idempotent no-op rather than a real failure.
    pub fn is_already_shutdown(&self) -> bool {
        matches!(self, Error::AlreadyShutdown(_))
    }
}
