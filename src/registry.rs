//! Device registry adapter
//!
//! The registry is the host virtualization runtime's own device management
//! surface. Its primitives are synchronous, slow, and not atomic across calls:
//! a freshly created device may take a while to show up in `enumerate`, and a
//! device can vanish between a state query and the next operation. The fleet
//! layers idempotence and re-validation on top; this trait only carries the raw
//! operations through.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::DeviceConfiguration;
use crate::device::DeviceState;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry has no device with this UDID.
    #[error("device {0} not present in registry")]
    AbsentDevice(String),

    /// The device exists but is in the wrong state for the operation.
    #[error("device {udid} is {state}, cannot {operation}")]
    WrongState {
        udid: String,
        state: DeviceState,
        operation: &'static str,
    },

    /// Any other runtime failure, carried through verbatim.
    #[error("{0}")]
    Runtime(String),
}

/// Primitive operations exposed by the underlying device registry.
///
/// Implementations are expected to be internally thread-safe; they are never
/// mutated by this crate, only called.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceRegistry: Send + Sync {
    /// All UDIDs the registry currently knows about.
    fn enumerate(&self) -> Result<Vec<String>, RegistryError>;

    /// Allocate a new device, returning its UDID. The device may not be
    /// visible in `enumerate` immediately.
    fn create(&self, config: &DeviceConfiguration) -> Result<String, RegistryError>;

    fn boot(&self, udid: &str) -> Result<(), RegistryError>;

    fn shutdown(&self, udid: &str) -> Result<(), RegistryError>;

    fn erase(&self, udid: &str) -> Result<(), RegistryError>;

    /// Current state as the registry sees it; `None` when the device is absent.
    fn state_of(&self, udid: &str) -> Result<Option<DeviceState>, RegistryError>;

    /// Root of the device's on-disk data directory, where the guest leaves its
    /// readiness marker.
    fn data_directory(&self, udid: &str) -> Result<PathBuf, RegistryError>;
}

impl RegistryError {
    /// Whether the failure means the device is already gone.
    pub fn is_absent(&self) -> bool {
        matches!(self, RegistryError::AbsentDevice(_))
    }
}
