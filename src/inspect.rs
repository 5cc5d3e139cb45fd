//! Process inspection for device launch processes

use std::path::PathBuf;

/// Information about the host process backing one device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub launch_path: PathBuf,
}

/// Answers "is the launch process for device D alive" queries.
///
/// The registry's own state flag lags reality in both directions, so the fleet
/// cross-checks it against the live process table before destructive
/// operations and during boot verification.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessInspector: Send + Sync {
    /// Whether a live launch process exists for the device.
    fn process_exists(&self, udid: &str) -> bool;

    /// Process details, when one exists.
    fn process_info(&self, udid: &str) -> Option<ProcessInfo>;
}
