//! Device lifecycle state and entry model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeviceConfiguration;

/// Lifecycle state of a device instance.
///
/// Transitions are monotonic along
/// `Creating -> Shutdown -> Booting -> Booted -> ShuttingDown -> Shutdown -> Deleting`,
/// except that the boot/shutdown cycle may repeat. `Deleting` is terminal; a
/// deleted UDID never re-enters the fleet index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Creating,
    Shutdown,
    Booting,
    Booted,
    ShuttingDown,
    Deleting,
}

impl DeviceState {
    /// Whether a transition from `self` to `next` is on the lifecycle graph.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Creating, Shutdown)
                | (Shutdown, Booting)
                | (Booting, Booted)
                | (Booted, ShuttingDown)
                | (Booting, ShuttingDown)
                | (ShuttingDown, Shutdown)
                | (Shutdown, Deleting)
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Creating => write!(f, "Creating"),
            DeviceState::Shutdown => write!(f, "Shutdown"),
            DeviceState::Booting => write!(f, "Booting"),
            DeviceState::Booted => write!(f, "Booted"),
            DeviceState::ShuttingDown => write!(f, "ShuttingDown"),
            DeviceState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Snapshot of one device instance in a fleet.
///
/// This is a value, not a handle with ownership: all mutation goes through the
/// owning [`FleetSet`](crate::FleetSet), keyed by UDID. A snapshot held across
/// a concurrent delete simply becomes stale; operations passed a stale snapshot
/// fail with `NotFound` or `OwnershipMismatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Unique identifier within the registry, assigned at creation.
    pub udid: String,
    /// Display name.
    pub name: String,
    /// Configuration the device was created from.
    pub config: DeviceConfiguration,
    /// Lifecycle state at snapshot time.
    pub state: DeviceState,
    /// When this fleet created or discovered the device.
    pub created_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(udid: impl Into<String>, name: impl Into<String>, config: DeviceConfiguration, state: DeviceState) -> Self {
        Self {
            udid: udid.into(),
            name: name.into(),
            config,
            state,
            created_at: Utc::now(),
        }
    }

    /// JSON summary of this device.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "udid": self.udid,
            "name": self.name,
            "device_type": self.config.device_type,
            "os_version": self.config.os_version,
            "state": self.state.to_string(),
        })
    }
}
