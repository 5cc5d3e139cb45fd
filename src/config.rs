//! Device configuration value objects

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Device-type/OS-version pairing used when creating a device.
///
/// Immutable once a device has been created from it; compared structurally so
/// callers can detect whether a device was created from the stock pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Device model identifier, e.g. "iPhone-X".
    pub device_type: String,
    /// Guest OS version, dot-separated numerics, e.g. "14.0".
    pub os_version: String,
    /// Optional display name; the fleet generates one when absent.
    pub name: Option<String>,
}

/// Stock pairing used when the caller does not care which device it gets.
pub const DEFAULT_DEVICE_TYPE: &str = "iPhone-X";
pub const DEFAULT_OS_VERSION: &str = "14.0";

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            os_version: DEFAULT_OS_VERSION.to_string(),
            name: None,
        }
    }
}

impl DeviceConfiguration {
    pub fn new(device_type: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            os_version: os_version.into(),
            name: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this is the stock device-type/OS pairing.
    pub fn is_default(&self) -> bool {
        let stock = Self::default();
        self.device_type == stock.device_type && self.os_version == stock.os_version
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_type.is_empty() {
            return Err(Error::ConfigurationInvalid(
                "device_type cannot be empty".into(),
            ));
        }
        if self.os_version.is_empty() {
            return Err(Error::ConfigurationInvalid(
                "os_version cannot be empty".into(),
            ));
        }
        let numeric = self
            .os_version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if !numeric {
            return Err(Error::ConfigurationInvalid(format!(
                "os_version must be dot-separated numerics, got {:?}",
                self.os_version
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for DeviceConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.device_type, self.os_version)
    }
}
