//! Boot verification
//!
//! The registry flips a device to `Booted` as soon as the guest kernel starts,
//! well before user-level services finish coming up (first boot in particular
//! spends a while in data migration). Callers that proceed on the raw state
//! flag see flaky failures, so the fleet polls a composite readiness predicate
//! instead: the launch process must be alive AND the guest must have written
//! its boot-complete marker, both observed on the same poll.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::device::DeviceState;
use crate::inspect::ProcessInspector;
use crate::registry::DeviceRegistry;

/// Marker the guest writes under its data directory once user-level services
/// are up.
pub const BOOT_COMPLETE_MARKER: &str = "var/run/boot-complete";

/// Default spacing between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum BootError {
    /// The device left the booted lifecycle without its launch process ever
    /// showing up.
    #[error("device {udid} shut down before its launch process appeared")]
    ProcessNeverAppeared { udid: String },

    /// The launch process was seen, but readiness was never signalled before
    /// the device left the booted lifecycle.
    #[error("device {udid} launch process started but readiness was never signalled")]
    ReadinessNeverReached { udid: String },

    /// The deadline passed while both signals had yet to hold simultaneously.
    /// `process_seen` records whether the launch process was observed at any
    /// poll, for diagnosability.
    #[error("boot verification of {udid} timed out after {waited:?} (process seen: {process_seen})")]
    TimedOut {
        udid: String,
        waited: Duration,
        process_seen: bool,
    },
}

/// Strategy for confirming that a booted device is actually usable.
///
/// Can be invoked as soon as a device enters `Booted`, or later against a
/// long-running device as a known-good check. Runs on the calling thread and
/// holds no fleet lock, so it never blocks other fleet operations.
pub struct BootVerifier {
    registry: Arc<dyn DeviceRegistry>,
    inspector: Arc<dyn ProcessInspector>,
    poll_interval: Duration,
}

impl BootVerifier {
    pub fn new(registry: Arc<dyn DeviceRegistry>, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            registry,
            inspector,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until the device is verifiably booted or `timeout` elapses.
    pub fn verify(&self, udid: &str, timeout: Duration) -> Result<(), BootError> {
        let started = Instant::now();
        let mut process_seen = false;

        loop {
            let process_alive = self.inspector.process_exists(udid);
            process_seen |= process_alive;
            let marker_present = self.marker_present(udid);

            if process_alive && marker_present {
                tracing::info!(udid = %udid, waited_ms = started.elapsed().as_millis() as u64, "Device verified booted");
                return Ok(());
            }

            // A device that dropped out of the booted lifecycle will never
            // become ready; classify the stall instead of waiting out the
            // deadline.
            if !self.still_booting(udid) {
                tracing::warn!(udid = %udid, process_seen, "Device left booted lifecycle during verification");
                return Err(if process_seen {
                    BootError::ReadinessNeverReached {
                        udid: udid.to_string(),
                    }
                } else {
                    BootError::ProcessNeverAppeared {
                        udid: udid.to_string(),
                    }
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                tracing::warn!(udid = %udid, process_seen, marker_present, "Boot verification timed out");
                return Err(BootError::TimedOut {
                    udid: udid.to_string(),
                    waited,
                    process_seen,
                });
            }

            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    fn marker_present(&self, udid: &str) -> bool {
        match self.registry.data_directory(udid) {
            Ok(dir) => dir.join(BOOT_COMPLETE_MARKER).exists(),
            Err(_) => false,
        }
    }

    fn still_booting(&self, udid: &str) -> bool {
        matches!(
            self.registry.state_of(udid),
            Ok(Some(DeviceState::Booting)) | Ok(Some(DeviceState::Booted))
        )
    }
}
