//! Waiting for a freshly created device to become visible
//!
//! Different host-runtime versions surface new devices through different
//! backing-store notification mechanisms. Rather than subclassing per version,
//! the fleet takes one capability interface with two interchangeable
//! implementations, selected at construction time.

use std::thread;
use std::time::{Duration, Instant};

use crate::registry::DeviceRegistry;
use crate::{Error, Result};

/// Strategy for waiting until the registry exposes a newly created UDID.
pub trait RegistryWatch: Send + Sync {
    /// Block until `udid` is visible in the registry or `timeout` elapses.
    fn wait_for_registration(
        &self,
        registry: &dyn DeviceRegistry,
        udid: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Re-runs `enumerate` with exponential backoff until the UDID appears.
///
/// This is the portable mechanism: it works on every runtime version because
/// it relies on nothing but the enumeration primitive itself.
pub struct EnumerationPoll {
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for EnumerationPoll {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl EnumerationPoll {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }
}

impl RegistryWatch for EnumerationPoll {
    fn wait_for_registration(
        &self,
        registry: &dyn DeviceRegistry,
        udid: &str,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let mut delay = self.initial_delay;
        loop {
            let udids = registry
                .enumerate()
                .map_err(|e| Error::registry("enumerate", e))?;
            if udids.iter().any(|u| u == udid) {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: "registration",
                    udid: udid.to_string(),
                    waited: started.elapsed(),
                });
            }
            tracing::trace!(udid = %udid, delay_ms = delay.as_millis() as u64, "Device not enumerable yet, backing off");
            thread::sleep(delay.min(timeout.saturating_sub(started.elapsed())));
            delay = (delay * 2).min(self.max_delay);
        }
    }
}

/// Polls `state_of` at a fixed interval until the registry reports any state.
///
/// Preferred on runtimes where per-device state queries resolve before the
/// global enumeration catches up.
pub struct StatePoll {
    interval: Duration,
}

impl Default for StatePoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

impl StatePoll {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RegistryWatch for StatePoll {
    fn wait_for_registration(
        &self,
        registry: &dyn DeviceRegistry,
        udid: &str,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            match registry.state_of(udid) {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {}
                Err(e) if e.is_absent() => {}
                Err(e) => return Err(Error::registry("state_of", e)),
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: "registration",
                    udid: udid.to_string(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.interval.min(timeout.saturating_sub(started.elapsed())));
        }
    }
}
