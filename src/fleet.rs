//! Fleet set: the authoritative index of devices under one registry
//!
//! The registry's primitives are slow and not race-safe when driven
//! concurrently, so the fleet imposes the guarantees callers actually need:
//! the in-memory index is the sole source of truth for membership, destructive
//! operations on the same UDID are serialized, already-gone devices are treated
//! idempotently, and batch operations never let one failing device block the
//! rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::boot::BootVerifier;
use crate::config::DeviceConfiguration;
use crate::device::{DeviceEntry, DeviceState};
use crate::error::BatchFailure;
use crate::inspect::ProcessInspector;
use crate::registry::DeviceRegistry;
use crate::watch::{EnumerationPoll, RegistryWatch};
use crate::{Error, Result};

/// Timeouts and poll intervals for fleet operations.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Bound on waiting for a created device to become enumerable.
    pub create_timeout: Duration,
    /// Bound on waiting for the registry to report `Shutdown` after a kill.
    pub kill_timeout: Duration,
    /// Bound on waiting for the registry to report `Booted` after a boot.
    pub boot_timeout: Duration,
    /// Spacing of registry state polls during kill/boot waits.
    pub state_poll_interval: Duration,
    /// Spacing of boot verification readiness polls.
    pub verification_poll_interval: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(30),
            boot_timeout: Duration::from_secs(60),
            state_poll_interval: Duration::from_millis(100),
            verification_poll_interval: Duration::from_secs(1),
        }
    }
}

impl FleetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn state_poll_interval(mut self, interval: Duration) -> Self {
        self.state_poll_interval = interval;
        self
    }

    pub fn verification_poll_interval(mut self, interval: Duration) -> Self {
        self.verification_poll_interval = interval;
        self
    }
}

/// Result of a batch operation. Every device is attempted; failures never
/// abort the batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// UDIDs the operation succeeded for.
    pub succeeded: Vec<String>,
    /// Per-device failures.
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into a single result, aggregating failures.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.failures.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(Error::PartialFailure(self.failures))
        }
    }
}

/// One indexed device. The `op` mutex serializes destructive operations per
/// UDID; the entry lock only guards the snapshot fields.
struct DeviceSlot {
    entry: RwLock<DeviceEntry>,
    op: Mutex<()>,
}

impl DeviceSlot {
    fn new(entry: DeviceEntry) -> Arc<Self> {
        Arc::new(Self {
            entry: RwLock::new(entry),
            op: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> DeviceEntry {
        self.entry.read().clone()
    }

    fn set_state(&self, state: DeviceState) {
        self.entry.write().state = state;
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Arc<DeviceSlot>>,
    // Insertion order, so enumeration snapshots are stable.
    order: Vec<String>,
}

impl Index {
    fn insert(&mut self, udid: String, slot: Arc<DeviceSlot>) {
        if self.slots.insert(udid.clone(), slot).is_none() {
            self.order.push(udid);
        }
    }

    fn remove(&mut self, udid: &str) -> Option<Arc<DeviceSlot>> {
        let slot = self.slots.remove(udid);
        if slot.is_some() {
            self.order.retain(|u| u != udid);
        }
        slot
    }
}

/// Manages the fleet of devices belonging to one registry instance.
///
/// All mutation of fleet membership and device state goes through this type.
/// Callers hold [`DeviceEntry`] snapshots, never owning references; an entry
/// that was deleted concurrently is detected by the ownership checks at the
/// start of every destructive operation.
pub struct FleetSet {
    registry: Arc<dyn DeviceRegistry>,
    inspector: Arc<dyn ProcessInspector>,
    watch: Box<dyn RegistryWatch>,
    index: RwLock<Index>,
    options: FleetOptions,
}

impl FleetSet {
    /// Create a fleet with default options, discovering devices the registry
    /// already knows about.
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        Self::with_options(
            registry,
            inspector,
            Box::new(EnumerationPoll::default()),
            FleetOptions::default(),
        )
    }

    /// Create a fleet with an explicit registration watch and options.
    pub fn with_options(
        registry: Arc<dyn DeviceRegistry>,
        inspector: Arc<dyn ProcessInspector>,
        watch: Box<dyn RegistryWatch>,
        options: FleetOptions,
    ) -> Result<Self> {
        let fleet = Self {
            registry,
            inspector,
            watch,
            index: RwLock::new(Index::default()),
            options,
        };
        fleet.discover()?;
        Ok(fleet)
    }

    /// Index every device the registry currently reports.
    fn discover(&self) -> Result<()> {
        let udids = self
            .registry
            .enumerate()
            .map_err(|e| Error::registry("enumerate", e))?;

        let mut index = self.index.write();
        for udid in udids {
            let state = match self.registry.state_of(&udid) {
                Ok(Some(state)) => state,
                // Vanished between enumerate and state query; skip it.
                Ok(None) => continue,
                Err(e) if e.is_absent() => continue,
                Err(e) => return Err(Error::registry("state_of", e)),
            };
            let entry = DeviceEntry::new(
                udid.clone(),
                udid.clone(),
                DeviceConfiguration::default(),
                state,
            );
            index.insert(udid, DeviceSlot::new(entry));
        }
        tracing::info!(devices = index.order.len(), "Fleet discovered existing devices");
        Ok(())
    }

    /// Create a new device and register it in the fleet.
    ///
    /// The registry can take a visible amount of time to expose a new device
    /// in its own enumeration, so registration is awaited (bounded by the
    /// create timeout) before the entry is indexed in state `Shutdown`.
    pub fn create(&self, config: DeviceConfiguration) -> Result<DeviceEntry> {
        config.validate()?;

        let udid = self
            .registry
            .create(&config)
            .map_err(|e| Error::registry("create", e))?;
        tracing::info!(udid = %udid, config = %config, "Device allocated, awaiting registration");

        if let Err(e) =
            self.watch
                .wait_for_registration(self.registry.as_ref(), &udid, self.options.create_timeout)
        {
            tracing::error!(udid = %udid, error = %e, "Device never became enumerable");
            return Err(Error::registry(
                "create",
                crate::registry::RegistryError::Runtime(format!(
                    "device {} was allocated but never appeared in enumeration: {}",
                    udid, e
                )),
            ));
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("simfleet-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let entry = DeviceEntry::new(udid.clone(), name, config, DeviceState::Shutdown);
        let snapshot = entry.clone();

        self.index.write().insert(udid.clone(), DeviceSlot::new(entry));
        tracing::info!(udid = %udid, "Device registered in fleet");
        Ok(snapshot)
    }

    /// Shut a device down, idempotently.
    ///
    /// Succeeds without touching the registry when no launch process exists.
    pub fn kill(&self, entry: &DeviceEntry) -> Result<()> {
        let slot = self.owned_slot(&entry.udid)?;
        let _op = slot.op.lock();
        self.revalidate(&entry.udid, &slot)?;

        match self.shutdown_locked(&slot, &entry.udid) {
            // Already shut down is a no-op for the caller.
            Err(e) if e.is_already_shutdown() => Ok(()),
            other => other,
        }
    }

    /// Delete a device: kill it first, erase it, drop it from the index.
    ///
    /// A device the registry already forgot about is treated as deleted, not
    /// as an error.
    pub fn delete(&self, entry: &DeviceEntry) -> Result<()> {
        let slot = self.owned_slot(&entry.udid)?;
        let _op = slot.op.lock();
        self.revalidate(&entry.udid, &slot)?;

        match self.shutdown_locked(&slot, &entry.udid) {
            Ok(()) => {}
            Err(e) if e.is_already_shutdown() => {}
            Err(e) => return Err(e),
        }

        slot.set_state(DeviceState::Deleting);
        match self.registry.erase(&entry.udid) {
            Ok(()) => {}
            Err(e) if e.is_absent() => {
                tracing::info!(udid = %entry.udid, "Device already absent from registry, treating delete as complete");
            }
            Err(e) => {
                // The entry stays in the fleet; leave it operable.
                slot.set_state(DeviceState::Shutdown);
                tracing::error!(udid = %entry.udid, error = %e, "Erase failed");
                return Err(Error::registry("erase", e));
            }
        }

        self.index.write().remove(&entry.udid);
        tracing::info!(udid = %entry.udid, "Device deleted");
        Ok(())
    }

    /// Boot a device and wait (bounded) for the registry to report `Booted`.
    ///
    /// This only tracks the registry's own state flag; callers that need the
    /// guest OS to be usable should follow up with [`FleetSet::verify_booted`].
    pub fn boot(&self, udid: &str) -> Result<()> {
        let slot = self.owned_slot(udid)?;
        let _op = slot.op.lock();
        self.revalidate(udid, &slot)?;

        let current = slot.snapshot().state;
        if current == DeviceState::Booted {
            return Ok(());
        }
        if !current.can_transition_to(DeviceState::Booting) {
            return Err(Error::registry(
                "boot",
                crate::registry::RegistryError::WrongState {
                    udid: udid.to_string(),
                    state: current,
                    operation: "boot",
                },
            ));
        }

        slot.set_state(DeviceState::Booting);
        if let Err(e) = self.registry.boot(udid) {
            slot.set_state(DeviceState::Shutdown);
            return Err(Error::registry("boot", e));
        }

        self.wait_for_state(udid, DeviceState::Booted, self.options.boot_timeout, "boot")?;
        slot.set_state(DeviceState::Booted);
        tracing::info!(udid = %udid, "Device booted");
        Ok(())
    }

    /// Verify that a booted device is actually usable at the guest-OS level.
    ///
    /// Runs without the device's operation lock, so it never blocks kills or
    /// deletes; a concurrent delete simply makes verification fail.
    pub fn verify_booted(&self, entry: &DeviceEntry, timeout: Duration) -> Result<()> {
        self.owned_slot(&entry.udid)?;
        let verifier = BootVerifier::new(self.registry.clone(), self.inspector.clone())
            .poll_interval(self.options.verification_poll_interval);
        verifier.verify(&entry.udid, timeout)?;
        Ok(())
    }

    /// Kill every device in the fleet, collecting per-device failures.
    pub fn kill_all(&self) -> BatchOutcome {
        self.for_each_device("kill_all", |entry| self.kill(entry))
    }

    /// Delete every device in the fleet, collecting per-device failures.
    /// The outcome's `succeeded` lists the UDIDs actually removed.
    pub fn delete_all(&self) -> BatchOutcome {
        self.for_each_device("delete_all", |entry| self.delete(entry))
    }

    /// O(1) lookup; absence is not an error.
    pub fn device_by_udid(&self, udid: &str) -> Option<DeviceEntry> {
        self.index.read().slots.get(udid).map(|s| s.snapshot())
    }

    /// Snapshot of all devices in insertion order. Not live-updating.
    pub fn all_devices(&self) -> Vec<DeviceEntry> {
        let index = self.index.read();
        index
            .order
            .iter()
            .filter_map(|udid| index.slots.get(udid))
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.index.read().order.len()
    }

    /// JSON summary of the fleet.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self
                .all_devices()
                .iter()
                .map(DeviceEntry::describe)
                .collect::<Vec<_>>(),
        })
    }

    /// Dispatch `op` for every indexed device on its own worker thread and
    /// join. One failing device never blocks the others.
    fn for_each_device<F>(&self, what: &str, op: F) -> BatchOutcome
    where
        F: Fn(&DeviceEntry) -> Result<()> + Sync,
    {
        let entries = self.all_devices();
        if entries.is_empty() {
            return BatchOutcome::default();
        }
        tracing::info!(devices = entries.len(), "Running {what}");

        let mut outcome = BatchOutcome::default();
        let results: Vec<(String, Result<()>)> = thread::scope(|s| {
            let handles: Vec<_> = entries
                .iter()
                .map(|entry| {
                    let op = &op;
                    s.spawn(move || (entry.udid.clone(), op(entry)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("batch worker panicked")).collect()
        });

        for (udid, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(udid),
                Err(error) => {
                    tracing::error!(udid = %udid, error = %error, "Batch {what} item failed");
                    outcome.failures.push(BatchFailure { udid, error });
                }
            }
        }
        outcome
    }

    /// Ownership check: the index is authoritative regardless of what the
    /// registry reports.
    fn owned_slot(&self, udid: &str) -> Result<Arc<DeviceSlot>> {
        self.index
            .read()
            .slots
            .get(udid)
            .cloned()
            .ok_or_else(|| Error::NotFound(udid.to_string()))
    }

    /// Re-check membership after taking the operation lock. A concurrent
    /// delete may have completed while this operation waited for the lock, in
    /// which case the caller is holding a stale handle.
    fn revalidate(&self, udid: &str, slot: &Arc<DeviceSlot>) -> Result<()> {
        match self.index.read().slots.get(udid) {
            Some(current) if Arc::ptr_eq(current, slot) => Ok(()),
            _ => Err(Error::OwnershipMismatch(udid.to_string())),
        }
    }

    /// Shutdown path shared by kill and delete; caller holds the op lock.
    ///
    /// Returns `AlreadyShutdown` when there is nothing to do, so callers can
    /// decide whether that is interesting.
    fn shutdown_locked(&self, slot: &DeviceSlot, udid: &str) -> Result<()> {
        // The process table is the ground truth here: the registry's state
        // flag can claim `Booted` long after the launch process died.
        if !self.inspector.process_exists(udid) {
            tracing::debug!(udid = %udid, "No launch process, treating device as already shut down");
            slot.set_state(DeviceState::Shutdown);
            return Err(Error::AlreadyShutdown(udid.to_string()));
        }

        if let Some(info) = self.inspector.process_info(udid) {
            tracing::debug!(udid = %udid, pid = info.pid, "Shutting down launch process");
        }
        slot.set_state(DeviceState::ShuttingDown);
        match self.registry.shutdown(udid) {
            Ok(()) => {}
            Err(crate::registry::RegistryError::WrongState {
                state: DeviceState::Shutdown,
                ..
            }) => {
                slot.set_state(DeviceState::Shutdown);
                return Err(Error::AlreadyShutdown(udid.to_string()));
            }
            Err(e) => return Err(Error::registry("shutdown", e)),
        }

        self.wait_for_state(udid, DeviceState::Shutdown, self.options.kill_timeout, "kill")?;
        slot.set_state(DeviceState::Shutdown);
        tracing::info!(udid = %udid, "Device shut down");
        Ok(())
    }

    /// Poll the registry until it reports `target` for `udid` or the deadline
    /// passes. The underlying operation may keep running after a timeout; the
    /// registry offers no cancellation.
    fn wait_for_state(
        &self,
        udid: &str,
        target: DeviceState,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.registry.state_of(udid) {
                Ok(Some(state)) if state == target => return Ok(()),
                Ok(Some(_)) | Ok(None) => {}
                Err(e) if e.is_absent() => {}
                Err(e) => return Err(Error::registry("state_of", e)),
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::Timeout {
                    operation,
                    udid: udid.to_string(),
                    waited,
                });
            }
            thread::sleep(self.options.state_poll_interval.min(timeout - waited));
        }
    }
}
