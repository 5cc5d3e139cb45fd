//! End-to-end lifecycle scenarios against stateful in-memory fakes.
//!
//! The fakes reproduce the awkward parts of a real device registry: new
//! devices take a while to show up in enumeration, state transitions are only
//! visible through polling, and erase on an unknown UDID reports the device as
//! absent rather than failing cleanly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use simfleet::{
    BootError, DeviceConfiguration, DeviceRegistry, DeviceState, Error, FleetOptions, FleetSet,
    ProcessInfo, ProcessInspector, RegistryError, StatePoll,
};

struct FakeDevice {
    state: DeviceState,
    visible_at: Instant,
}

/// In-memory registry with a configurable lag between `create` and the device
/// appearing in `enumerate`.
struct FakeRegistry {
    devices: Mutex<HashMap<String, FakeDevice>>,
    data_root: PathBuf,
    registration_lag: Duration,
    next_id: AtomicUsize,
    erase_calls: AtomicUsize,
    fail_erase_for: Mutex<HashSet<String>>,
}

impl FakeRegistry {
    fn new(data_root: PathBuf) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            data_root,
            registration_lag: Duration::from_millis(30),
            next_id: AtomicUsize::new(1),
            erase_calls: AtomicUsize::new(0),
            fail_erase_for: Mutex::new(HashSet::new()),
        }
    }

    fn fail_erase_for(&self, udid: &str) {
        self.fail_erase_for.lock().insert(udid.to_string());
    }

    fn erase_calls(&self) -> usize {
        self.erase_calls.load(Ordering::SeqCst)
    }
}

impl DeviceRegistry for FakeRegistry {
    fn enumerate(&self) -> Result<Vec<String>, RegistryError> {
        let now = Instant::now();
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|(_, d)| d.visible_at <= now)
            .map(|(udid, _)| udid.clone())
            .collect())
    }

    fn create(&self, _config: &DeviceConfiguration) -> Result<String, RegistryError> {
        let udid = format!("U{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.devices.lock().insert(
            udid.clone(),
            FakeDevice {
                state: DeviceState::Shutdown,
                visible_at: Instant::now() + self.registration_lag,
            },
        );
        Ok(udid)
    }

    fn boot(&self, udid: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(udid)
            .ok_or_else(|| RegistryError::AbsentDevice(udid.to_string()))?;
        device.state = DeviceState::Booted;
        Ok(())
    }

    fn shutdown(&self, udid: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(udid)
            .ok_or_else(|| RegistryError::AbsentDevice(udid.to_string()))?;
        if device.state == DeviceState::Shutdown {
            return Err(RegistryError::WrongState {
                udid: udid.to_string(),
                state: DeviceState::Shutdown,
                operation: "shutdown",
            });
        }
        device.state = DeviceState::Shutdown;
        Ok(())
    }

    fn erase(&self, udid: &str) -> Result<(), RegistryError> {
        self.erase_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_erase_for.lock().contains(udid) {
            return Err(RegistryError::Runtime("backing store wedged".into()));
        }
        if self.devices.lock().remove(udid).is_none() {
            return Err(RegistryError::AbsentDevice(udid.to_string()));
        }
        Ok(())
    }

    fn state_of(&self, udid: &str) -> Result<Option<DeviceState>, RegistryError> {
        Ok(self.devices.lock().get(udid).map(|d| d.state))
    }

    fn data_directory(&self, udid: &str) -> Result<PathBuf, RegistryError> {
        Ok(self.data_root.join(udid))
    }
}

/// Inspector whose process table the test manipulates directly.
#[derive(Default)]
struct FakeInspector {
    processes: Mutex<HashSet<String>>,
}

impl FakeInspector {
    fn spawn_process(&self, udid: &str) {
        self.processes.lock().insert(udid.to_string());
    }

    fn kill_process(&self, udid: &str) {
        self.processes.lock().remove(udid);
    }
}

impl ProcessInspector for FakeInspector {
    fn process_exists(&self, udid: &str) -> bool {
        self.processes.lock().contains(udid)
    }

    fn process_info(&self, udid: &str) -> Option<ProcessInfo> {
        self.process_exists(udid).then(|| ProcessInfo {
            pid: 4242,
            launch_path: PathBuf::from("/usr/bin/device-launchd"),
        })
    }
}

struct Harness {
    registry: Arc<FakeRegistry>,
    inspector: Arc<FakeInspector>,
    fleet: FleetSet,
    _data_root: tempfile::TempDir,
}

fn harness() -> Harness {
    let data_root = tempfile::tempdir().unwrap();
    let registry = Arc::new(FakeRegistry::new(data_root.path().to_path_buf()));
    let inspector = Arc::new(FakeInspector::default());
    let options = FleetOptions::new()
        .create_timeout(Duration::from_secs(2))
        .kill_timeout(Duration::from_secs(2))
        .boot_timeout(Duration::from_secs(2))
        .state_poll_interval(Duration::from_millis(5))
        .verification_poll_interval(Duration::from_millis(20));
    let fleet = FleetSet::with_options(
        registry.clone(),
        inspector.clone(),
        Box::new(StatePoll::new(Duration::from_millis(5))),
        options,
    )
    .unwrap();
    Harness {
        registry,
        inspector,
        fleet,
        _data_root: data_root,
    }
}

fn write_boot_marker(registry: &FakeRegistry, udid: &str) {
    let marker = registry
        .data_directory(udid)
        .unwrap()
        .join(simfleet::boot::BOOT_COMPLETE_MARKER);
    std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
    std::fs::File::create(marker).unwrap();
}

#[test]
fn full_lifecycle_create_boot_verify_delete() {
    let h = harness();

    let entry = h
        .fleet
        .create(DeviceConfiguration::new("iPhone-X", "14.0"))
        .unwrap();
    assert_eq!(entry.state, DeviceState::Shutdown);
    assert_eq!(
        h.fleet.device_by_udid(&entry.udid).unwrap().state,
        DeviceState::Shutdown
    );

    h.fleet.boot(&entry.udid).unwrap();
    assert_eq!(
        h.fleet.device_by_udid(&entry.udid).unwrap().state,
        DeviceState::Booted
    );

    // Guest comes up in stages: launch process first, readiness marker later.
    let late_guest = {
        let registry = h.registry.clone();
        let inspector = h.inspector.clone();
        let udid = entry.udid.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            inspector.spawn_process(&udid);
            thread::sleep(Duration::from_millis(150));
            write_boot_marker(&registry, &udid);
        })
    };

    h.fleet
        .verify_booted(&entry, Duration::from_secs(10))
        .unwrap();
    late_guest.join().unwrap();

    h.fleet.delete(&entry).unwrap();
    assert!(h.fleet.device_by_udid(&entry.udid).is_none());
    assert_eq!(h.fleet.count(), 0);
}

#[test]
fn verify_booted_times_out_when_guest_never_ready() {
    let h = harness();
    let entry = h.fleet.create(DeviceConfiguration::default()).unwrap();
    h.fleet.boot(&entry.udid).unwrap();

    // Inspector never reports the launch process.
    let err = h
        .fleet
        .verify_booted(&entry, Duration::from_secs(2))
        .unwrap_err();
    match err {
        Error::Boot(BootError::TimedOut { process_seen, .. }) => assert!(!process_seen),
        other => panic!("expected boot timeout, got {other}"),
    }
}

#[test]
fn kill_all_leaves_only_shutdown_devices() {
    let h = harness();
    let mut entries = Vec::new();
    for i in 0..3 {
        let entry = h
            .fleet
            .create(DeviceConfiguration::new("iPhone-X", "14.0").name(format!("device-{i}")))
            .unwrap();
        entries.push(entry);
    }

    // Boot two of them with live launch processes.
    for entry in entries.iter().take(2) {
        h.fleet.boot(&entry.udid).unwrap();
        h.inspector.spawn_process(&entry.udid);
    }

    let outcome = h.fleet.kill_all();
    assert!(outcome.is_ok(), "failures: {:?}", outcome.failures);
    assert_eq!(outcome.succeeded.len(), 3);

    assert!(h
        .fleet
        .all_devices()
        .iter()
        .all(|e| e.state == DeviceState::Shutdown));
}

#[test]
fn delete_all_attempts_every_device_on_partial_failure() {
    let h = harness();
    let first = h.fleet.create(DeviceConfiguration::default()).unwrap();
    let second = h.fleet.create(DeviceConfiguration::default()).unwrap();
    let third = h.fleet.create(DeviceConfiguration::default()).unwrap();

    h.registry.fail_erase_for(&second.udid);

    let outcome = h.fleet.delete_all();
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].udid, second.udid);

    let mut removed = outcome.succeeded.clone();
    removed.sort();
    let mut expected = vec![first.udid.clone(), third.udid.clone()];
    expected.sort();
    assert_eq!(removed, expected);

    // The failed device stays indexed and operable.
    assert_eq!(h.fleet.count(), 1);
    assert!(h.fleet.device_by_udid(&second.udid).is_some());
    assert!(matches!(
        outcome.into_result().unwrap_err(),
        Error::PartialFailure(_)
    ));
}

#[test]
fn concurrent_kill_and_delete_issue_exactly_one_erase() {
    let h = harness();
    let entry = h.fleet.create(DeviceConfiguration::default()).unwrap();
    h.fleet.boot(&entry.udid).unwrap();
    h.inspector.spawn_process(&entry.udid);

    let results: Vec<Result<&str, Error>> = thread::scope(|s| {
        let killer = s.spawn(|| h.fleet.kill(&entry).map(|_| "kill"));
        let deleter = s.spawn(|| {
            // Make sure the registry sees the process as gone once the kill
            // completes, like a real launch process exiting.
            let r = h.fleet.delete(&entry).map(|_| "delete");
            if r.is_ok() {
                h.inspector.kill_process(&entry.udid);
            }
            r
        });
        vec![killer.join().unwrap(), deleter.join().unwrap()]
    });

    assert_eq!(h.registry.erase_calls(), 1);
    assert!(h.fleet.device_by_udid(&entry.udid).is_none());
    for result in results {
        match result {
            Ok(_) => {}
            Err(Error::NotFound(_)) | Err(Error::OwnershipMismatch(_)) => {}
            Err(other) => panic!("unexpected error from racing operation: {other}"),
        }
    }
}

#[test]
fn concurrent_deletes_let_exactly_one_win() {
    let h = harness();
    let entry = h.fleet.create(DeviceConfiguration::default()).unwrap();

    let results: Vec<Result<(), Error>> = thread::scope(|s| {
        let a = s.spawn(|| h.fleet.delete(&entry));
        let b = s.spawn(|| h.fleet.delete(&entry));
        vec![a.join().unwrap(), b.join().unwrap()]
    });

    assert_eq!(h.registry.erase_calls(), 1);
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(matches!(
        loser,
        Error::NotFound(_) | Error::OwnershipMismatch(_)
    ));
    assert!(h.fleet.device_by_udid(&entry.udid).is_none());
}

#[test]
fn stale_entry_after_delete_is_rejected() {
    let h = harness();
    let entry = h.fleet.create(DeviceConfiguration::default()).unwrap();
    h.fleet.delete(&entry).unwrap();

    assert!(matches!(
        h.fleet.kill(&entry).unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        h.fleet.delete(&entry).unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn kill_of_booted_device_with_live_process_shuts_it_down() {
    let h = harness();
    let entry = h.fleet.create(DeviceConfiguration::default()).unwrap();
    h.fleet.boot(&entry.udid).unwrap();
    h.inspector.spawn_process(&entry.udid);

    h.fleet.kill(&entry).unwrap();
    assert_eq!(
        h.fleet.device_by_udid(&entry.udid).unwrap().state,
        DeviceState::Shutdown
    );
    assert_eq!(
        h.registry.state_of(&entry.udid).unwrap(),
        Some(DeviceState::Shutdown)
    );

    // Second kill is an idempotent no-op even though the process is still in
    // the fake's table: the registry already reports Shutdown.
    h.fleet.kill(&entry).unwrap();
}

#[test]
fn operations_on_distinct_devices_run_in_parallel() {
    let h = harness();
    let a = h.fleet.create(DeviceConfiguration::default()).unwrap();
    let b = h.fleet.create(DeviceConfiguration::default()).unwrap();

    thread::scope(|s| {
        let boot_a = s.spawn(|| h.fleet.boot(&a.udid));
        let boot_b = s.spawn(|| h.fleet.boot(&b.udid));
        boot_a.join().unwrap().unwrap();
        boot_b.join().unwrap().unwrap();
    });

    let states: Vec<_> = h.fleet.all_devices().into_iter().map(|e| e.state).collect();
    assert_eq!(states, vec![DeviceState::Booted, DeviceState::Booted]);
}
