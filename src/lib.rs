//! simfleet
//!
//! A Rust library for managing fleets of simulated device instances on top of
//! an underlying device registry whose primitives are slow, sometimes
//! asynchronous, and not race-safe when driven concurrently.
//!
//! # Key guarantees
//!
//! - **Authoritative index** - the fleet's in-memory index, not the registry,
//!   decides what belongs to the fleet
//! - **Per-device serialization** - destructive operations on the same UDID
//!   never race; distinct UDIDs run fully in parallel
//! - **Idempotence** - killing an already-dead device or deleting an
//!   already-absent one succeeds instead of failing
//! - **Real boot verification** - the registry's `Booted` flag fires when the
//!   guest kernel starts; [`BootVerifier`] waits until the guest OS is
//!   actually usable
//!
//! The registry and process inspector are consumed through the
//! [`DeviceRegistry`] and [`ProcessInspector`] traits; the embedding
//! application supplies implementations for its host runtime.

pub mod boot;
pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod inspect;
pub mod registry;
pub mod watch;

pub use boot::{BootError, BootVerifier};
pub use config::DeviceConfiguration;
pub use device::{DeviceEntry, DeviceState};
pub use error::{BatchFailure, Error, Result};
pub use fleet::{BatchOutcome, FleetOptions, FleetSet};
pub use inspect::{ProcessInfo, ProcessInspector};
pub use registry::{DeviceRegistry, RegistryError};
pub use watch::{EnumerationPoll, RegistryWatch, StatePoll};
