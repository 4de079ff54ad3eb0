//! Coordination store seam.
//!
//! The grid needs a strongly-consistent KV store with leases, create-only
//! conditional puts, and prefix watches. [`Coordinator`] is that contract;
//! [`MemoryCoordinator`] is the in-process implementation used by the test
//! suite and by single-process clusters. A networked store (etcd-like)
//! implements the same trait out of crate.

mod memory;
mod traits;

pub use memory::MemoryCoordinator;
pub use traits::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};
