//! The `Coordinator` trait: leases, conditional puts, and watches.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifies one granted lease.
pub type LeaseId = u64;

/// Errors from coordination store operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The lease does not exist or has already expired.
    #[error("lease expired")]
    LeaseExpired,

    /// The store could not be reached or refused the operation.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

/// A change observed under a watched prefix.
///
/// Delivery is at-least-once; consumers must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created.
    Put {
        /// Full key.
        key: String,
        /// Value at creation.
        value: Vec<u8>,
    },
    /// A key was deleted or expired with its lease.
    Delete {
        /// Full key.
        key: String,
    },
}

/// Stream of [`WatchEvent`]s for one watched prefix.
///
/// Dropping the stream cancels the watch.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// Wrap a receiver produced by a coordinator implementation.
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the watch is closed.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// A strongly-consistent KV store with leases, per-key conditional creation,
/// and prefix watches.
///
/// Every key written through [`put_if_absent`](Coordinator::put_if_absent)
/// is bound to a lease; when the lease expires or is revoked, all its keys
/// disappear atomically and watchers observe the deletions.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Grant a lease with the given TTL.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError>;

    /// Refresh a lease, restarting its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError>;

    /// Revoke a lease, removing it and every key bound to it. Idempotent.
    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError>;

    /// Create `key` bound to `lease` only if it does not exist.
    ///
    /// Returns `false` when a live key already holds the name.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<bool, CoordinatorError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CoordinatorError>;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinatorError>;

    /// Read all keys under a prefix, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CoordinatorError>;

    /// Observe creations and deletions under a prefix.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, CoordinatorError>;
}
