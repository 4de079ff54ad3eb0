//! Leased, namespaced name directory in the coordination store.
//!
//! The registry is the grid's single source of truth for "who owns this
//! name and where do I reach them". It splits into two halves:
//!
//! - [`Registry`]: reads and watches. Anyone may hold one; it owns nothing.
//! - [`RegistrySession`]: the write half. It owns one coordinator lease, and
//!   every registration it creates is bound to that lease, so a crashed
//!   owner's names disappear together when the lease lapses.
//!
//! The session does not refresh its own lease; the owning server drives
//! [`RegistrySession::keep_alive_loop`] as a task and treats its return as
//! fatal.

mod entry;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};
use crate::error::GridError;

pub use entry::{Kind, Registration};
pub(crate) use entry::{is_valid_name, unix_now, RegistryValue};

use entry::{kind_prefix, parse_key, registration_key};

/// Read/watch access to one namespace of the coordination store.
#[derive(Debug, Clone)]
pub struct Registry {
    coordinator: Arc<dyn Coordinator>,
    namespace: String,
}

impl Registry {
    /// Create a registry view over `namespace`.
    ///
    /// Fails with [`GridError::InvalidNamespace`] if the namespace is empty
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        namespace: impl Into<String>,
    ) -> Result<Self, GridError> {
        let namespace = namespace.into();
        if !is_valid_name(&namespace) {
            return Err(GridError::InvalidNamespace { namespace });
        }
        Ok(Self {
            coordinator,
            namespace,
        })
    }

    /// The namespace this registry reads.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Look up a single registration.
    pub async fn find(&self, kind: Kind, name: &str) -> Result<Registration, GridError> {
        let key = registration_key(&self.namespace, kind, name);
        let raw = self
            .coordinator
            .get(&key)
            .await?
            .ok_or_else(|| GridError::NotFound {
                name: name.to_string(),
            })?;
        let value: RegistryValue = serde_json::from_slice(&raw)?;
        Ok(Registration::from_value(kind, name.to_string(), value))
    }

    /// All live registrations of a kind in the namespace.
    pub async fn find_all(&self, kind: Kind) -> Result<Vec<Registration>, GridError> {
        let prefix = kind_prefix(&self.namespace, kind);
        let mut registrations = Vec::new();
        for (key, raw) in self.coordinator.list(&prefix).await? {
            let Some((kind, name)) = parse_key(&self.namespace, &key) else {
                debug!(%key, "skipping malformed registry key");
                continue;
            };
            match serde_json::from_slice::<RegistryValue>(&raw) {
                Ok(value) => registrations.push(Registration::from_value(kind, name, value)),
                Err(error) => warn!(%key, %error, "skipping undecodable registry value"),
            }
        }
        Ok(registrations)
    }

    /// Watch registrations of a kind.
    ///
    /// Events are at-least-once; consumers must be idempotent.
    pub async fn watch(&self, kind: Kind) -> Result<RegistryWatch, GridError> {
        let prefix = kind_prefix(&self.namespace, kind);
        let stream = self.coordinator.watch(&prefix).await?;
        Ok(RegistryWatch {
            stream,
            namespace: self.namespace.clone(),
        })
    }
}

/// A change to the set of live registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A registration appeared.
    Added(Registration),
    /// A registration was removed or its owner's lease expired.
    Removed {
        /// Kind of the removed registration.
        kind: Kind,
        /// Name of the removed registration.
        name: String,
    },
}

/// Stream of [`RegistryEvent`]s for one kind. Dropping it cancels the watch.
#[derive(Debug)]
pub struct RegistryWatch {
    stream: WatchStream,
    namespace: String,
}

impl RegistryWatch {
    /// Next event, or `None` once the watch is closed.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.stream.recv().await? {
                WatchEvent::Put { key, value } => {
                    let Some((kind, name)) = parse_key(&self.namespace, &key) else {
                        continue;
                    };
                    match serde_json::from_slice::<RegistryValue>(&value) {
                        Ok(value) => {
                            return Some(RegistryEvent::Added(Registration::from_value(
                                kind, name, value,
                            )));
                        }
                        Err(error) => {
                            warn!(%key, %error, "skipping undecodable registry value");
                        }
                    }
                }
                WatchEvent::Delete { key } => {
                    let Some((kind, name)) = parse_key(&self.namespace, &key) else {
                        continue;
                    };
                    return Some(RegistryEvent::Removed { kind, name });
                }
            }
        }
    }
}

/// Handle to one registration created by a [`RegistrySession`].
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    /// Kind of the registration.
    pub kind: Kind,
    /// Registered name.
    pub name: String,
    key: String,
}

/// The write half of the registry: one lease, many registrations.
#[derive(Debug)]
pub struct RegistrySession {
    registry: Registry,
    lease: LeaseId,
    owner: String,
    address: String,
    ttl: Duration,
    keepalive_interval: Duration,
}

impl RegistrySession {
    /// Grant a lease and open a session owned by `owner` at `address`.
    pub async fn start(
        registry: Registry,
        owner: impl Into<String>,
        address: impl Into<String>,
        ttl: Duration,
        keepalive_interval: Duration,
    ) -> Result<Self, GridError> {
        let owner = owner.into();
        if !is_valid_name(&owner) {
            return Err(GridError::InvalidName { name: owner });
        }
        let lease = registry.coordinator.grant(ttl).await?;
        Ok(Self {
            registry,
            lease,
            owner,
            address: address.into(),
            ttl,
            keepalive_interval,
        })
    }

    /// The peer name owning this session.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The address registered for this session's names.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Atomically claim `(kind, name)` under this session's lease.
    pub async fn register(&self, kind: Kind, name: &str) -> Result<RegistrationHandle, GridError> {
        if !is_valid_name(name) {
            return Err(GridError::InvalidName {
                name: name.to_string(),
            });
        }
        let key = registration_key(self.registry.namespace(), kind, name);
        let value = serde_json::to_vec(&RegistryValue {
            owner_peer: self.owner.clone(),
            addr: self.address.clone(),
            registered_at: unix_now(),
        })?;
        let created = self
            .registry
            .coordinator
            .put_if_absent(&key, value, self.lease)
            .await?;
        if !created {
            return Err(GridError::AlreadyRegistered {
                kind,
                name: name.to_string(),
            });
        }
        debug!(%kind, name, owner = %self.owner, "registered");
        Ok(RegistrationHandle {
            kind,
            name: name.to_string(),
            key,
        })
    }

    /// Remove a registration. Best-effort and idempotent.
    pub async fn deregister(&self, handle: &RegistrationHandle) -> Result<(), GridError> {
        self.registry.coordinator.delete(&handle.key).await?;
        debug!(kind = %handle.kind, name = %handle.name, "deregistered");
        Ok(())
    }

    /// Refresh the lease until `shutdown` fires or the lease is lost.
    ///
    /// Returns `Ok(())` on shutdown. Returns `Err(GridError::LeaseLost)`
    /// once the coordinator reports the lease gone, or once it has been
    /// unreachable for longer than the TTL (the lease must be presumed
    /// expired either way).
    pub async fn keep_alive_loop(&self, shutdown: CancellationToken) -> Result<(), GridError> {
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_ok = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.registry.coordinator.keep_alive(self.lease).await {
                        Ok(()) => last_ok = Instant::now(),
                        Err(CoordinatorError::LeaseExpired) => {
                            warn!(owner = %self.owner, "coordinator lease expired");
                            return Err(GridError::LeaseLost);
                        }
                        Err(error) => {
                            warn!(owner = %self.owner, %error, "lease keepalive failed");
                            if last_ok.elapsed() >= self.ttl {
                                return Err(GridError::LeaseLost);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Revoke the lease, removing every registration it holds.
    pub async fn revoke(&self) -> Result<(), GridError> {
        self.registry.coordinator.revoke(self.lease).await?;
        Ok(())
    }
}
