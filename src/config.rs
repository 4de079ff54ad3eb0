//! Client and server configuration.
//!
//! Both configs are built with consuming `with_*` methods over defaults:
//!
//! ```rust,ignore
//! let cfg = ServerConfig::new("payments")
//!     .with_lease_ttl(Duration::from_secs(30))
//!     .with_peer_name("worker-a");
//! ```
//!
//! The namespace is validated when the owning [`Server`](crate::server::Server)
//! or [`Client`](crate::client::Client) is constructed.

use std::time::Duration;

/// Default peer liveness window.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Default transport connect bound.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for actors to observe cancellation during shutdown.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    namespace: String,
    peer_name: Option<String>,
    lease_ttl: Duration,
    keepalive_interval: Option<Duration>,
    stop_grace: Duration,
}

impl ServerConfig {
    /// Create a server configuration for the given namespace with defaults.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            peer_name: None,
            lease_ttl: DEFAULT_LEASE_TTL,
            keepalive_interval: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Override the peer name. By default the name is derived from the
    /// bound listener address.
    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    /// Set the coordinator lease TTL (the peer liveness window).
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the lease refresh cadence. Defaults to a third of the TTL.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Set how long shutdown waits for actors after cancelling them.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The namespace this server registers under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The explicit peer name, if one was set.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// The coordinator lease TTL.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// The lease refresh cadence.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval.unwrap_or(self.lease_ttl / 3)
    }

    /// The shutdown grace period for actors.
    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }
}

/// Configuration for a [`Client`](crate::client::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    namespace: String,
    dial_timeout: Duration,
    cache_capacity: usize,
}

impl ClientConfig {
    /// Create a client configuration for the given namespace with defaults.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            cache_capacity: 1024,
        }
    }

    /// Set the transport connect bound.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Cap the address cache. The cache is advisory; overflow clears it.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// The namespace this client resolves names in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The transport connect bound.
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// The address cache bound.
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::new("ns");
        assert_eq!(cfg.namespace(), "ns");
        assert_eq!(cfg.lease_ttl(), DEFAULT_LEASE_TTL);
        assert_eq!(cfg.keepalive_interval(), DEFAULT_LEASE_TTL / 3);
        assert_eq!(cfg.stop_grace(), DEFAULT_STOP_GRACE);
        assert!(cfg.peer_name().is_none());
    }

    #[test]
    fn test_server_overrides() {
        let cfg = ServerConfig::new("ns")
            .with_peer_name("peer-a")
            .with_lease_ttl(Duration::from_secs(9))
            .with_keepalive_interval(Duration::from_secs(2));
        assert_eq!(cfg.peer_name(), Some("peer-a"));
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(9));
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_client_defaults() {
        let cfg = ClientConfig::new("ns");
        assert_eq!(cfg.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
        assert_eq!(cfg.cache_capacity(), 1024);
    }
}
