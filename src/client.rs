//! Resolves logical names to peer addresses and makes typed requests.
//!
//! Resolution prefers a mailbox registration, then an actor, then a peer.
//! Successful resolutions are cached per client; the cache is purely
//! advisory, because a misrouted call comes back as `not-found` and the
//! client then invalidates the entry, re-resolves, and retries exactly once.
//! The same single retry applies when the transport reports the peer
//! unreachable and when the coordinator is unreachable during resolution.
//! A second failure surfaces to the caller.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::actor::{Ack, ActorStart};
use crate::codec::{CodecRegistry, GridMessage};
use crate::config::ClientConfig;
use crate::coordinator::Coordinator;
use crate::error::GridError;
use crate::registry::{Kind, Registration, Registry, RegistryWatch};
use crate::transport::{CallerTransport, ReplyError};

/// Grid client: name resolution, address caching, and typed requests.
/// Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    registry: Registry,
    codec: Arc<CodecRegistry>,
    transport: CallerTransport,
    cache: Mutex<HashMap<String, String>>,
    config: ClientConfig,
}

impl Client {
    /// Create a client for `config.namespace()`.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        codec: Arc<CodecRegistry>,
        config: ClientConfig,
    ) -> Result<Self, GridError> {
        let registry = Registry::new(coordinator, config.namespace())?;
        let transport = CallerTransport::new(config.dial_timeout());
        Ok(Self {
            inner: Arc::new(ClientInner {
                registry,
                codec,
                transport,
                cache: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    /// The namespace this client resolves names in.
    pub fn namespace(&self) -> &str {
        self.inner.registry.namespace()
    }

    /// All live registrations of `kind` in the namespace.
    pub async fn query(
        &self,
        timeout: Duration,
        kind: Kind,
    ) -> Result<Vec<Registration>, GridError> {
        tokio::time::timeout(timeout, self.inner.registry.find_all(kind))
            .await
            .map_err(|_| GridError::DeadlineExceeded)?
    }

    /// Watch registrations of `kind`. Dropping the stream cancels the watch.
    pub async fn query_watch(&self, kind: Kind) -> Result<RegistryWatch, GridError> {
        self.inner.registry.watch(kind).await
    }

    /// Send `msg` to the named receiver and await the typed reply.
    ///
    /// The reply arrives as a [`Box<dyn Any + Send>`] holding whichever
    /// registered type the responder chose; downcast to consume it.
    pub async fn request<T: GridMessage>(
        &self,
        timeout: Duration,
        receiver: &str,
        msg: &T,
    ) -> Result<Box<dyn Any + Send>, GridError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (type_tag, body) = self.inner.codec.encode(msg)?;

        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(GridError::DeadlineExceeded);
            }
            let addr = match tokio::time::timeout(remaining, self.resolve(receiver)).await {
                Ok(Ok(addr)) => addr,
                Ok(Err(GridError::Unavailable { reason })) if attempt == 0 => {
                    // Coordinator hiccups during resolution get the same
                    // single retry as transport failures.
                    debug!(receiver, %reason, "resolution failed; retrying once");
                    self.invalidate(receiver);
                    attempt += 1;
                    continue;
                }
                Ok(Err(error)) => return Err(error),
                Err(_) => return Err(GridError::DeadlineExceeded),
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(GridError::DeadlineExceeded);
            }
            match self
                .inner
                .transport
                .call(&addr, receiver, type_tag, body.clone(), remaining)
                .await
            {
                Ok(Ok(payload)) => {
                    return self.inner.codec.decode(&payload.type_tag, &payload.body);
                }
                Ok(Err(ReplyError::NotFound)) if attempt == 0 => {
                    debug!(receiver, %addr, "peer answered not-found; refreshing cache");
                    self.invalidate(receiver);
                    attempt += 1;
                }
                Ok(Err(reply)) => return Err(reply_to_grid(reply, receiver)),
                Err(GridError::Unavailable { reason }) if attempt == 0 => {
                    debug!(receiver, %addr, %reason, "peer unreachable; refreshing cache");
                    self.invalidate(receiver);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Ask `peer` to start an actor. Convenience over [`request`](Self::request).
    pub async fn request_start(
        &self,
        timeout: Duration,
        peer: &str,
        start: ActorStart,
    ) -> Result<Ack, GridError> {
        let response = self.request(timeout, peer, &start).await?;
        match response.downcast::<Ack>() {
            Ok(ack) => Ok(*ack),
            Err(_) => Err(GridError::InvalidState(
                "unexpected response type for actor start".into(),
            )),
        }
    }

    async fn resolve(&self, receiver: &str) -> Result<String, GridError> {
        if let Some(addr) = self
            .inner
            .cache
            .lock()
            .expect("client cache lock poisoned")
            .get(receiver)
        {
            return Ok(addr.clone());
        }
        for kind in Kind::ALL {
            match self.inner.registry.find(kind, receiver).await {
                Ok(registration) => {
                    self.remember(receiver, &registration.address);
                    return Ok(registration.address);
                }
                Err(GridError::NotFound { .. }) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(GridError::NotFound {
            name: receiver.to_string(),
        })
    }

    fn remember(&self, receiver: &str, addr: &str) {
        let mut cache = self.inner.cache.lock().expect("client cache lock poisoned");
        if cache.len() >= self.inner.config.cache_capacity() && !cache.contains_key(receiver) {
            debug!("address cache full; clearing");
            cache.clear();
        }
        cache.insert(receiver.to_string(), addr.to_string());
    }

    fn invalidate(&self, receiver: &str) {
        self.inner
            .cache
            .lock()
            .expect("client cache lock poisoned")
            .remove(receiver);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("namespace", &self.namespace())
            .finish()
    }
}

fn reply_to_grid(error: ReplyError, receiver: &str) -> GridError {
    match error {
        ReplyError::NotFound => GridError::NotFound {
            name: receiver.to_string(),
        },
        ReplyError::MailboxFull => GridError::MailboxFull {
            name: receiver.to_string(),
        },
        ReplyError::UnknownType { tag } => GridError::UnknownType { tag },
        ReplyError::AlreadyRegistered { name } => GridError::AlreadyRegistered {
            kind: Kind::Actor,
            name,
        },
        ReplyError::InvalidName { name } => GridError::InvalidName { name },
        ReplyError::Dropped => GridError::Remote("request dropped without a response".into()),
        ReplyError::Internal(message) => GridError::Remote(message),
    }
}

#[cfg(test)]
mod tests {
    use crate::coordinator::MemoryCoordinator;

    use super::*;

    fn client(cache_capacity: usize) -> Client {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        Client::new(
            coordinator,
            Arc::new(CodecRegistry::new()),
            ClientConfig::new("testns").with_cache_capacity(cache_capacity),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn test_cache_clears_at_capacity() {
        let client = client(2);
        client.remember("a", "127.0.0.1:1");
        client.remember("b", "127.0.0.1:2");
        client.remember("c", "127.0.0.1:3");

        let cache = client.inner.cache.lock().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c").map(String::as_str), Some("127.0.0.1:3"));
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let client = client(8);
        client.remember("a", "127.0.0.1:1");
        client.invalidate("a");
        assert!(client.inner.cache.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_unresolvable_name_is_not_found() {
        let client = client(8);
        let result = client
            .request(Duration::from_secs(1), "nobody", &ActorStart::new("x"))
            .await;
        assert!(matches!(result, Err(GridError::NotFound { .. })));
    }
}
