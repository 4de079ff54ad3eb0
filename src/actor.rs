//! Actor trait, start definitions, and the per-actor context.
//!
//! An actor is a named long-running task hosted by a
//! [`Server`](crate::server::Server). It is constructed by the maker
//! registered for its type, registered under its name for the lifetime of
//! the owning peer, and runs until [`Actor::act`] returns or its context is
//! cancelled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codec::GridMessage;

/// Reserved actor name and type for the per-namespace singleton leader.
pub const LEADER: &str = "leader";

/// A user-supplied long-running task with a unique name and a type.
///
/// `act` must return promptly after [`ActorContext::cancelled`] resolves;
/// the server waits a grace period and logs a warning for stragglers but
/// never forcibly terminates them.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Run the actor until completion or cancellation.
    async fn act(&mut self, ctx: ActorContext);
}

/// Constructor for actors of one type, registered via
/// [`Server::register_def`](crate::server::Server::register_def).
///
/// The argument is the opaque `data` carried by the [`ActorStart`].
pub type ActorMaker =
    std::sync::Arc<dyn Fn(&[u8]) -> Result<Box<dyn Actor>, crate::error::GridError> + Send + Sync>;

/// A request to start an actor on a specific peer.
///
/// Sent to the target peer's name via
/// [`Client::request`](crate::client::Client::request); the receiving
/// server invokes the maker registered for `actor_type` and replies with
/// [`Ack`]. The `name` must be unique across all actors in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorStart {
    /// Globally unique actor name.
    pub name: String,
    /// Selects which registered maker constructs the actor.
    pub actor_type: String,
    /// Opaque payload forwarded to the maker.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl ActorStart {
    /// Create a start definition whose type defaults to its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            actor_type: name.clone(),
            name,
            data: Vec::new(),
        }
    }

    /// Set the actor type.
    pub fn with_type(mut self, actor_type: impl Into<String>) -> Self {
        self.actor_type = actor_type.into();
        self
    }

    /// Attach an opaque payload for the maker.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

impl GridMessage for ActorStart {
    fn type_tag() -> &'static str {
        "gridmesh.ActorStart"
    }
}

/// Reply to a successfully handled [`ActorStart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack;

impl GridMessage for Ack {
    fn type_tag() -> &'static str {
        "gridmesh.Ack"
    }
}

/// Per-actor execution context.
///
/// Carries the actor's identity and a cancellation token derived from the
/// owning server's root token. This is the actor's only link back to its
/// host: a lookup capability, not an ownership pointer.
#[derive(Debug, Clone)]
pub struct ActorContext {
    name: String,
    namespace: String,
    peer: String,
    token: CancellationToken,
}

impl ActorContext {
    pub(crate) fn new(
        name: String,
        namespace: String,
        peer: String,
        token: CancellationToken,
    ) -> Self {
        Self {
            name,
            namespace,
            peer,
            token,
        }
    }

    /// The actor's registered name.
    pub fn actor_name(&self) -> &str {
        &self.name
    }

    /// The namespace the actor runs in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name of the peer hosting this actor.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Resolves when the actor should wind down.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_start_defaults_type_to_name() {
        let start = ActorStart::new("worker-1");
        assert_eq!(start.name, "worker-1");
        assert_eq!(start.actor_type, "worker-1");
        assert!(start.data.is_empty());
    }

    #[test]
    fn test_actor_start_with_type_and_data() {
        let start = ActorStart::new("worker-1")
            .with_type("worker")
            .with_data(vec![1, 2, 3]);
        assert_eq!(start.actor_type, "worker");
        assert_eq!(start.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = ActorContext::new(
            "worker-1".into(),
            "ns".into(),
            "peer-a".into(),
            token.clone(),
        );
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
