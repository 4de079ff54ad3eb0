//! # Gridmesh: a namespaced distributed actor grid
//!
//! Gridmesh lets a fleet of homogeneous processes form a cluster, elect a
//! singleton leader, place named long-running actors onto specific peers,
//! and exchange request/response messages addressed by logical mailbox
//! name. A strongly-consistent coordination store (the [`Coordinator`]
//! trait) provides membership, naming, and leases; a direct peer-to-peer
//! transport carries the messages.
//!
//! # Core Concepts
//!
//! - **Peers**: each [`Server`] registers itself under a coordinator lease;
//!   crash cleanup is automatic when the lease lapses.
//! - **Singleton names**: actors and mailboxes claim globally unique names
//!   for the lifetime of their owning peer.
//! - **Leader election**: exactly one actor named `"leader"` runs per
//!   namespace, elected by racing a create-only registration.
//! - **Logical addressing**: a [`Client`] resolves a name to the owning
//!   peer's address and calls it; stale caches self-heal because misrouted
//!   calls answer `not-found`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use gridmesh::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use tokio::net::TcpListener;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Event {
//!     user: String,
//! }
//!
//! impl GridMessage for Event {}
//!
//! struct Leader;
//!
//! #[async_trait::async_trait]
//! impl Actor for Leader {
//!     async fn act(&mut self, ctx: ActorContext) {
//!         // Schedule work, then wind down on cancellation.
//!         ctx.cancelled().await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GridError> {
//!     let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
//!     let codec = Arc::new(CodecRegistry::new());
//!     codec.register::<Event>()?;
//!
//!     let server = Server::new(
//!         coordinator.clone(),
//!         codec.clone(),
//!         ServerConfig::new("demo"),
//!     )?;
//!     server.register_def("leader", |_| Ok(Box::new(Leader)));
//!
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     server.serve(listener).await
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Server                           │
//! │   (peer registration, election, placement, dispatch)     │
//! └───────┬────────────────┬──────────────────┬──────────────┘
//!         │                │                  │
//!         ▼                ▼                  ▼
//!  ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//!  │  Registry  │   │  Mailboxes  │   │    Actors    │
//!  │ (names +   │   │ (bounded    │   │ (per-actor   │
//!  │  leases)   │   │  queues)    │   │  tasks)      │
//!  └─────┬──────┘   └─────────────┘   └──────────────┘
//!        │
//!        ▼
//!  ┌─────────────┐         ┌──────────────────────────┐
//!  │ Coordinator │ ◄────── │  Client (resolve, cache, │
//!  │ (leases,    │         │  call, retry once)       │
//!  │  CAS, watch)│         └──────────────────────────┘
//!  └─────────────┘
//! ```

pub mod actor;
pub mod client;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod server;
mod transport;

pub use actor::{Ack, Actor, ActorContext, ActorMaker, ActorStart, LEADER};
pub use client::Client;
pub use codec::{CodecRegistry, GridMessage};
pub use config::{ClientConfig, ServerConfig};
pub use coordinator::{Coordinator, CoordinatorError, LeaseId, MemoryCoordinator, WatchEvent, WatchStream};
pub use error::GridError;
pub use mailbox::{Delivery, Mailbox};
pub use registry::{
    Kind, Registration, RegistrationHandle, Registry, RegistryEvent, RegistrySession,
    RegistryWatch,
};
pub use server::Server;

/// Common imports for grid applications.
pub mod prelude {
    pub use crate::actor::{Ack, Actor, ActorContext, ActorStart};
    pub use crate::client::Client;
    pub use crate::codec::{CodecRegistry, GridMessage};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::coordinator::{Coordinator, MemoryCoordinator};
    pub use crate::error::GridError;
    pub use crate::mailbox::{Delivery, Mailbox};
    pub use crate::registry::{Kind, Registration};
    pub use crate::server::Server;
}
