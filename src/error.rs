//! Error types for the grid.

use crate::coordinator::CoordinatorError;
use crate::registry::Kind;
use thiserror::Error;

/// Errors surfaced by grid operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// A live registration with the same kind and name already exists.
    #[error("already registered: {kind} {name:?}")]
    AlreadyRegistered {
        /// Registration kind that collided.
        kind: Kind,
        /// The contested name.
        name: String,
    },

    /// No live registration matches the requested name.
    #[error("not found: {name:?}")]
    NotFound {
        /// The name that could not be resolved.
        name: String,
    },

    /// The server's coordinator lease expired. Fatal for that server:
    /// every registration bound to the lease is gone.
    #[error("coordinator lease lost")]
    LeaseLost,

    /// The target could not be reached.
    #[error("unavailable: {reason}")]
    Unavailable {
        /// What failed and where.
        reason: String,
    },

    /// The caller-supplied timeout elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The receiving mailbox is at capacity. Not retried automatically;
    /// callers choose whether to back off.
    #[error("mailbox full: {name:?}")]
    MailboxFull {
        /// Name of the saturated mailbox.
        name: String,
    },

    /// The payload's type tag is absent from the codec registry.
    #[error("unknown message type: {tag:?}")]
    UnknownType {
        /// The unrecognized tag.
        tag: String,
    },

    /// Two incompatible types were registered under the same tag.
    #[error("conflicting codec registration for tag {tag:?}")]
    CodecConflict {
        /// The contested tag.
        tag: String,
    },

    /// `respond` was called twice for one delivery.
    #[error("already responded")]
    AlreadyResponded,

    /// The namespace is empty or contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid namespace: {namespace:?}")]
    InvalidNamespace {
        /// The rejected namespace.
        namespace: String,
    },

    /// The name is empty, reserved, or contains characters outside
    /// `[A-Za-z0-9_-]`.
    #[error("invalid name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A frame exceeded the wire size cap.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Encoded size of the offending message.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// An error reported by the remote peer, carried verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    /// Payload or frame serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoordinatorError> for GridError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::LeaseExpired => GridError::LeaseLost,
            CoordinatorError::Unavailable(reason) => GridError::Unavailable { reason },
        }
    }
}
