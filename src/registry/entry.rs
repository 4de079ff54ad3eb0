//! Registration kinds, key layout, and the canonical value encoding.
//!
//! Key layout (authoritative):
//!
//! ```text
//! /<namespace>/peers/<peer-name>        -> {owner_peer, addr, registered_at}
//! /<namespace>/actors/<actor-name>      -> {owner_peer, addr, registered_at}
//! /<namespace>/mailboxes/<mailbox-name> -> {owner_peer, addr, registered_at}
//! ```
//!
//! Namespaces and names are restricted to `[A-Za-z0-9_-]+` so every key has
//! exactly four `/`-separated segments.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The kind of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A running server process.
    Peer,
    /// A named long-running actor.
    Actor,
    /// A named receive queue.
    Mailbox,
}

impl Kind {
    /// All kinds, in resolution order for request addressing.
    pub const ALL: [Kind; 3] = [Kind::Mailbox, Kind::Actor, Kind::Peer];

    pub(crate) fn segment(self) -> &'static str {
        match self {
            Kind::Peer => "peers",
            Kind::Actor => "actors",
            Kind::Mailbox => "mailboxes",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "peers" => Some(Kind::Peer),
            "actors" => Some(Kind::Actor),
            "mailboxes" => Some(Kind::Mailbox),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Kind::Peer => "peer",
            Kind::Actor => "actor",
            Kind::Mailbox => "mailbox",
        };
        f.write_str(label)
    }
}

/// Canonical value stored under a registration key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RegistryValue {
    pub owner_peer: String,
    pub addr: String,
    pub registered_at: u64,
}

/// One live registration: a name bound to its owning peer and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// What kind of name this is.
    pub kind: Kind,
    /// The registered name.
    pub name: String,
    /// Name of the peer that owns the registration.
    pub owner_peer: String,
    /// Address where the owner listens.
    pub address: String,
    /// Registration time, seconds since the Unix epoch.
    pub registered_at: u64,
}

impl Registration {
    pub(crate) fn from_value(kind: Kind, name: String, value: RegistryValue) -> Self {
        Self {
            kind,
            name,
            owner_peer: value.owner_peer,
            address: value.addr,
            registered_at: value.registered_at,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True for non-empty strings over `[A-Za-z0-9_-]`.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(crate) fn registration_key(namespace: &str, kind: Kind, name: &str) -> String {
    format!("/{namespace}/{}/{name}", kind.segment())
}

pub(crate) fn kind_prefix(namespace: &str, kind: Kind) -> String {
    format!("/{namespace}/{}/", kind.segment())
}

/// Split a full key back into its kind and name, if it belongs to
/// `namespace` and follows the layout.
pub(crate) fn parse_key(namespace: &str, key: &str) -> Option<(Kind, String)> {
    let rest = key.strip_prefix('/')?;
    let rest = rest.strip_prefix(namespace)?;
    let rest = rest.strip_prefix('/')?;
    let (segment, name) = rest.split_once('/')?;
    let kind = Kind::from_segment(segment)?;
    if !is_valid_name(name) {
        return None;
    }
    Some((kind, name.to_string()))
}
