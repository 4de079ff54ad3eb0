//! Message codec registry.
//!
//! Maps a type tag to the decoder that reconstructs the payload on the
//! receiving side. Senders encode any [`GridMessage`]; receivers can only
//! decode tags that were registered with them, so both halves of a
//! conversation must register the types they exchange:
//!
//! ```rust,ignore
//! let codec = Arc::new(CodecRegistry::new());
//! codec.register::<Event>()?;
//! codec.register::<EventResponse>()?;
//! ```
//!
//! The registry is an explicit object shared by handle between the clients
//! and servers of a process. Tags are write-once: re-registering the same
//! type is idempotent, a different type under the same tag fails with
//! [`GridError::CodecConflict`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::actor::{Ack, ActorStart};
use crate::error::GridError;

/// A value that can travel through the grid.
///
/// The default tag is the canonical Rust type path, which is consistent
/// across the homogeneous processes of one fleet. Override `type_tag` when
/// the tag must survive refactors or cross build boundaries:
///
/// ```rust,ignore
/// impl GridMessage for Event {
///     fn type_tag() -> &'static str {
///         "example.Event"
///     }
/// }
/// ```
pub trait GridMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Tag carried on the wire to select the decoder at the receiver.
    fn type_tag() -> &'static str {
        std::any::type_name::<Self>()
    }
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, GridError> + Send + Sync>;

struct CodecEntry {
    type_id: TypeId,
    decode: DecodeFn,
}

fn entry_for<T: GridMessage>() -> CodecEntry {
    CodecEntry {
        type_id: TypeId::of::<T>(),
        decode: Box::new(|body| {
            let value: T = serde_json::from_slice(body)?;
            Ok(Box::new(value) as Box<dyn Any + Send>)
        }),
    }
}

/// Write-once map of type tag to decoder.
///
/// [`ActorStart`] and [`Ack`] are pre-registered so placement requests work
/// out of the box.
pub struct CodecRegistry {
    entries: Mutex<HashMap<&'static str, CodecEntry>>,
}

impl CodecRegistry {
    /// Create a registry with the built-in grid types pre-registered.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(ActorStart::type_tag(), entry_for::<ActorStart>());
        entries.insert(Ack::type_tag(), entry_for::<Ack>());
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Register `T` under its tag.
    ///
    /// Idempotent for the same type; fails with
    /// [`GridError::CodecConflict`] if a different type already owns the tag.
    pub fn register<T: GridMessage>(&self) -> Result<(), GridError> {
        let tag = T::type_tag();
        let mut entries = self.entries.lock().expect("codec registry lock poisoned");
        if let Some(existing) = entries.get(tag) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(GridError::CodecConflict {
                tag: tag.to_string(),
            });
        }
        entries.insert(tag, entry_for::<T>());
        Ok(())
    }

    /// Encode a message into its wire tag and body.
    pub fn encode<T: GridMessage>(&self, msg: &T) -> Result<(&'static str, Vec<u8>), GridError> {
        let body = serde_json::to_vec(msg)?;
        Ok((T::type_tag(), body))
    }

    /// Decode a wire body by tag.
    ///
    /// Fails with [`GridError::UnknownType`] for unregistered tags.
    pub fn decode(&self, tag: &str, body: &[u8]) -> Result<Box<dyn Any + Send>, GridError> {
        let entries = self.entries.lock().expect("codec registry lock poisoned");
        let entry = entries.get(tag).ok_or_else(|| GridError::UnknownType {
            tag: tag.to_string(),
        })?;
        (entry.decode)(body)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().expect("codec registry lock poisoned");
        f.debug_struct("CodecRegistry")
            .field("tags", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl GridMessage for Ping {}

    #[derive(Debug, Serialize, Deserialize)]
    struct NotPing {
        n: u32,
    }

    impl GridMessage for NotPing {
        fn type_tag() -> &'static str {
            Ping::type_tag()
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = CodecRegistry::new();
        codec.register::<Ping>().unwrap();

        let (tag, body) = codec.encode(&Ping { n: 7 }).unwrap();
        let decoded = codec.decode(tag, &body).unwrap();
        let ping = decoded.downcast_ref::<Ping>().unwrap();
        assert_eq!(*ping, Ping { n: 7 });
    }

    #[test]
    fn test_register_idempotent() {
        let codec = CodecRegistry::new();
        codec.register::<Ping>().unwrap();
        codec.register::<Ping>().unwrap();
    }

    #[test]
    fn test_register_conflict() {
        let codec = CodecRegistry::new();
        codec.register::<Ping>().unwrap();
        let result = codec.register::<NotPing>();
        assert!(matches!(result, Err(GridError::CodecConflict { .. })));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let codec = CodecRegistry::new();
        let result = codec.decode("no.such.Tag", b"{}");
        assert!(matches!(result, Err(GridError::UnknownType { .. })));
    }

    #[test]
    fn test_builtins_preregistered() {
        let codec = CodecRegistry::new();
        let (tag, body) = codec.encode(&ActorStart::new("w-1")).unwrap();
        let decoded = codec.decode(tag, &body).unwrap();
        assert!(decoded.downcast_ref::<ActorStart>().is_some());
    }
}
