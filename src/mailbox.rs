//! Named, bounded receive queues addressable cluster-wide.
//!
//! A mailbox couples a bounded FIFO of [`Delivery`] values with one live
//! registration: while it is open, requests addressed to its name anywhere
//! in the namespace land here. Each delivery carries the decoded payload
//! and a one-shot reply sink scoped to the originating call.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::GridMessage;
use crate::error::GridError;
use crate::registry::{RegistrationHandle, RegistrySession};
use crate::transport::{ReplyError, WirePayload};

/// Local routing table: mailbox name to its queue's send side.
pub(crate) type MailboxRoutes = Arc<Mutex<HashMap<String, mpsc::Sender<Delivery>>>>;

/// One-shot response capability scoped to a single request.
///
/// Fulfilled at most once. If dropped unfulfilled, the caller receives a
/// dropped-without-response error instead of waiting out its timeout.
#[derive(Debug)]
pub(crate) struct ReplySink {
    tx: Option<oneshot::Sender<Result<WirePayload, ReplyError>>>,
}

impl ReplySink {
    pub(crate) fn new(tx: oneshot::Sender<Result<WirePayload, ReplyError>>) -> Self {
        Self { tx: Some(tx) }
    }

    fn send<T: GridMessage>(&mut self, msg: &T) -> Result<(), GridError> {
        let tx = self.tx.take().ok_or(GridError::AlreadyResponded)?;
        let body = match serde_json::to_vec(msg) {
            Ok(body) => body,
            Err(error) => {
                let _ = tx.send(Err(ReplyError::Internal(format!(
                    "response serialization failed: {error}"
                ))));
                return Err(error.into());
            }
        };
        let payload = WirePayload {
            type_tag: T::type_tag().to_string(),
            body,
        };
        if tx.send(Ok(payload)).is_err() {
            debug!("caller gone before response was sent");
        }
        Ok(())
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(ReplyError::Dropped));
        }
    }
}

/// One received request: the decoded payload plus its reply sink.
pub struct Delivery {
    msg: Box<dyn Any + Send>,
    reply: ReplySink,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("responded", &self.reply.tx.is_none())
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(msg: Box<dyn Any + Send>, reply: ReplySink) -> Self {
        Self { msg, reply }
    }

    /// The decoded payload. Downcast to the expected message type:
    ///
    /// ```rust,ignore
    /// if let Some(event) = delivery.msg().downcast_ref::<Event>() { ... }
    /// ```
    pub fn msg(&self) -> &(dyn Any + Send) {
        self.msg.as_ref()
    }

    /// Send the typed reply for this request.
    ///
    /// Fails with [`GridError::AlreadyResponded`] on a second call.
    pub fn respond<T: GridMessage>(&mut self, msg: &T) -> Result<(), GridError> {
        self.reply.send(msg)
    }
}

/// A named, bounded receive queue owned by the local server.
#[derive(Debug)]
pub struct Mailbox {
    name: String,
    rx: mpsc::Receiver<Delivery>,
    routes: MailboxRoutes,
    session: Arc<RegistrySession>,
    handle: RegistrationHandle,
    closed: bool,
}

impl Mailbox {
    /// Open a mailbox named `name` on `server` with a bounded queue of
    /// `capacity`.
    ///
    /// Fails with [`GridError::AlreadyRegistered`] when the name is live
    /// anywhere in the namespace, including this process.
    pub async fn open(
        server: &crate::server::Server,
        name: &str,
        capacity: usize,
    ) -> Result<Mailbox, GridError> {
        server.open_mailbox(name, capacity).await
    }

    pub(crate) fn new(
        name: String,
        rx: mpsc::Receiver<Delivery>,
        routes: MailboxRoutes,
        session: Arc<RegistrySession>,
        handle: RegistrationHandle,
    ) -> Self {
        Self {
            name,
            rx,
            routes,
            session,
            handle,
            closed: false,
        }
    }

    /// The mailbox's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next delivery, in server-accept order.
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Deregister the mailbox and stop accepting new deliveries.
    ///
    /// Already-accepted deliveries remain readable through
    /// [`recv`](Self::recv). Idempotent.
    pub async fn close(&mut self) -> Result<(), GridError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.routes
            .lock()
            .expect("mailbox routes lock poisoned")
            .remove(&self.name);
        self.session.deregister(&self.handle).await
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.routes
            .lock()
            .expect("mailbox routes lock poisoned")
            .remove(&self.name);
        // Best-effort deregistration; the lease sweeps the key anyway if no
        // runtime is available to run it.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let session = self.session.clone();
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    let _ = session.deregister(&handle).await;
                });
            }
            Err(_) => warn!(mailbox = %self.name, "dropped outside runtime; lease cleanup will reclaim the name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl GridMessage for Note {}

    fn delivery_for(note: Note) -> (Delivery, oneshot::Receiver<Result<WirePayload, ReplyError>>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(Box::new(note), ReplySink::new(tx));
        (delivery, rx)
    }

    #[tokio::test]
    async fn test_respond_delivers_payload() {
        let (mut delivery, rx) = delivery_for(Note { text: "hi".into() });

        let note = delivery.msg().downcast_ref::<Note>().unwrap().clone();
        delivery.respond(&Note { text: note.text }).unwrap();

        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload.type_tag, Note::type_tag());
        let decoded: Note = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(decoded.text, "hi");
    }

    #[tokio::test]
    async fn test_double_respond_fails() {
        let (mut delivery, _rx) = delivery_for(Note { text: "x".into() });

        delivery.respond(&Note { text: "a".into() }).unwrap();
        let result = delivery.respond(&Note { text: "b".into() });
        assert!(matches!(result, Err(GridError::AlreadyResponded)));
    }

    #[tokio::test]
    async fn test_drop_without_respond_reports_dropped() {
        let (delivery, rx) = delivery_for(Note { text: "x".into() });
        drop(delivery);

        let result = rx.await.unwrap();
        assert_eq!(result, Err(ReplyError::Dropped));
    }
}
