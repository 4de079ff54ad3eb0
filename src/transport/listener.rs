//! Inbound side of the transport: accept loop and per-connection handling.
//!
//! Each accepted connection gets a reader loop and a writer task. Every
//! request frame is dispatched on its own task so a slow handler never
//! blocks the connection; responses funnel through the writer task in
//! completion order. Cancelling the shutdown token tears down the accept
//! loop and every connection spawned from it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GridError;

use super::wire::{read_frame, write_frame, Frame, ReplyError, WirePayload};

/// Handles one inbound request and produces the reply or the error that
/// travels back verbatim.
#[async_trait]
pub(crate) trait RequestDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        receiver: String,
        type_tag: String,
        body: Vec<u8>,
    ) -> Result<WirePayload, ReplyError>;
}

/// Accept connections until `shutdown` fires.
///
/// Connections are cancelled through a child token whose guard dies with
/// this future, so aborting the caller tears them down too.
pub(crate) async fn serve_connections(
    listener: TcpListener,
    dispatcher: Arc<dyn RequestDispatcher>,
    shutdown: CancellationToken,
) -> Result<(), GridError> {
    let conn_token = shutdown.child_token();
    let _guard = conn_token.clone().drop_guard();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "connection accepted");
                    tokio::spawn(handle_connection(
                        stream,
                        dispatcher.clone(),
                        conn_token.clone(),
                    ));
                }
                Err(error) => {
                    warn!(%error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<dyn RequestDispatcher>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::channel::<Frame>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            match write_frame(&mut writer, &frame).await {
                Ok(()) => {}
                Err(GridError::Io(_)) => return,
                Err(error) => warn!(%error, "dropping unencodable response"),
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Frame::Request { seq, receiver, type_tag, body }) => {
                    let dispatcher = dispatcher.clone();
                    let write_tx = write_tx.clone();
                    tokio::spawn(async move {
                        let result = dispatcher.dispatch(receiver, type_tag, body).await;
                        let _ = write_tx.send(Frame::Response { seq, result }).await;
                    });
                }
                Ok(Frame::Response { .. }) => {
                    warn!("unexpected response frame on inbound connection");
                }
                Err(error) => {
                    debug!(%error, "connection closed");
                    break;
                }
            },
        }
    }

    drop(write_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::super::caller::CallerTransport;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl RequestDispatcher for Echo {
        async fn dispatch(
            &self,
            receiver: String,
            type_tag: String,
            body: Vec<u8>,
        ) -> Result<WirePayload, ReplyError> {
            if receiver == "missing" {
                return Err(ReplyError::NotFound);
            }
            Ok(WirePayload { type_tag, body })
        }
    }

    #[tokio::test]
    async fn test_serve_dispatches_and_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_connections(listener, Arc::new(Echo), shutdown.clone()));

        let transport = CallerTransport::new(TIMEOUT);
        let ok = transport
            .call(&addr, "worker", "t", vec![5], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            ok,
            Ok(WirePayload {
                type_tag: "t".into(),
                body: vec![5]
            })
        );

        let miss = transport
            .call(&addr, "missing", "t", vec![], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(miss, Err(ReplyError::NotFound));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let serve = tokio::spawn(serve_connections(listener, Arc::new(Echo), shutdown.clone()));

        shutdown.cancel();
        serve.await.unwrap().unwrap();

        let transport = CallerTransport::new(TIMEOUT);
        let result = transport.call(&addr, "worker", "t", vec![], TIMEOUT).await;
        assert!(matches!(
            result,
            Err(GridError::Unavailable { .. }) | Err(GridError::DeadlineExceeded)
        ));
    }
}
