//! Outbound call side of the transport.
//!
//! One multiplexed connection per target address. Each connection is a task
//! owning the socket; callers hand it an outbound request and await a
//! oneshot for the correlated response. A connection that dies fails every
//! call pending on it with `unavailable`, and the next call dials afresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::GridError;

use super::wire::{encode_frame, read_frame, Frame, ReplyError, WirePayload};

/// The peer's verdict for one call.
pub(crate) type CallResult = Result<WirePayload, ReplyError>;

struct Outbound {
    seq: u64,
    receiver: String,
    type_tag: String,
    body: Vec<u8>,
    reply: oneshot::Sender<CallResult>,
}

/// Client-side transport: dials, pools, and multiplexes connections.
#[derive(Debug)]
pub(crate) struct CallerTransport {
    dial_timeout: Duration,
    next_seq: AtomicU64,
    conns: Mutex<HashMap<String, mpsc::Sender<Outbound>>>,
}

impl CallerTransport {
    pub(crate) fn new(dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            next_seq: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Perform one call, bounded by `timeout`.
    ///
    /// The outer error is transport-level (`Unavailable`,
    /// `DeadlineExceeded`); the inner result is the peer's verdict,
    /// carried verbatim.
    pub(crate) async fn call(
        &self,
        addr: &str,
        receiver: &str,
        type_tag: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<CallResult, GridError> {
        match tokio::time::timeout(timeout, self.call_inner(addr, receiver, type_tag, body)).await
        {
            Ok(result) => result,
            Err(_) => Err(GridError::DeadlineExceeded),
        }
    }

    async fn call_inner(
        &self,
        addr: &str,
        receiver: &str,
        type_tag: &str,
        body: Vec<u8>,
    ) -> Result<CallResult, GridError> {
        // Two passes: the first may pick up a pooled connection that died
        // since its last use; the second always dials afresh.
        for _ in 0..2 {
            let conn = self.connection(addr).await?;
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let (reply_tx, reply_rx) = oneshot::channel();
            let outbound = Outbound {
                seq,
                receiver: receiver.to_string(),
                type_tag: type_tag.to_string(),
                body: body.clone(),
                reply: reply_tx,
            };
            if conn.send(outbound).await.is_err() {
                self.discard(addr, &conn);
                continue;
            }
            match reply_rx.await {
                Ok(result) => return Ok(result),
                Err(_) => {
                    // Connection died with the call in flight; the request
                    // may or may not have been processed, so no blind retry.
                    self.discard(addr, &conn);
                    return Err(GridError::Unavailable {
                        reason: format!("connection to {addr} closed mid-call"),
                    });
                }
            }
        }
        Err(GridError::Unavailable {
            reason: format!("could not reach {addr}"),
        })
    }

    async fn connection(&self, addr: &str) -> Result<mpsc::Sender<Outbound>, GridError> {
        if let Some(tx) = self.conns.lock().expect("transport lock poisoned").get(addr) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| GridError::Unavailable {
                reason: format!("dial timeout connecting to {addr}"),
            })?
            .map_err(|e| GridError::Unavailable {
                reason: format!("connect to {addr} failed: {e}"),
            })?;
        debug!(addr, "connected");

        let (tx, rx) = mpsc::channel(64);
        let mut conns = self.conns.lock().expect("transport lock poisoned");
        match conns.get(addr) {
            // Someone else connected while we dialed; use theirs and let our
            // fresh socket drop.
            Some(existing) if !existing.is_closed() => Ok(existing.clone()),
            _ => {
                conns.insert(addr.to_string(), tx.clone());
                tokio::spawn(run_connection(stream, rx));
                Ok(tx)
            }
        }
    }

    fn discard(&self, addr: &str, conn: &mpsc::Sender<Outbound>) {
        let mut conns = self.conns.lock().expect("transport lock poisoned");
        if let Some(current) = conns.get(addr) {
            if current.same_channel(conn) {
                conns.remove(addr);
            }
        }
    }
}

/// Own one socket: write requests, match responses to pending calls.
///
/// Dropping the pending map on exit wakes every waiting caller with a
/// closed-channel error, which surfaces as `unavailable`.
async fn run_connection(stream: TcpStream, mut out_rx: mpsc::Receiver<Outbound>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending: HashMap<u64, oneshot::Sender<CallResult>> = HashMap::new();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(outbound) = outbound else { break };
                let frame = Frame::Request {
                    seq: outbound.seq,
                    receiver: outbound.receiver,
                    type_tag: outbound.type_tag,
                    body: outbound.body,
                };
                match encode_frame(&frame) {
                    Ok(buf) => {
                        pending.insert(outbound.seq, outbound.reply);
                        if writer.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "dropping unencodable request");
                    }
                }
            }
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Frame::Response { seq, result }) => {
                        if let Some(reply) = pending.remove(&seq) {
                            let _ = reply.send(result);
                        }
                    }
                    Ok(Frame::Request { .. }) => {
                        warn!("unexpected request frame on outbound connection");
                    }
                    Err(error) => {
                        debug!(%error, "connection closed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::super::wire::write_frame;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Accept loop that answers every request with `make_result`.
    async fn echo_server(
        listener: TcpListener,
        make_result: fn(u64, String, Vec<u8>) -> CallResult,
    ) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                while let Ok(frame) = read_frame(&mut reader).await {
                    if let Frame::Request { seq, type_tag, body, .. } = frame {
                        let frame = Frame::Response {
                            seq,
                            result: make_result(seq, type_tag, body),
                        };
                        if write_frame(&mut writer, &frame).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(echo_server(listener, |_, type_tag, body| {
            Ok(WirePayload { type_tag, body })
        }));

        let transport = CallerTransport::new(TIMEOUT);
        let result = transport
            .call(&addr, "worker-1", "t", vec![9, 9], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            result,
            Ok(WirePayload {
                type_tag: "t".into(),
                body: vec![9, 9]
            })
        );
    }

    #[tokio::test]
    async fn test_peer_error_carried_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(echo_server(listener, |_, _, _| Err(ReplyError::NotFound)));

        let transport = CallerTransport::new(TIMEOUT);
        let result = transport
            .call(&addr, "worker-1", "t", vec![], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result, Err(ReplyError::NotFound));
    }

    #[tokio::test]
    async fn test_unreachable_address_is_unavailable() {
        let transport = CallerTransport::new(TIMEOUT);
        // Bind-then-drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = transport.call(&addr, "worker-1", "t", vec![], TIMEOUT).await;
        assert!(matches!(result, Err(GridError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and read, but never answer.
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let transport = CallerTransport::new(TIMEOUT);
        let result = transport
            .call(&addr, "worker-1", "t", vec![], Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(GridError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_concurrent_calls_multiplex_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(echo_server(listener, |_, type_tag, body| {
            Ok(WirePayload { type_tag, body })
        }));

        let transport = std::sync::Arc::new(CallerTransport::new(TIMEOUT));
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let transport = transport.clone();
            let addr = addr.clone();
            handles.push(tokio::spawn(async move {
                transport.call(&addr, "w", "t", vec![i], TIMEOUT).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(
                result,
                Ok(WirePayload {
                    type_tag: "t".into(),
                    body: vec![i as u8]
                })
            );
        }
    }
}
