//! Transport abstraction (C2): the wire-agnostic boundary between the dispatcher and whatever
//! byte stream carries framed JSON-RPC messages. Shaped for the symmetric client-or-server peer
//! this runtime needs: one `send`, plus subscription lists (rather than a blocking `read_request`)
//! so the dispatcher can be notified of inbound messages, transport errors, and closure without
//! owning the read loop itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{FramingError, LspError};
use crate::framing::{encode, DecodeEvent, Decoder};
use crate::subscription::{Disposer, EventEmitter};

/// A pluggable duplex channel carrying framed JSON-RPC messages (§4.2). Implementors only need to
/// get bytes from one side to the other; message framing, classification, and dispatch all live
/// above this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a single already-classified message, framed and flushed before returning.
    async fn send(&self, message: Value) -> Result<(), LspError>;

    /// Registers a handler invoked for every inbound message, once framing has decoded a
    /// complete JSON value. Returns a disposer to unsubscribe.
    async fn subscribe_message(&self, handler: Box<dyn Fn(Value) + Send + Sync>) -> Disposer;

    /// Registers a handler invoked on a non-fatal transport-level error (a malformed frame that
    /// the decoder resynchronized past, or an I/O error on the read side).
    async fn subscribe_error(&self, handler: Box<dyn Fn(LspError) + Send + Sync>) -> Disposer;

    /// Registers a handler invoked exactly once, when the transport closes (either via
    /// `close()`, or because the underlying stream reached EOF / errored terminally).
    async fn subscribe_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Disposer;

    /// Closes the transport. Idempotent.
    async fn close(&self) -> Result<(), LspError>;

    fn is_connected(&self) -> bool;
}

/// Content-Length-framed transport over any `AsyncRead + AsyncWrite` pair — stdio, a duplex
/// socket, a pipe. Spawns one background task that reads, decodes, and fans out to the message
/// and error emitters until EOF or a write-side close.
pub struct FramedTransport {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    messages: Arc<EventEmitter<Value>>,
    errors: Arc<EventEmitter<LspError>>,
    closed: Arc<EventEmitter<()>>,
    connected: std::sync::atomic::AtomicBool,
}

impl FramedTransport {
    /// Spawns the reader task over `reader`/`writer` and returns the shared handle. `reader` is
    /// consumed by the background task; `writer` is held behind a mutex for `send`.
    pub fn spawn<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Arc::new(FramedTransport {
            writer: Mutex::new(Box::new(writer)),
            messages: Arc::new(EventEmitter::new()),
            errors: Arc::new(EventEmitter::new()),
            closed: Arc::new(EventEmitter::new()),
            connected: std::sync::atomic::AtomicBool::new(true),
        });

        let read_loop = transport.clone();
        tokio::spawn(async move {
            read_loop.run_reader(reader).await;
        });

        transport
    }

    async fn run_reader<R: AsyncRead + Send + Unpin>(self: Arc<Self>, mut reader: R) {
        let mut decoder = Decoder::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    self.errors.emit(&LspError::Transport(err)).await;
                    break;
                }
            };

            match decoder.feed(&chunk[..n]) {
                Ok(events) => {
                    for event in events {
                        match event {
                            DecodeEvent::Message(value) => self.messages.emit(&value).await,
                            DecodeEvent::Error(err) => self.errors.emit(&LspError::Framing(err)).await,
                        }
                    }
                }
                Err(FramingError::OversizeMessage { size, cap }) => {
                    self.errors.emit(&LspError::Framing(FramingError::OversizeMessage { size, cap })).await;
                    break;
                }
                Err(err) => {
                    self.errors.emit(&LspError::Framing(err)).await;
                    break;
                }
            }
        }

        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        self.closed.emit(&()).await;
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn send(&self, message: Value) -> Result<(), LspError> {
        if !self.is_connected() {
            return Err(LspError::TransportClosed);
        }
        let framed = encode(&message);
        let mut writer = self.writer.lock().await;
        writer.write_all(&framed).await.map_err(LspError::Transport)?;
        writer.flush().await.map_err(LspError::Transport)?;
        Ok(())
    }

    async fn subscribe_message(&self, handler: Box<dyn Fn(Value) + Send + Sync>) -> Disposer {
        self.messages.subscribe(move |v: &Value| handler(v.clone())).await
    }

    async fn subscribe_error(&self, handler: Box<dyn Fn(LspError) + Send + Sync>) -> Disposer {
        self.errors.subscribe(move |e: &LspError| handler(clone_for_emit(e))).await
    }

    async fn subscribe_close(&self, handler: Box<dyn Fn() + Send + Sync>) -> Disposer {
        self.closed.subscribe(move |_| handler()).await
    }

    async fn close(&self) -> Result<(), LspError> {
        if self.connected.swap(false, std::sync::atomic::Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            self.closed.emit(&()).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// `LspError` doesn't implement `Clone` (its `Transport` variant wraps a non-`Clone`
/// `std::io::Error`); error emission only ever needs a human-readable stand-in for fan-out to
/// multiple subscribers, so this degrades anything not cheaply cloneable to its `Display` text.
fn clone_for_emit(error: &LspError) -> LspError {
    match error {
        LspError::TransportClosed => LspError::TransportClosed,
        LspError::Disconnected => LspError::Disconnected,
        LspError::Framing(inner) => LspError::Framing(inner.clone()),
        other => LspError::Protocol(other.to_string()),
    }
}

/// Builds a [`FramedTransport`] over the process's stdin/stdout, matching the most common LSP
/// deployment shape (a language server launched as a child process).
pub fn stdio() -> Arc<FramedTransport> {
    FramedTransport::spawn(tokio::io::stdin(), tokio::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_and_receive_round_trip_over_duplex_pipe() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let client = FramedTransport::spawn(client_read, client_write);
        let server = FramedTransport::spawn(server_read, server_write);

        let received = Arc::new(StdMutex::new(None));
        let received_clone = received.clone();
        let _disposer = server
            .subscribe_message(Box::new(move |v| *received_clone.lock().unwrap() = Some(v)))
            .await;

        client.send(serde_json::json!({"jsonrpc":"2.0","method":"ping","params":null})).await.unwrap();

        for _ in 0..50 {
            if received.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            received.lock().unwrap().clone().unwrap(),
            serde_json::json!({"jsonrpc":"2.0","method":"ping","params":null})
        );
    }

    #[tokio::test]
    async fn close_fires_close_subscribers_and_rejects_further_sends() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_server_read, server_write) = tokio::io::split(server_io);
        let _keep_server_write_alive = server_write;

        let client = FramedTransport::spawn(client_read, client_write);
        let closed = Arc::new(StdMutex::new(false));
        let closed_clone = closed.clone();
        let _disposer = client.subscribe_close(Box::new(move || *closed_clone.lock().unwrap() = true)).await;

        client.close().await.unwrap();
        tokio::task::yield_now().await;

        assert!(*closed.lock().unwrap());
        assert!(!client.is_connected());
        assert!(matches!(client.send(serde_json::json!({})).await, Err(LspError::TransportClosed)));
    }

    #[tokio::test]
    async fn eof_on_read_side_marks_transport_disconnected() {
        let (client_io, server_io) = duplex(4096);
        drop(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = FramedTransport::spawn(client_read, client_write);

        for _ in 0..50 {
            if !client.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!client.is_connected());
    }
}
