//! Framed, bidirectional transport behind each connection.
//!
//! The read half ([`FrameSource`]) is owned by the connection's ingress task;
//! the write half ([`FrameSink`]) lives inside the registered
//! [`Connection`](crate::registry::Connection) and is shared with the
//! dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

/// A frame read from the remote client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("undecodable frame: {0}")]
    Decode(String),
}

/// Read half of a connection. `recv` must be cancel-safe: the ingress loop
/// races it against heartbeats and shutdown.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Inbound, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self);
}

pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

pub struct WsSink {
    sink: SplitSink<WebSocket, WsMessage>,
}

/// Split an upgraded socket into its read and write halves.
pub fn split_websocket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { stream }, WsSink { sink })
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
                None => return Err(TransportError::Closed),
            };
            match frame {
                WsMessage::Text(text) => return Ok(Inbound::Text(text.to_string())),
                WsMessage::Binary(bytes) => {
                    return String::from_utf8(bytes.to_vec())
                        .map(Inbound::Text)
                        .map_err(|e| TransportError::Decode(e.to_string()));
                }
                WsMessage::Pong(_) => return Ok(Inbound::Pong),
                WsMessage::Close(_) => return Err(TransportError::Closed),
                // axum answers pings itself
                WsMessage::Ping(_) => {}
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text.to_owned().into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Ping(Vec::new().into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// In-process transport driven from the other end by a [`RemotePeer`].
pub mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{FrameSink, FrameSource, Inbound, TransportError};

    /// What the server wrote to a memory connection.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Outbound {
        Text(String),
        Ping,
        Close,
    }

    #[derive(Default)]
    struct Faults {
        fail_writes: AtomicBool,
        stall_writes: AtomicBool,
        closed: AtomicBool,
    }

    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    }

    pub struct MemorySink {
        tx: mpsc::UnboundedSender<Outbound>,
        faults: Arc<Faults>,
    }

    /// The client side of a memory connection.
    pub struct RemotePeer {
        inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        faults: Arc<Faults>,
    }

    pub fn pair() -> (MemorySource, MemorySink, RemotePeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let faults = Arc::new(Faults::default());
        (
            MemorySource { rx: in_rx },
            MemorySink {
                tx: out_tx,
                faults: Arc::clone(&faults),
            },
            RemotePeer {
                inbound: in_tx,
                outbound: out_rx,
                faults,
            },
        )
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> Result<Inbound, TransportError> {
            match self.rx.recv().await {
                Some(frame) => frame,
                None => Err(TransportError::Closed),
            }
        }
    }

    impl MemorySink {
        async fn write(&mut self, frame: Outbound) -> Result<(), TransportError> {
            if self.faults.stall_writes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.faults.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Write("broken pipe".into()));
            }
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.write(Outbound::Text(text.to_owned())).await
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.write(Outbound::Ping).await
        }

        async fn close(&mut self) {
            self.faults.closed.store(true, Ordering::SeqCst);
            let _ = self.tx.send(Outbound::Close);
        }
    }

    impl RemotePeer {
        pub fn send_text(&self, text: impl Into<String>) {
            let _ = self.inbound.send(Ok(Inbound::Text(text.into())));
        }

        pub fn send_json<T: serde::Serialize>(&self, value: &T) {
            let text = serde_json::to_string(value).unwrap_or_default();
            self.send_text(text);
        }

        pub fn send_pong(&self) {
            let _ = self.inbound.send(Ok(Inbound::Pong));
        }

        /// Make the server's next read fail with `err`.
        pub fn fail_read(&self, err: TransportError) {
            let _ = self.inbound.send(Err(err));
        }

        /// Every subsequent server write fails.
        pub fn break_writes(&self) {
            self.faults.fail_writes.store(true, Ordering::SeqCst);
        }

        /// Every subsequent server write hangs forever.
        pub fn stall_writes(&self) {
            self.faults.stall_writes.store(true, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.faults.closed.load(Ordering::SeqCst)
        }

        /// Next text frame written by the server, skipping pings.
        pub async fn next_text(&mut self, wait: Duration) -> Option<String> {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                match tokio::time::timeout_at(deadline, self.outbound.recv()).await {
                    Ok(Some(Outbound::Text(text))) => return Some(text),
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => return None,
                }
            }
        }

        /// Everything written so far, without waiting.
        pub fn drain(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }
}
