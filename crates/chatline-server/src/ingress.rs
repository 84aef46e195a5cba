//! Per-connection read loop.
//!
//! Each inbound frame is decoded, validated, persisted, and turned into a
//! history payload for the dispatcher. Store and validation failures drop
//! that one message and keep the connection open. Transport and decode
//! failures end the loop; the connection is then deregistered and closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use chatline_core::ids::MessageId;
use chatline_core::{InboundMessage, NewMessage, ValidationError};
use chatline_store::{MessageStore, StoreError};
use chatline_telemetry::MetricsRecorder;

use crate::dispatcher::DispatchQueue;
use crate::history::HistoryAssembler;
use crate::metric;
use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::{FrameSource, Inbound, TransportError};

/// Shared collaborators handed to every ingress task.
#[derive(Clone)]
pub struct IngressContext {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub assembler: HistoryAssembler,
    pub queue: DispatchQueue,
    pub metrics: Arc<MetricsRecorder>,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
}

/// Errors that end a connection's read loop.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What happened to one well-formed inbound frame.
#[derive(Debug)]
pub enum Outcome {
    /// Persisted, and its history was queued for delivery.
    Delivered { message_id: MessageId, history: usize },
    Rejected(ValidationError),
    NotPersisted(StoreError),
    /// Persisted, but the history query failed so nothing was delivered.
    NotAssembled(StoreError),
}

pub struct IngressHandler {
    connection: Arc<Connection>,
    source: Box<dyn FrameSource>,
    ctx: IngressContext,
}

impl IngressHandler {
    pub fn new(connection: Arc<Connection>, source: Box<dyn FrameSource>, ctx: IngressContext) -> Self {
        Self {
            connection,
            source,
            ctx,
        }
    }

    /// Read until the transport fails, a frame cannot be decoded, or the
    /// connection is cancelled. Always leaves the connection deregistered
    /// and closed.
    pub async fn run(mut self) {
        let cancel = self.connection.cancelled().clone();
        let interval = self.ctx.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit: Option<IngressError> = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.connection.ping(self.ctx.write_timeout).await {
                        break Some(e.into());
                    }
                }
                frame = self.source.recv() => match frame {
                    Ok(Inbound::Pong) => self.connection.record_pong(),
                    Ok(Inbound::Text(text)) => {
                        if let Err(e) = self.process(&text) {
                            break Some(e);
                        }
                    }
                    Err(e) => break Some(e.into()),
                },
            }
        };

        match &exit {
            None => tracing::debug!("Connection cancelled"),
            Some(IngressError::Transport(TransportError::Closed)) => {
                tracing::info!("Client disconnected");
            }
            Some(e) => tracing::warn!(error = %e, "Closing connection"),
        }

        if self.ctx.registry.retire(&self.connection).await {
            metric::connection_closed(&self.ctx.metrics, self.ctx.registry.count());
        }
    }

    /// Handle one text frame. Only a decode failure is returned as an error.
    pub fn process(&self, text: &str) -> Result<Outcome, IngressError> {
        self.ctx.metrics.counter_inc(metric::MESSAGES_RECEIVED, 1);
        let inbound: InboundMessage = serde_json::from_str(text)?;

        let new = match NewMessage::try_from(inbound) {
            Ok(new) => new,
            Err(e) => {
                tracing::warn!(error = %e, kind = e.error_kind(), "Rejected inbound message");
                return Ok(Outcome::Rejected(e));
            }
        };

        let message = match self.ctx.store.create(&new) {
            Ok(message) => message,
            Err(e) => {
                self.ctx.metrics.counter_inc(metric::STORE_FAILURES, 1);
                tracing::error!(error = %e, kind = e.error_kind(), "Failed to persist message");
                return Ok(Outcome::NotPersisted(e));
            }
        };
        self.ctx.metrics.counter_inc(metric::MESSAGES_PERSISTED, 1);

        let payload = match self.ctx.assembler.assemble_for(&message) {
            Ok(payload) => payload,
            Err(e) => {
                self.ctx.metrics.counter_inc(metric::STORE_FAILURES, 1);
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    kind = e.error_kind(),
                    "Failed to assemble history"
                );
                return Ok(Outcome::NotAssembled(e));
            }
        };

        let history = payload.len();
        tracing::debug!(message_id = %message.id, history, "Queued history for delivery");
        self.ctx.queue.submit(payload);
        Ok(Outcome::Delivered {
            message_id: message.id,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryScope;
    use crate::dispatcher::{self, Dispatcher};
    use crate::testing::{attach, FlakyStore};
    use crate::transport::memory::RemotePeer;
    use chatline_core::ids::UserId;
    use chatline_core::InboundMessage;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_millis(500);

    fn context(store: Arc<FlakyStore>) -> (IngressContext, Dispatcher) {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let (queue, dispatcher) = dispatcher::channel(
            Arc::clone(&registry),
            DeliveryScope::All,
            Duration::from_secs(1),
            Arc::clone(&metrics),
        );
        let store: Arc<dyn MessageStore> = store;
        let ctx = IngressContext {
            registry,
            assembler: HistoryAssembler::new(Arc::clone(&store)),
            store,
            queue,
            metrics,
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(1),
        };
        (ctx, dispatcher)
    }

    fn spawn_handler(
        ctx: &IngressContext,
        user: Option<&str>,
    ) -> (Arc<Connection>, RemotePeer, tokio::task::JoinHandle<()>) {
        let (conn, source, peer) = attach(&ctx.registry, user);
        let handler = IngressHandler::new(Arc::clone(&conn), Box::new(source), ctx.clone());
        (conn, peer, tokio::spawn(handler.run()))
    }

    #[tokio::test]
    async fn message_is_persisted_and_history_broadcast() {
        let store = FlakyStore::new();
        let (ctx, dispatcher) = context(Arc::clone(&store));
        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.run(cancel.clone()));

        let (_a, mut peer_a, _) = spawn_handler(&ctx, None);
        let (_b, _peer_b, _task_b) = spawn_handler(&ctx, None);
        let (c, source_c, mut peer_c) = attach(&ctx.registry, None);
        drop(source_c);

        peer_a.send_json(&InboundMessage::direct("u1", "u2", "hi"));

        for peer in [&mut peer_a, &mut peer_c] {
            let text = peer.next_text(WAIT).await.unwrap();
            let body: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
            assert_eq!(body.len(), 1);
            assert_eq!(body[0]["sender_id"], "u1");
            assert_eq!(body[0]["receiver_id"], "u2");
            assert_eq!(body[0]["content"], "hi");
        }
        assert_eq!(store.creates(), 1);
        let history = store
            .conversation(&UserId::from_raw("u1"), &UserId::from_raw("u2"))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(ctx.registry.contains(c.id()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn store_outage_keeps_connection_open() {
        let store = FlakyStore::new();
        let (ctx, dispatcher) = context(Arc::clone(&store));
        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.run(cancel.clone()));

        let (conn, mut peer, _) = spawn_handler(&ctx, None);

        store.fail_creates(true);
        peer.send_json(&InboundMessage::direct("u1", "u2", "lost"));
        assert!(peer.next_text(Duration::from_millis(100)).await.is_none());
        assert!(ctx.registry.contains(conn.id()));
        assert_eq!(ctx.queue.depth(), 0);

        store.fail_creates(false);
        peer.send_json(&InboundMessage::direct("u1", "u2", "kept"));
        let text = peer.next_text(WAIT).await.unwrap();
        let body: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0]["content"], "kept");
        assert_eq!(ctx.metrics.counter_get(metric::STORE_FAILURES), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn read_error_deregisters_once() {
        let (ctx, _dispatcher) = context(FlakyStore::new());
        let (conn, peer, task) = spawn_handler(&ctx, None);
        assert_eq!(ctx.registry.count(), 1);

        peer.fail_read(TransportError::Read("connection reset".into()));
        task.await.unwrap();

        assert!(!ctx.registry.contains(conn.id()));
        assert!(conn.is_closed());
        assert!(peer.is_closed());
        assert_eq!(ctx.metrics.counter_get(metric::CONNECTIONS_CLOSED), 1);

        // A late write failure on the same connection finds nothing to remove.
        assert!(!ctx.registry.retire(&conn).await);
        assert_eq!(ctx.metrics.counter_get(metric::CONNECTIONS_CLOSED), 1);
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let (ctx, _dispatcher) = context(FlakyStore::new());
        let (conn, peer, task) = spawn_handler(&ctx, None);

        peer.send_text("{not json");
        task.await.unwrap();
        assert!(!ctx.registry.contains(conn.id()));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn invalid_recipient_is_rejected_not_fatal() {
        let store = FlakyStore::new();
        let (ctx, _dispatcher) = context(Arc::clone(&store));
        let (conn, source, _peer) = attach(&ctx.registry, None);
        let handler = IngressHandler::new(Arc::clone(&conn), Box::new(source), ctx.clone());

        let neither = serde_json::json!({"sender_id": "u1", "content": "x"}).to_string();
        assert!(matches!(
            handler.process(&neither).unwrap(),
            Outcome::Rejected(ValidationError::MissingRecipient)
        ));
        let both = serde_json::json!({
            "sender_id": "u1", "receiver_id": "u2", "chatroom_id": "lobby", "content": "x"
        })
        .to_string();
        assert!(matches!(
            handler.process(&both).unwrap(),
            Outcome::Rejected(ValidationError::AmbiguousRecipient)
        ));
        assert_eq!(store.creates(), 0);
        assert!(ctx.registry.contains(conn.id()));
    }

    #[tokio::test]
    async fn query_failure_drops_delivery_only() {
        let store = FlakyStore::new();
        let (ctx, _dispatcher) = context(Arc::clone(&store));
        let (conn, source, _peer) = attach(&ctx.registry, None);
        let handler = IngressHandler::new(conn, Box::new(source), ctx.clone());

        store.fail_queries(true);
        let outcome = handler
            .process(&serde_json::to_string(&InboundMessage::direct("u1", "u2", "hi")).unwrap())
            .unwrap();
        assert!(matches!(outcome, Outcome::NotAssembled(_)));
        assert_eq!(ctx.queue.depth(), 0);
        assert_eq!(ctx.metrics.counter_get(metric::MESSAGES_PERSISTED), 1);
    }

    #[tokio::test]
    async fn room_message_queues_room_history() {
        let (ctx, _dispatcher) = context(FlakyStore::new());
        let (conn, source, _peer) = attach(&ctx.registry, None);
        let handler = IngressHandler::new(conn, Box::new(source), ctx.clone());

        for text in ["one", "two"] {
            let frame = serde_json::to_string(&InboundMessage::to_room("u1", "lobby", text)).unwrap();
            handler.process(&frame).unwrap();
        }
        let frame = serde_json::to_string(&InboundMessage::to_room("u2", "lobby", "three")).unwrap();
        match handler.process(&frame).unwrap() {
            Outcome::Delivered { history, .. } => assert_eq!(history, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctx.queue.depth(), 3);
    }

    #[tokio::test]
    async fn pong_keeps_connection_alive() {
        let (ctx, _dispatcher) = context(FlakyStore::new());
        let (conn, peer, _) = spawn_handler(&ctx, None);
        peer.send_pong();
        tokio::task::yield_now().await;
        assert!(conn.is_alive(Duration::from_secs(90)));
        assert!(ctx.registry.contains(conn.id()));
    }

    #[tokio::test]
    async fn cancellation_closes_connection() {
        let (ctx, _dispatcher) = context(FlakyStore::new());
        let (conn, peer, task) = spawn_handler(&ctx, None);
        conn.cancelled().cancel();
        task.await.unwrap();
        assert!(!ctx.registry.contains(conn.id()));
        assert!(peer.is_closed());
    }
}
