use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use chatline_core::ids::{ConnectionId, UserId};
use chatline_store::MessageStore;
use chatline_telemetry::MetricsRecorder;

use crate::config::ServerConfig;
use crate::dispatcher::{self, Dispatcher};
use crate::history::HistoryAssembler;
use crate::ingress::{IngressContext, IngressHandler};
use crate::metric;
use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::{FrameSink, FrameSource};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Entry point into the real-time core: accepts connections, owns the
/// registry and dispatch queue, and tracks every background task.
#[derive(Clone)]
pub struct Hub {
    ctx: IngressContext,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Hub {
    /// Build a hub and the dispatcher that drains its queue. The dispatcher
    /// must be started with [`spawn_dispatcher`](Self::spawn_dispatcher) or
    /// [`Dispatcher::run`].
    pub fn new(
        store: Arc<dyn MessageStore>,
        config: &ServerConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> (Self, Dispatcher) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (queue, dispatcher) = dispatcher::channel(
            Arc::clone(&registry),
            config.delivery_scope,
            config.write_timeout,
            Arc::clone(&metrics),
        );
        let ctx = IngressContext {
            registry,
            assembler: HistoryAssembler::new(Arc::clone(&store)),
            store,
            queue,
            metrics,
            heartbeat_interval: config.heartbeat_interval,
            write_timeout: config.write_timeout,
        };
        let hub = Self {
            ctx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        (hub, dispatcher)
    }

    /// Register an already-authenticated connection and start its ingress task.
    pub fn accept_connection(
        &self,
        user: Option<UserId>,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> ConnectionId {
        let connection = Arc::new(Connection::new(user, sink, self.cancel.child_token()));
        let id = connection.id().clone();
        let span = tracing::info_span!(
            "connection",
            connection_id = id.as_str(),
            user_id = connection.user().map(UserId::as_str),
        );

        self.ctx.registry.register(Arc::clone(&connection));
        self.ctx
            .metrics
            .gauge_set(metric::CONNECTIONS, self.ctx.registry.count() as i64);
        span.in_scope(|| tracing::info!("Client connected"));

        let handler = IngressHandler::new(connection, source, self.ctx.clone());
        self.tasks.spawn(handler.run().instrument(span));
        id
    }

    /// Run the dispatcher until shutdown.
    pub fn spawn_dispatcher(&self, dispatcher: Dispatcher) {
        self.tasks.spawn(dispatcher.run(self.cancel.clone()));
    }

    /// Periodically drop connections that have stopped answering pings.
    pub fn spawn_reaper(&self, interval: Duration, client_timeout: Duration) {
        let registry = Arc::clone(&self.ctx.registry);
        let metrics = Arc::clone(&self.ctx.metrics);
        let cancel = self.cancel.clone();
        let interval = interval.max(Duration::from_millis(1));

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for id in registry.unresponsive(client_timeout) {
                    if let Some(conn) = registry.deregister(&id) {
                        tracing::warn!(connection_id = %id, "Reaping unresponsive client");
                        conn.close().await;
                        metric::connection_closed(&metrics, registry.count());
                    }
                }
            }
        });
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.ctx.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.ctx.metrics
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.registry.count()
    }

    pub fn queue_depth(&self) -> usize {
        self.ctx.queue.depth()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the dispatcher and every ingress task, then deregister and close
    /// whatever connections remain.
    pub async fn shutdown(&self) {
        tracing::info!(connections = self.connection_count(), "Hub shutting down");
        self.cancel.cancel();
        self.tasks.close();

        for conn in self.ctx.registry.snapshot() {
            if self.ctx.registry.retire(&conn).await {
                metric::connection_closed(&self.ctx.metrics, self.ctx.registry.count());
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait()).await.is_err() {
            tracing::warn!(remaining = self.tasks.len(), "Tasks still running after shutdown grace period");
        }
    }
}
