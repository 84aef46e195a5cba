use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chatline_core::DeliveryPayload;
use chatline_telemetry::MetricsRecorder;

use crate::config::DeliveryScope;
use crate::metric;
use crate::registry::ConnectionRegistry;

/// Producer side of the dispatch queue. Cheap to clone; submission never blocks.
///
/// The queue is unbounded. Its current depth is tracked and published as the
/// `dispatch_queue_depth` gauge.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DeliveryPayload>,
    depth: Arc<AtomicUsize>,
    metrics: Arc<MetricsRecorder>,
}

impl DispatchQueue {
    /// Enqueue a payload. Returns false if the dispatcher has stopped.
    pub fn submit(&self, payload: DeliveryPayload) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(payload).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("Dispatcher stopped, dropping payload");
            return false;
        }
        self.metrics
            .gauge_set(metric::DISPATCH_QUEUE_DEPTH, depth as i64);
        true
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Outcome of writing one payload to the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Connections excluded by the delivery scope.
    pub skipped: usize,
    /// Connections whose write failed; each was deregistered and closed.
    pub failed: usize,
}

/// The single consumer of the dispatch queue.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<DeliveryPayload>,
    depth: Arc<AtomicUsize>,
    registry: Arc<ConnectionRegistry>,
    scope: DeliveryScope,
    write_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
}

/// Create a connected queue and dispatcher.
pub fn channel(
    registry: Arc<ConnectionRegistry>,
    scope: DeliveryScope,
    write_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
) -> (DispatchQueue, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let queue = DispatchQueue {
        tx,
        depth: Arc::clone(&depth),
        metrics: Arc::clone(&metrics),
    };
    let dispatcher = Dispatcher {
        rx,
        depth,
        registry,
        scope,
        write_timeout,
        metrics,
    };
    (queue, dispatcher)
}

impl Dispatcher {
    /// Drain the queue in submission order until cancelled or every
    /// [`DispatchQueue`] is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(scope = %self.scope, "Dispatcher started");
        loop {
            let payload = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let depth = self.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            self.metrics
                .gauge_set(metric::DISPATCH_QUEUE_DEPTH, depth as i64);

            let report = self.deliver(&payload).await;
            tracing::debug!(
                messages = payload.len(),
                delivered = report.delivered,
                skipped = report.skipped,
                failed = report.failed,
                "Payload dispatched"
            );
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Write one payload to every registered connection the scope admits.
    ///
    /// A failed or timed-out write deregisters and closes that connection
    /// and delivery carries on with the rest.
    pub async fn deliver(&self, payload: &DeliveryPayload) -> DeliveryReport {
        let body = match payload.to_wire() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize delivery payload");
                return DeliveryReport::default();
            }
        };
        self.metrics.counter_inc(metric::PAYLOADS_DISPATCHED, 1);

        let body = body.as_str();
        let scope = self.scope;
        let write_timeout = self.write_timeout;
        let registry = &*self.registry;
        let metrics = &*self.metrics;
        let delivered = &AtomicUsize::new(0);
        let skipped = &AtomicUsize::new(0);
        let failed = &AtomicUsize::new(0);

        registry
            .for_each(|conn| async move {
                if !scope.admits(&conn, payload) {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match conn.send_text(body, write_timeout).await {
                    Ok(()) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            connection_id = %conn.id(),
                            error = %e,
                            "Delivery failed, dropping connection"
                        );
                        if registry.retire(&conn).await {
                            metric::connection_closed(metrics, registry.count());
                        }
                    }
                }
            })
            .await;

        let report = DeliveryReport {
            delivered: delivered.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };
        metrics.counter_inc(metric::DELIVERIES, report.delivered as u64);
        metrics.counter_inc(metric::DELIVERY_FAILURES, report.failed as u64);
        report
    }
}
