pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod history;
pub mod hub;
pub mod ingress;
pub mod registry;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AllowAnonymous, AuthError, Authenticator, Credentials, SharedTokenAuthenticator};
pub use config::{DeliveryScope, ServerConfig};
pub use dispatcher::{DeliveryReport, DispatchQueue, Dispatcher};
pub use history::HistoryAssembler;
pub use hub::Hub;
pub use registry::{Connection, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerHandle};

/// Names recorded in the hub's [`MetricsRecorder`](chatline_telemetry::MetricsRecorder).
pub mod metric {
    use chatline_telemetry::MetricsRecorder;

    pub const MESSAGES_RECEIVED: &str = "messages_received";
    pub const MESSAGES_PERSISTED: &str = "messages_persisted";
    pub const STORE_FAILURES: &str = "store_failures";
    pub const PAYLOADS_DISPATCHED: &str = "payloads_dispatched";
    pub const DELIVERIES: &str = "deliveries";
    pub const DELIVERY_FAILURES: &str = "delivery_failures";
    pub const CONNECTIONS_CLOSED: &str = "connections_closed";

    pub const CONNECTIONS: &str = "connections";
    pub const DISPATCH_QUEUE_DEPTH: &str = "dispatch_queue_depth";

    pub(crate) fn connection_closed(metrics: &MetricsRecorder, remaining: usize) {
        metrics.counter_inc(CONNECTIONS_CLOSED, 1);
        metrics.gauge_set(CONNECTIONS, remaining as i64);
    }
}
