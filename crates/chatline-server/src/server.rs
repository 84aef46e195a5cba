use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use chatline_store::MessageStore;
use chatline_telemetry::MetricsRecorder;

use crate::auth::{bearer_token, Authenticator, Credentials};
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::transport::split_websocket;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub auth: Arc<dyn Authenticator>,
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
    user_id: Option<String>,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the hub's background tasks and serve HTTP. Returns a handle to shut
/// everything down.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn Authenticator>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let (hub, dispatcher) = Hub::new(store, &config, metrics);
    hub.spawn_dispatcher(dispatcher);
    hub.spawn_reaper(config.reap_interval, config.client_timeout);

    let router = build_router(AppState {
        hub: hub.clone(),
        auth,
    });

    let stop = CancellationToken::new();
    let signal = stop.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    tracing::info!(
        %addr,
        scope = %config.delivery_scope,
        "Chatline server started"
    );

    Ok(ServerHandle {
        addr,
        hub,
        stop,
        server,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: Hub,
    stop: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Close every connection, stop the dispatcher, then stop accepting HTTP.
    pub async fn shutdown(self) {
        self.hub.shutdown().await;
        self.stop.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "HTTP server task ended abnormally");
        }
        tracing::info!("Chatline server stopped");
    }
}

/// Authenticate, then upgrade. Rejected clients never reach the registry.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let credentials = Credentials {
        bearer: bearer_token(&headers),
        query_token: params.token.as_deref(),
        user_id: params.user_id.as_deref(),
    };
    let user = match state.auth.authenticate(&credentials) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected WebSocket upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    if state.hub.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let (source, sink) = split_websocket(socket);
        state
            .hub
            .accept_connection(user, Box::new(source), Box::new(sink));
    })
}

/// Health check. 503 when the store cannot be reached.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hub = &state.hub;
    let store = hub.store().health();
    let (http_status, status) = if store.is_up() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = serde_json::json!({
        "status": status,
        "connections": hub.connection_count(),
        "queue_depth": hub.queue_depth(),
        "store": store,
        "metrics": hub.metrics().snapshot(),
    });
    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chatline_core::InboundMessage;
    use futures::{SinkExt, StreamExt};
    use secrecy::SecretString;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

    use crate::auth::{AllowAnonymous, SharedTokenAuthenticator};
    use crate::testing::FlakyStore;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    async fn serve(store: Arc<FlakyStore>, auth: Arc<dyn Authenticator>) -> ServerHandle {
        start(config(), store, auth, Arc::new(MetricsRecorder::new()))
            .await
            .unwrap()
    }

    async fn next_json<S>(ws: &mut S) -> Vec<serde_json::Value>
    where
        S: futures::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_for_connections(handle: &ServerHandle, n: usize) {
        tokio::time::timeout(WAIT, async {
            while handle.hub().connection_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn health_reports_store_and_connections() {
        let store = FlakyStore::new();
        let handle = serve(Arc::clone(&store), Arc::new(AllowAnonymous)).await;
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["store"]["status"], "up");

        store.fail_queries(true);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "degraded");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn websocket_message_is_broadcast_to_every_client() {
        let handle = serve(FlakyStore::new(), Arc::new(AllowAnonymous)).await;
        let base = format!("ws://127.0.0.1:{}/ws", handle.port());

        let (mut a, _) = tokio_tungstenite::connect_async(format!("{base}?user_id=u1"))
            .await
            .unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(format!("{base}?user_id=u2"))
            .await
            .unwrap();
        let (mut c, _) = tokio_tungstenite::connect_async(base.clone()).await.unwrap();
        wait_for_connections(&handle, 3).await;

        let frame = serde_json::to_string(&InboundMessage::direct("u1", "u2", "hi")).unwrap();
        a.send(WsMessage::Text(frame.into())).await.unwrap();

        for ws in [&mut a, &mut b, &mut c] {
            let body = next_json(ws).await;
            assert_eq!(body.len(), 1);
            assert_eq!(body[0]["sender_id"], "u1");
            assert_eq!(body[0]["receiver_id"], "u2");
            assert_eq!(body[0]["content"], "hi");
            assert!(body[0]["id"].as_str().unwrap().starts_with("msg_"));
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn client_disconnect_is_deregistered() {
        let handle = serve(FlakyStore::new(), Arc::new(AllowAnonymous)).await;
        let url = format!("ws://127.0.0.1:{}/ws", handle.port());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        wait_for_connections(&handle, 1).await;
        ws.close(None).await.unwrap();
        wait_for_connections(&handle, 0).await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shared_token_guards_upgrade() {
        let auth = SharedTokenAuthenticator::new(&SecretString::from("s3cret".to_string()));
        let handle = serve(FlakyStore::new(), Arc::new(auth)).await;
        let base = format!("ws://127.0.0.1:{}/ws", handle.port());

        match tokio_tungstenite::connect_async(base.clone()).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("upgrade without a token should be refused"),
        }
        assert_eq!(handle.hub().connection_count(), 0);

        let (_ws, _) = tokio_tungstenite::connect_async(format!("{base}?token=s3cret"))
            .await
            .unwrap();
        wait_for_connections(&handle, 1).await;

        handle.shutdown().await;
    }

    #[test]
    fn build_router_creates_routes() {
        let (hub, _dispatcher) = Hub::new(
            FlakyStore::new(),
            &ServerConfig::default(),
            Arc::new(MetricsRecorder::new()),
        );
        let _router = build_router(AppState {
            hub,
            auth: Arc::new(AllowAnonymous),
        });
    }
}
