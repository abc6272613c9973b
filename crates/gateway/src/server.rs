//! The client-facing gateway: WebSocket acceptor, auth gate, and the glue
//! binding a channel to a Session + StreamPump + MessageRouter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use periscope_browser::Viewport;

use crate::auth::{extract_token, Authenticator};
use crate::connection::{ClientConnection, ClientSink, Outbound};
use crate::fabric::{CircuitBreaker, FabricError};
use crate::health::health_check;
use crate::memory::MemoryGovernor;
use crate::router::MessageRouter;
use crate::session::SessionManager;
use crate::shutdown::ShutdownCoordinator;

const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Pings are skipped while this much outbound data is still buffered.
const PING_SKIP_BUFFERED: usize = 1024 * 1024;
const DEAD_PEER_INTERVAL: Duration = Duration::from_secs(45);
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub governor: Arc<MemoryGovernor>,
    pub router: Arc<MessageRouter>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Process-wide breaker around session creation.
    pub create_breaker: Arc<CircuitBreaker>,
    pub active_connections: Arc<dashmap::DashMap<String, ()>>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve until the shutdown token fires.
pub async fn serve(
    state: AppState,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = router(state.clone());
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.token().cancelled().await })
        .await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health_check(
        state.start_time,
        state.active_connections.len(),
        state.create_breaker.state(),
    ))
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = extract_token(
        params.get("token").map(String::as_str),
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok()),
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Auth gate: one error message, then close.
    let authenticated = match token {
        Some(token) => state.authenticator.authenticate(&token).await.ok(),
        None => None,
    };
    if authenticated.is_none() {
        let reply = json!({ "type": "error", "kind": "auth" });
        let _ = ws_tx.send(Message::Text(reply.to_string())).await;
        let _ = ws_tx.close().await;
        return;
    }

    let client_id = uuid::Uuid::now_v7().to_string();
    info!(%client_id, "client connected");
    state.active_connections.insert(client_id.clone(), ());

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_CAPACITY);
    let connection = Arc::new(ClientConnection::new(client_id.clone(), out_tx));

    // Writer: drains the outbound channel onto the socket and releases the
    // buffered-byte gauge the pump's flow control reads.
    let writer_conn = connection.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Text(text) => {
                    let len = text.len();
                    let result = ws_tx.send(Message::Text(text)).await;
                    writer_conn.settle(len);
                    if result.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_conn.mark_closed();
        let _ = ws_tx.close().await;
    });

    // Session creation behind the process-wide breaker.
    let sink: Arc<dyn ClientSink> = connection.clone();
    let created = state
        .create_breaker
        .call(state.sessions.create(&client_id, Viewport::default()))
        .await;
    let session = match created {
        Ok(session) => session,
        Err(e) => {
            let message = match e {
                FabricError::CircuitOpen => "gateway is shedding load, retry shortly".to_string(),
                other => other.to_string(),
            };
            warn!(%client_id, error = %message, "session create refused");
            sink.send_json(&json!({
                "type": "error",
                "kind": "connection",
                "message": message,
            }));
            finish_connection(&state, &client_id, &connection, writer).await;
            return;
        }
    };

    state.sessions.register_sink(&client_id, sink.clone());
    sink.send_json(&json!({ "type": "connected", "clientId": client_id }));

    // Frames flow CDP -> pump -> channel; acks flow back regardless.
    let broken_session = session.clone();
    let pump = crate::pump::StreamPump::new(
        client_id.clone(),
        sink.clone(),
        session.cdp.clone(),
        Arc::new(move || broken_session.mark_unhealthy()),
    );
    state.governor.register_queue(&client_id, pump.queue());
    {
        let pump = pump.clone();
        session.cdp.on_frame(Arc::new(move |frame| {
            pump.on_frame(frame);
        }));
    }

    if let Err(e) = state.sessions.start_screencast(&session).await {
        warn!(%client_id, error = %e, "screencast start failed");
    }
    sink.send_json(&json!({ "type": "session_ready" }));

    // Liveness ping, skipped under outbound pressure.
    let conn_cancel = state.shutdown.token().child_token();
    let ping_conn = connection.clone();
    let ping_cancel = conn_cancel.clone();
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIVENESS_PING_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if ping_conn.buffered_bytes() > PING_SKIP_BUFFERED {
                        debug!("skipping ping under buffer pressure");
                        continue;
                    }
                    if !ping_conn.send_ping() {
                        break;
                    }
                }
                _ = ping_cancel.cancelled() => break,
            }
        }
    });

    // Dead-peer check: no pong across a whole tick closes the channel.
    let dead_conn = connection.clone();
    let dead_cancel = conn_cancel.clone();
    let dead_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEAD_PEER_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if dead_conn.last_pong_elapsed() > DEAD_PEER_INTERVAL {
                        warn!(client_id = %dead_conn.id, "no pong, closing dead peer");
                        dead_conn.mark_closed();
                        dead_cancel.cancel();
                        break;
                    }
                }
                _ = dead_cancel.cancelled() => break,
            }
        }
    });

    // Inbound loop: replies stay in arrival order because dispatch is awaited
    // inline.
    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    state.router.dispatch(&client_id, &text, &sink).await;
                }
                Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%client_id, error = %e, "websocket receive error");
                    break;
                }
            },
        }
    }

    conn_cancel.cancel();
    let _ = ping_task.await;
    let _ = dead_task.await;
    finish_connection(&state, &client_id, &connection, writer).await;
}

async fn finish_connection(
    state: &AppState,
    client_id: &str,
    connection: &Arc<ClientConnection>,
    writer: tokio::task::JoinHandle<()>,
) {
    connection.mark_closed();
    writer.abort();

    state.sessions.cleanup(client_id, true).await;
    state.sessions.unregister_sink(client_id);
    state.governor.clear_client(client_id);
    state.active_connections.remove(client_id);

    info!(
        %client_id,
        dropped_messages = connection.drop_count(),
        "client disconnected"
    );
}
