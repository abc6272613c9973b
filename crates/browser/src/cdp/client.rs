//! The one WebSocket to the browser.
//!
//! A reader task pairs responses to pending requests by id and fans events
//! out twice: to named subscribers and to a broadcast stream for one-shot
//! waiters. The client itself never retries or queues - failures surface to
//! the caller immediately, and the moment the socket drops every in-flight
//! request fails with `Closed`, the connected flag flips, and the registered
//! disconnect hooks run once. That flag and those hooks are what the session
//! health machinery upstairs watches.

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::*;
use crate::error::{DriverError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Event subscriber callback
pub type EventCallback = Arc<dyn Fn(CdpEvent) + Send + Sync>;

/// Hook invoked once when the browser connection drops.
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// CDP Client - manages single WebSocket connection to browser
pub struct CdpClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Pending requests waiting for responses
    /// Key: request_id, Value: oneshot sender for response
    pending: Arc<DashMap<RequestId, oneshot::Sender<CdpResponse>>>,

    /// Event subscribers
    /// Key: method name (e.g., "Page.screencastFrame"), Value: callbacks
    subscribers: Arc<DashMap<String, Vec<EventCallback>>>,

    /// Every event is also fanned out here for one-shot waiters.
    events: broadcast::Sender<CdpEvent>,

    /// WebSocket write half (wrapped for concurrent sending)
    ws_sink: Arc<RwLock<WsSink>>,

    /// Flipped once the reader task observes close or error.
    connected: Arc<AtomicBool>,

    /// Hooks run exactly once on disconnect.
    disconnect_hooks: Arc<parking_lot::Mutex<Vec<DisconnectHook>>>,
}

impl CdpClient {
    /// Connect to a Chrome DevTools Protocol endpoint
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();

        let (events, _) = broadcast::channel(256);

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            events,
            ws_sink: Arc::new(RwLock::new(sink)),
            connected: Arc::new(AtomicBool::new(true)),
            disconnect_hooks: Arc::new(parking_lot::Mutex::new(Vec::new())),
        });

        // Spawn message receiver task
        let client_clone = client.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = client_clone.handle_message(&text) {
                            tracing::error!("failed to handle CDP message: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("CDP WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("CDP WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            client_clone.mark_disconnected();
        });

        Ok(client)
    }

    /// Send a CDP request and wait for its response
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        if !self.connected() {
            return Err(DriverError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // Serialize and send
        let json = serde_json::to_string(&request)?;
        let send_result = {
            let mut sink = self.ws_sink.write().await;
            sink.send(Message::Text(json)).await
        };
        if let Err(e) = send_result {
            self.pending.remove(&id);
            return Err(DriverError::WebSocket(e));
        }

        // Wait for response; the reader task drops our sender on disconnect
        let response = rx.await.map_err(|_| DriverError::Closed)?;

        if let Some(error) = response.error {
            return Err(DriverError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Subscribe to CDP events by method name
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        let method = method.into();
        self.subscribers
            .entry(method)
            .or_insert_with(Vec::new)
            .push(callback);
    }

    /// Receiver over every CDP event, for one-shot waits with a deadline.
    pub fn event_stream(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Whether the underlying WebSocket is still up
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a hook invoked once when the connection drops.
    pub fn on_disconnect(&self, hook: DisconnectHook) {
        if !self.connected() {
            hook();
            return;
        }
        self.disconnect_hooks.lock().push(hook);
    }

    /// Handle incoming WebSocket message
    fn handle_message(&self, text: &str) -> Result<()> {
        let msg: CdpMessage = serde_json::from_str(text)?;

        match msg {
            CdpMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    let _ = tx.send(response); // Ignore send errors (receiver dropped)
                } else {
                    tracing::warn!("received response for unknown request: {}", response.id);
                }
            }
            CdpMessage::Event(event) => {
                let _ = self.events.send(event.clone());
                if let Some(subscribers) = self.subscribers.get(&event.method) {
                    for callback in subscribers.value() {
                        callback(event.clone());
                    }
                }
            }
        }

        Ok(())
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            // Dropping the pending senders fails every in-flight round-trip
            self.pending.clear();
            let hooks = std::mem::take(&mut *self.disconnect_hooks.lock());
            for hook in hooks {
                hook();
            }
        }
    }

    /// Close connection gracefully
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        drop(sink);
        self.mark_disconnected();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Real round-trips need a running Chrome instance; the control-plane
    // behavior on top of this client is covered with fakes in the gateway
    // crate.

    #[tokio::test]
    #[ignore] // Needs running Chrome
    async fn connect_and_get_version() {
        let client = CdpClient::connect("ws://localhost:9222/devtools/browser")
            .await
            .unwrap();

        let result = client
            .send_request("Browser.getVersion", None, None)
            .await
            .unwrap();

        println!("Browser version: {:?}", result);
    }
}
