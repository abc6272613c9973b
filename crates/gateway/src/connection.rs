//! Per-client outbound channel state.
//!
//! `ClientSink` is the seam the pump, router, and session manager write
//! through; `ClientConnection` is the production implementation backed by an
//! mpsc channel drained by the socket writer task.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Outbound items handed to the socket writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// Where replies and frames go. Implementations must be cheap to call from
/// sync contexts; sending must never block.
pub trait ClientSink: Send + Sync {
    /// Serialize and enqueue. Returns false when the channel is closed or
    /// full (the message is dropped, never queued unboundedly).
    fn send_json(&self, value: &serde_json::Value) -> bool;

    /// Bytes enqueued but not yet written to the socket.
    fn buffered_bytes(&self) -> usize;

    fn is_open(&self) -> bool;
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    pub id: String,
    tx: mpsc::Sender<Outbound>,
    /// Bytes enqueued and not yet flushed by the writer task.
    buffered: AtomicUsize,
    open: AtomicBool,
    last_pong: parking_lot::Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            buffered: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            last_pong: parking_lot::Mutex::new(Instant::now()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = text.len();
        if self.tx.try_send(Outbound::Text(text)).is_ok() {
            self.buffered.fetch_add(len, Ordering::Relaxed);
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Enqueue a liveness ping.
    pub fn send_ping(&self) -> bool {
        self.is_open() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Writer task calls this after flushing `len` bytes to the socket.
    pub fn settle(&self, len: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(len))
            });
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Record a pong from the client; the dead-peer check reads the stamp.
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Total messages dropped because the channel was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl ClientSink for ClientConnection {
    fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (ClientConnection::new("conn_1".into(), tx), rx)
    }

    #[tokio::test]
    async fn send_json_enqueues_and_tracks_bytes() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_json(&serde_json::json!({"type": "heartbeat"})));
        assert!(conn.buffered_bytes() > 0);

        match rx.recv().await.unwrap() {
            Outbound::Text(text) => {
                let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed["type"], "heartbeat");
            }
            Outbound::Ping => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn settle_releases_buffered_bytes() {
        let (conn, mut rx) = make_connection();
        conn.send_json(&serde_json::json!({"a": 1}));
        let queued = conn.buffered_bytes();
        assert!(queued > 0);

        if let Some(Outbound::Text(text)) = rx.recv().await {
            conn.settle(text.len());
        }
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[test]
    fn settle_never_underflows() {
        let (conn, _rx) = make_connection();
        conn.settle(1024);
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn closed_connection_refuses_sends() {
        let (conn, _rx) = make_connection();
        conn.mark_closed();
        assert!(!conn.is_open());
        assert!(!conn.send_json(&serde_json::json!({})));
        assert!(!conn.send_ping());
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new("conn_2".into(), tx);
        assert!(conn.send_json(&serde_json::json!({"n": 1})));
        assert!(!conn.send_json(&serde_json::json!({"n": 2})));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn pong_refreshes_liveness_stamp() {
        let (conn, _rx) = make_connection();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let before = conn.last_pong_elapsed();
        conn.mark_alive();
        assert!(conn.last_pong_elapsed() < before);
    }
}
