//! Per-client frame pump: bounded queue, ack loop, and outbound flow control.
//!
//! Frames are delivered in CDP-emit order; when the client falls behind the
//! oldest pending frames are dropped, never the newest, and every frame is
//! acknowledged to CDP whether or not it reached the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use periscope_browser::{Cdp, Frame, Hook};
use serde_json::json;

use crate::connection::ClientSink;

pub const FRAME_QUEUE_MAX: usize = 10;
pub const BUFFER_HIGH_WATERMARK: usize = 5 * 1024 * 1024;
const LARGE_FRAME_BYTES: usize = 100 * 1024;
const DRAIN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub data: String,
    pub ack_id: u64,
}

/// Bounded FIFO of pending frames, shared between the pump and the memory
/// governor (which may trim or clear it under pressure).
#[derive(Clone, Default)]
pub struct FrameQueue {
    inner: Arc<parking_lot::Mutex<VecDeque<FrameRecord>>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, evicting the oldest entry when full. Returns the evicted
    /// record, if any.
    pub fn push(&self, record: FrameRecord) -> Option<FrameRecord> {
        let mut queue = self.inner.lock();
        let evicted = if queue.len() >= FRAME_QUEUE_MAX {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(record);
        evicted
    }

    pub fn pop_front(&self) -> Option<FrameRecord> {
        self.inner.lock().pop_front()
    }

    /// Put a popped record back at the head (flow-control re-enqueue).
    pub fn push_front(&self, record: FrameRecord) {
        self.inner.lock().push_front(record);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Keep only the `keep` newest entries.
    pub fn trim_to(&self, keep: usize) {
        let mut queue = self.inner.lock();
        while queue.len() > keep {
            queue.pop_front();
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// One pump per bound client channel.
pub struct StreamPump {
    client_id: String,
    queue: FrameQueue,
    sink: Arc<dyn ClientSink>,
    cdp: Arc<dyn Cdp>,
    /// Invoked when an ack failure reveals a dead CDP channel.
    on_channel_broken: Hook,
    /// Single-flight guard preserving on-wire frame order.
    sending: AtomicBool,
    self_ref: Weak<StreamPump>,
}

impl StreamPump {
    pub fn new(
        client_id: String,
        sink: Arc<dyn ClientSink>,
        cdp: Arc<dyn Cdp>,
        on_channel_broken: Hook,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            client_id,
            queue: FrameQueue::new(),
            sink,
            cdp,
            on_channel_broken,
            sending: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// The queue handle, for registration with the memory governor.
    pub fn queue(&self) -> FrameQueue {
        self.queue.clone()
    }

    /// Entry point for CDP screencast events. Enqueue, ack unconditionally,
    /// kick the drain.
    pub fn on_frame(&self, frame: Frame) {
        if frame.data.len() > LARGE_FRAME_BYTES {
            tracing::warn!(
                client_id = %self.client_id,
                bytes = frame.data.len(),
                "large screencast frame"
            );
        }

        if let Some(evicted) = self.queue.push(FrameRecord {
            data: frame.data,
            ack_id: frame.ack_id,
        }) {
            tracing::debug!(
                client_id = %self.client_id,
                ack_id = evicted.ack_id,
                "frame queue full, dropped oldest"
            );
        }

        // The browser stops emitting until the frame is acked, so ack even
        // when the client channel is gone.
        let cdp = self.cdp.clone();
        let broken = self.on_channel_broken.clone();
        let ack_id = frame.ack_id;
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            if let Err(e) = cdp.ack(ack_id).await {
                let message = e.to_string();
                tracing::debug!(client_id = %client_id, error = %message, "frame ack failed");
                if message.contains("Session closed") || message.contains("Target closed") {
                    broken();
                }
            }
        });

        self.schedule_drain();
    }

    fn schedule_drain(&self) {
        if self.sending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pump) = self.self_ref.upgrade() else {
            self.sending.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            pump.drain().await;
        });
    }

    async fn drain(&self) {
        loop {
            if !self.sink.is_open() {
                break;
            }

            let Some(record) = self.queue.pop_front() else {
                break;
            };

            // Yield under buffer pressure: put the frame back and try later,
            // so a slow client never grows the socket buffer unboundedly.
            if self.sink.buffered_bytes() > BUFFER_HIGH_WATERMARK {
                self.queue.push_front(record);
                tokio::time::sleep(DRAIN_BACKOFF).await;
                continue;
            }

            let envelope = json!({
                "type": "frame",
                "data": record.data,
                "sessionId": record.ack_id,
            });
            if !self.sink.send_json(&envelope) {
                tracing::debug!(client_id = %self.client_id, "frame send refused by sink");
            }
        }

        self.sending.store(false, Ordering::SeqCst);

        // A frame may have arrived between the last pop and the flag reset.
        if !self.queue.is_empty() && self.sink.is_open() {
            self.schedule_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use periscope_browser::{DriverError, FrameHandler, ScreencastProfile};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        open: AtomicBool,
        buffered: AtomicUsize,
        sent: Mutex<Vec<Value>>,
    }

    impl RecordingSink {
        fn new(open: bool, buffered: usize) -> Arc<Self> {
            let sink = Self::default();
            sink.open.store(open, Ordering::SeqCst);
            sink.buffered.store(buffered, Ordering::SeqCst);
            Arc::new(sink)
        }
    }

    impl ClientSink for RecordingSink {
        fn send_json(&self, value: &Value) -> bool {
            self.sent.lock().push(value.clone());
            true
        }

        fn buffered_bytes(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingCdp {
        acks: Mutex<Vec<u64>>,
        fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Cdp for CountingCdp {
        async fn enable_page(&self) -> periscope_browser::Result<()> {
            Ok(())
        }

        async fn start_screencast(
            &self,
            _profile: ScreencastProfile,
        ) -> periscope_browser::Result<()> {
            Ok(())
        }

        async fn stop_screencast(&self) -> periscope_browser::Result<()> {
            Ok(())
        }

        async fn ack(&self, ack_id: u64) -> periscope_browser::Result<()> {
            self.acks.lock().push(ack_id);
            if let Some(message) = self.fail_with.lock().clone() {
                return Err(DriverError::Protocol { code: -32000, message });
            }
            Ok(())
        }

        fn on_frame(&self, _handler: FrameHandler) {}

        async fn send(&self, _method: &str, _params: Value) -> periscope_browser::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn frame(n: u64) -> Frame {
        Frame {
            data: format!("frame-{n}"),
            ack_id: n,
        }
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = FrameQueue::new();
        for n in 0..12u64 {
            queue.push(FrameRecord {
                data: format!("f{n}"),
                ack_id: n,
            });
        }
        assert_eq!(queue.len(), FRAME_QUEUE_MAX);
        // The two oldest (0, 1) were evicted.
        assert_eq!(queue.pop_front().unwrap().ack_id, 2);
    }

    #[test]
    fn trim_keeps_newest() {
        let queue = FrameQueue::new();
        for n in 0..5u64 {
            queue.push(FrameRecord {
                data: String::new(),
                ack_id: n,
            });
        }
        queue.trim_to(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().ack_id, 3);
        assert_eq!(queue.pop_front().unwrap().ack_id, 4);
    }

    #[tokio::test]
    async fn stuck_open_channel_keeps_ten_acks_all() {
        // Channel OPEN but over the high watermark: nothing drains, the queue
        // caps at FRAME_QUEUE_MAX dropping oldest, and every frame is acked.
        let sink = RecordingSink::new(true, BUFFER_HIGH_WATERMARK + 1);
        let cdp = Arc::new(CountingCdp::default());
        let pump = StreamPump::new(
            "c1".into(),
            sink.clone(),
            cdp.clone(),
            Arc::new(|| {}),
        );

        for n in 0..12u64 {
            pump.on_frame(frame(n));
        }

        // Let the ack tasks run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pump.queue().len(), FRAME_QUEUE_MAX);
        let mut acks = cdp.acks.lock().clone();
        acks.sort_unstable();
        assert_eq!(acks, (0..12).collect::<Vec<_>>());
        assert!(sink.sent.lock().is_empty());

        // Oldest two were dropped: the head of the queue is frame 2.
        assert_eq!(pump.queue().pop_front().unwrap().ack_id, 2);
    }

    #[tokio::test]
    async fn frames_drain_in_order_when_channel_is_clear() {
        let sink = RecordingSink::new(true, 0);
        let cdp = Arc::new(CountingCdp::default());
        let pump = StreamPump::new("c2".into(), sink.clone(), cdp, Arc::new(|| {}));

        for n in 0..5u64 {
            pump.on_frame(frame(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 5);
        for (i, envelope) in sent.iter().enumerate() {
            assert_eq!(envelope["type"], "frame");
            assert_eq!(envelope["sessionId"], i as u64);
        }
        assert!(pump.queue().is_empty());
    }

    #[tokio::test]
    async fn closed_channel_still_acks() {
        let sink = RecordingSink::new(false, 0);
        let cdp = Arc::new(CountingCdp::default());
        let pump = StreamPump::new("c3".into(), sink.clone(), cdp.clone(), Arc::new(|| {}));

        pump.on_frame(frame(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cdp.acks.lock().len(), 1);
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn ack_failure_mentioning_closed_session_breaks_channel() {
        let sink = RecordingSink::new(true, 0);
        let cdp = Arc::new(CountingCdp::default());
        *cdp.fail_with.lock() = Some("Session closed.".to_string());

        let broken = Arc::new(AtomicBool::new(false));
        let broken2 = broken.clone();
        let pump = StreamPump::new(
            "c4".into(),
            sink,
            cdp,
            Arc::new(move || broken2.store(true, Ordering::SeqCst)),
        );

        pump.on_frame(frame(9));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broken.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unrelated_ack_failure_does_not_break_channel() {
        let sink = RecordingSink::new(true, 0);
        let cdp = Arc::new(CountingCdp::default());
        *cdp.fail_with.lock() = Some("Internal error".to_string());

        let broken = Arc::new(AtomicBool::new(false));
        let broken2 = broken.clone();
        let pump = StreamPump::new(
            "c5".into(),
            sink,
            cdp,
            Arc::new(move || broken2.store(true, Ordering::SeqCst)),
        );

        pump.on_frame(frame(9));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!broken.load(Ordering::SeqCst));
    }
}
