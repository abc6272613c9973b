//! Command channel scoped to one browser target.
//!
//! A `CdpChannel` is born from `Target.attachToTarget` and stamps every
//! command it sends with the resulting protocol session id. On top of the raw
//! `send` it carries the screencast surface the streaming path needs (start,
//! stop, per-frame ack, and a frame subscription filtered to this target) and
//! `wait_for_lifecycle`, the deadline-bounded wait navigation uses to decide
//! when a page load counts as done.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::client::CdpClient;
use super::protocol::{
    AttachToTargetResult, CdpEvent, ScreencastFrame, ScreencastProfile, SessionId, TargetId,
};
use crate::error::{DriverError, Result};

/// Handler for decoded screencast frames.
pub type ScreencastHandler = Arc<dyn Fn(ScreencastFrame) + Send + Sync>;

/// CDP channel bound to a specific target via `Target.attachToTarget`.
#[derive(Clone)]
pub struct CdpChannel {
    client: Arc<CdpClient>,
    pub target_id: TargetId,
    pub session_id: SessionId,
}

impl CdpChannel {
    /// Attach to a target, creating a dedicated protocol session.
    pub async fn attach(client: Arc<CdpClient>, target_id: TargetId) -> Result<Self> {
        let result = client
            .send_request(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;

        let attach_result: AttachToTargetResult = serde_json::from_value(result)?;

        Ok(Self {
            client,
            target_id,
            session_id: attach_result.session_id,
        })
    }

    /// Send a command within this channel's session context
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    pub fn client(&self) -> &Arc<CdpClient> {
        &self.client
    }

    /// `Page.enable` - required before screencast and lifecycle events.
    pub async fn enable_page(&self) -> Result<()> {
        self.send("Page.enable", None).await?;
        Ok(())
    }

    pub async fn start_screencast(&self, profile: ScreencastProfile) -> Result<()> {
        self.send("Page.startScreencast", Some(profile.to_params()))
            .await?;
        Ok(())
    }

    pub async fn stop_screencast(&self) -> Result<()> {
        self.send("Page.stopScreencast", None).await?;
        Ok(())
    }

    /// Acknowledge one screencast frame so the browser emits the next.
    pub async fn ack_frame(&self, ack_id: u64) -> Result<()> {
        self.send("Page.screencastFrameAck", Some(json!({ "sessionId": ack_id })))
            .await?;
        Ok(())
    }

    /// Subscribe to this target's screencast frames.
    pub fn on_screencast_frame(&self, handler: ScreencastHandler) {
        let session_id = self.session_id.clone();
        self.client.subscribe(
            "Page.screencastFrame",
            Arc::new(move |event: CdpEvent| {
                if event.session_id.as_deref() != Some(session_id.as_str()) {
                    return;
                }
                let Some(params) = event.params else { return };
                match serde_json::from_value::<ScreencastFrame>(params) {
                    Ok(frame) => handler(frame),
                    Err(e) => tracing::warn!("malformed screencast frame: {}", e),
                }
            }),
        );
    }

    /// Wait for a `Page.lifecycleEvent` with the given name on this target.
    ///
    /// Subscribe via [`CdpClient::event_stream`] *before* issuing the
    /// navigation command, then pass the receiver here, so the event cannot
    /// slip through between send and wait.
    pub async fn wait_for_lifecycle(
        &self,
        mut events: tokio::sync::broadcast::Receiver<CdpEvent>,
        name: &str,
        deadline: Duration,
    ) -> Result<()> {
        let session_id = self.session_id.clone();
        let wait = async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.method != "Page.lifecycleEvent" {
                            continue;
                        }
                        if event.session_id.as_deref() != Some(session_id.as_str()) {
                            continue;
                        }
                        let observed = event
                            .params
                            .as_ref()
                            .and_then(|p| p["name"].as_str())
                            .unwrap_or("");
                        if observed == name {
                            return Ok(());
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(DriverError::Closed);
                    }
                }
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| DriverError::Timeout(format!("lifecycle event {name}")))?
    }
}
