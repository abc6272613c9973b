//! CDP Protocol Types
//!
//! These are the fundamental types for CDP communication.
//! Keep them minimal - add domain-specific types only when needed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Request ID - monotonically increasing
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// Session ID for attached targets
pub type SessionId = String;

/// CDP Request sent to browser
#[derive(Debug, Clone, Serialize)]
pub struct CdpRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// CDP Response from browser
#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CdpRemoteError>,
}

/// Error object carried inside a CDP response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CdpRemoteError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// CDP Event from browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified CDP Message (response or event)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CdpMessage {
    Response(CdpResponse),
    Event(CdpEvent),
}

/// Target Info from Target.getTargetInfo
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
}

/// Result of Target.attachToTarget
#[derive(Debug, Clone, Deserialize)]
pub struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// Parameters of a `Page.screencastFrame` event.
///
/// `session_id` here is the per-frame ack token, not a target session.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreencastFrame {
    pub data: String,
    #[serde(rename = "sessionId")]
    pub session_id: u64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Screencast tuning knobs passed to `Page.startScreencast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreencastProfile {
    pub quality: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub every_nth_frame: u32,
}

impl ScreencastProfile {
    /// Standard streaming profile.
    pub fn standard() -> Self {
        Self {
            quality: 60,
            max_width: 1280,
            max_height: 1024,
            every_nth_frame: 2,
        }
    }

    /// Low-bandwidth profile used under memory pressure.
    pub fn degraded() -> Self {
        Self {
            quality: 30,
            max_width: 1024,
            max_height: 768,
            every_nth_frame: 2,
        }
    }

    /// Standard profile capped to the given dimensions.
    pub fn standard_for(width: u32, height: u32) -> Self {
        Self {
            max_width: width,
            max_height: height,
            ..Self::standard()
        }
    }

    pub fn to_params(self) -> Value {
        json!({
            "format": "jpeg",
            "quality": self.quality,
            "maxWidth": self.max_width,
            "maxHeight": self.max_height,
            "everyNthFrame": self.every_nth_frame,
        })
    }
}

impl Default for ScreencastProfile {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screencast_frame_deserializes() {
        let params = json!({
            "data": "base64jpeg",
            "metadata": { "timestamp": 1.0 },
            "sessionId": 7,
        });
        let frame: ScreencastFrame = serde_json::from_value(params).unwrap();
        assert_eq!(frame.data, "base64jpeg");
        assert_eq!(frame.session_id, 7);
    }

    #[test]
    fn event_and_response_are_distinguished() {
        let raw = r#"{"id":3,"result":{"ok":true}}"#;
        match serde_json::from_str::<CdpMessage>(raw).unwrap() {
            CdpMessage::Response(r) => assert_eq!(r.id, 3),
            CdpMessage::Event(_) => panic!("expected response"),
        }

        let raw = r#"{"method":"Page.loadEventFired","params":{}}"#;
        match serde_json::from_str::<CdpMessage>(raw).unwrap() {
            CdpMessage::Event(e) => assert_eq!(e.method, "Page.loadEventFired"),
            CdpMessage::Response(_) => panic!("expected event"),
        }
    }

    #[test]
    fn degraded_profile_parameters() {
        let p = ScreencastProfile::degraded().to_params();
        assert_eq!(p["quality"], 30);
        assert_eq!(p["maxWidth"], 1024);
        assert_eq!(p["maxHeight"], 768);
        assert_eq!(p["everyNthFrame"], 2);
        assert_eq!(p["format"], "jpeg");
    }

    #[test]
    fn standard_for_overrides_dimensions_only() {
        let p = ScreencastProfile::standard_for(800, 600);
        assert_eq!(p.quality, ScreencastProfile::standard().quality);
        assert_eq!(p.max_width, 800);
        assert_eq!(p.max_height, 600);
    }
}
