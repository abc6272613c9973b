//! Driver error type shared by the CDP client and the page operations.

use thiserror::Error;

use crate::cdp::protocol::RequestId;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid response for request {0}")]
    InvalidResponse(RequestId),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("evaluation failed: {0}")]
    Eval(String),

    #[error("page is closed")]
    PageClosed,
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
