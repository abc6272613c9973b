//! Chrome DevTools Protocol plumbing.
//!
//! `client` owns the one WebSocket to the browser and matches responses and
//! events to callers; `channel` scopes commands to an attached target (and
//! carries the screencast control surface); `protocol` holds the wire types
//! both sides share.

pub mod channel;
pub mod client;
pub mod protocol;

pub use channel::CdpChannel;
pub use client::CdpClient;
pub use protocol::{CdpEvent, CdpRequest, CdpResponse, ScreencastFrame, ScreencastProfile};
