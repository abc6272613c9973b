//! Headless Chromium driver over the Chrome DevTools Protocol.
//!
//! One WebSocket per browser, multiplexed CDP sessions per target, and an
//! object-safe trait seam (`Driver`/`Browser`/`Page`/`Cdp`) so the session
//! control plane never depends on whether the browser was launched locally
//! or attached remotely.

pub mod cdp;
pub mod driver;
pub mod error;
pub mod launch;
pub mod page;

pub use cdp::{CdpChannel, CdpClient, ScreencastFrame, ScreencastProfile};
pub use driver::{Browser, Cdp, CdpDriver, Driver, Frame, FrameHandler, Hook, Page, Viewport};
pub use error::{DriverError, Result};
pub use launch::{BrowserMode, LaunchOptions};
pub use page::{normalize_url, EvalOutcome, NavTimeouts, NavWait};
