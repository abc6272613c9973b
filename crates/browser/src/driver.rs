//! The driver seam: object-safe traits the control plane programs against,
//! plus the production Chromium implementation.
//!
//! Local launch and remote attach produce the same trait objects, and tests
//! substitute in-process fakes at the same boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::process::Child;

use crate::cdp::channel::CdpChannel;
use crate::cdp::client::CdpClient;
use crate::cdp::protocol::ScreencastProfile;
use crate::error::Result;
use crate::launch::{launch_chromium, BrowserMode};
use crate::page::{ChromePage, EvalOutcome, NavTimeouts};

/// Page viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1440,
            height: 1880,
        }
    }
}

/// One decoded screencast frame ready for delivery.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Base64-encoded JPEG payload.
    pub data: String,
    /// Per-frame ack token; must be acknowledged to receive the next frame.
    pub ack_id: u64,
}

pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Entry point: produces browsers.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>>;
}

/// One browser instance (process or remote endpoint).
#[async_trait]
pub trait Browser: Send + Sync {
    /// Whether the CDP transport is still up.
    fn connected(&self) -> bool;

    /// Whether the underlying process is still running. Always mirrors
    /// `connected()` for remote endpoints.
    fn process_alive(&self) -> bool;

    /// Register a hook invoked once when the transport drops.
    fn on_disconnect(&self, hook: Hook);

    async fn new_page(&self, viewport: Viewport) -> Result<Arc<dyn Page>>;

    async fn close(&self) -> Result<()>;
}

/// One page (target) owned by a session.
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate and return the final (scheme-normalized) URL.
    async fn navigate(&self, url: &str, timeouts: NavTimeouts) -> Result<String>;

    async fn set_viewport(&self, viewport: Viewport) -> Result<()>;

    /// Evaluate a string as a function body in page context.
    async fn eval(&self, body: &str) -> Result<EvalOutcome>;

    async fn click(&self, x: f64, y: f64) -> Result<()>;
    async fn scroll_by(&self, delta_y: f64) -> Result<()>;
    async fn hover(&self, x: f64, y: f64) -> Result<()>;
    async fn type_text(&self, text: &str) -> Result<()>;

    /// Base64-encoded JPEG screenshot.
    async fn screenshot_jpeg(&self) -> Result<String>;

    /// Current page HTML.
    async fn content(&self) -> Result<String>;

    /// Install the consent-provider request blocklist.
    async fn block_consent_requests(&self) -> Result<()>;

    /// Register a hook fired when the renderer crashes.
    fn on_crash(&self, hook: Hook);

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;

    /// Open a dedicated CDP channel to this page for screencast control.
    async fn new_cdp(&self) -> Result<Arc<dyn Cdp>>;
}

/// Screencast-facing CDP channel owned by a session.
#[async_trait]
pub trait Cdp: Send + Sync {
    /// `Page.enable` - must be issued before `start_screencast`.
    async fn enable_page(&self) -> Result<()>;

    async fn start_screencast(&self, profile: ScreencastProfile) -> Result<()>;
    async fn stop_screencast(&self) -> Result<()>;

    /// Acknowledge one frame by its per-frame token.
    async fn ack(&self, ack_id: u64) -> Result<()>;

    /// Subscribe to this page's screencast frames.
    fn on_frame(&self, handler: FrameHandler);

    /// Raw command escape hatch (health probes use `Runtime.evaluate`).
    async fn send(&self, method: &str, params: Value) -> Result<Value>;
}

// ─── Production implementation ──────────────────────────────────────────────

/// Driver selected by [`BrowserMode`]: spawn a local Chromium per call or
/// attach to the configured remote endpoint.
pub struct CdpDriver {
    mode: BrowserMode,
}

impl CdpDriver {
    pub fn new(mode: BrowserMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn launch(&self) -> Result<Arc<dyn Browser>> {
        match &self.mode {
            BrowserMode::Launch(opts) => {
                let (child, ws_url) = launch_chromium(opts).await?;
                let client = CdpClient::connect(&ws_url).await?;
                Ok(Arc::new(ChromeBrowser {
                    client,
                    child: parking_lot::Mutex::new(Some(child)),
                }))
            }
            BrowserMode::Attach { ws_url } => {
                let client = CdpClient::connect(ws_url).await?;
                Ok(Arc::new(ChromeBrowser {
                    client,
                    child: parking_lot::Mutex::new(None),
                }))
            }
        }
    }
}

pub struct ChromeBrowser {
    client: Arc<CdpClient>,
    child: parking_lot::Mutex<Option<Child>>,
}

#[async_trait]
impl Browser for ChromeBrowser {
    fn connected(&self) -> bool {
        self.client.connected()
    }

    fn process_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => self.client.connected(),
        }
    }

    fn on_disconnect(&self, hook: Hook) {
        self.client.on_disconnect(hook);
    }

    async fn new_page(&self, viewport: Viewport) -> Result<Arc<dyn Page>> {
        let page = ChromePage::create(self.client.clone(), viewport.width, viewport.height).await?;
        Ok(Arc::new(page))
    }

    async fn close(&self) -> Result<()> {
        let _ = self.client.close().await;
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

impl Drop for ChromeBrowser {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn navigate(&self, url: &str, timeouts: NavTimeouts) -> Result<String> {
        ChromePage::navigate(self, url, timeouts).await
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        self.apply_viewport(viewport.width, viewport.height).await
    }

    async fn eval(&self, body: &str) -> Result<EvalOutcome> {
        ChromePage::eval(self, body).await
    }

    async fn click(&self, x: f64, y: f64) -> Result<()> {
        ChromePage::click(self, x, y).await
    }

    async fn scroll_by(&self, delta_y: f64) -> Result<()> {
        ChromePage::scroll_by(self, delta_y).await
    }

    async fn hover(&self, x: f64, y: f64) -> Result<()> {
        ChromePage::hover(self, x, y).await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        ChromePage::type_text(self, text).await
    }

    async fn screenshot_jpeg(&self) -> Result<String> {
        ChromePage::screenshot_jpeg(self).await
    }

    async fn content(&self) -> Result<String> {
        ChromePage::content(self).await
    }

    async fn block_consent_requests(&self) -> Result<()> {
        ChromePage::block_consent_requests(self).await
    }

    fn on_crash(&self, hook: Hook) {
        ChromePage::on_crash(self, hook)
    }

    fn is_closed(&self) -> bool {
        ChromePage::is_closed(self)
    }

    async fn close(&self) -> Result<()> {
        ChromePage::close(self).await
    }

    async fn new_cdp(&self) -> Result<Arc<dyn Cdp>> {
        let channel =
            CdpChannel::attach(self.channel().client().clone(), self.channel().target_id.clone())
                .await?;
        Ok(Arc::new(ChromeCdp { channel }))
    }
}

pub struct ChromeCdp {
    channel: CdpChannel,
}

#[async_trait]
impl Cdp for ChromeCdp {
    async fn enable_page(&self) -> Result<()> {
        self.channel.enable_page().await
    }

    async fn start_screencast(&self, profile: ScreencastProfile) -> Result<()> {
        self.channel.start_screencast(profile).await
    }

    async fn stop_screencast(&self) -> Result<()> {
        self.channel.stop_screencast().await
    }

    async fn ack(&self, ack_id: u64) -> Result<()> {
        self.channel.ack_frame(ack_id).await
    }

    fn on_frame(&self, handler: FrameHandler) {
        self.channel.on_screencast_frame(Arc::new(move |frame| {
            handler(Frame {
                data: frame.data,
                ack_id: frame.session_id,
            })
        }));
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.channel.send(method, Some(params)).await
    }
}
