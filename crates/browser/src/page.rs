//! Page-level operations over a CDP channel.
//!
//! One `ChromePage` per browser target: navigation with a two-strategy wait,
//! input dispatch, screenshot/HTML capture, script evaluation, and the
//! consent-banner request blocklist.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cdp::channel::CdpChannel;
use crate::cdp::client::CdpClient;
use crate::error::{DriverError, Result};

/// Per-character delay for keyboard typing.
const TYPE_CHAR_DELAY: Duration = Duration::from_millis(50);

const SCREENSHOT_JPEG_QUALITY: u32 = 80;

/// Consent-management providers whose requests are aborted outright.
const CMP_HOSTS: &[&str] = &[
    "cookielaw",
    "onetrust",
    "cookiebot",
    "quantcast",
    "consensu",
    "trustarc",
    "cookieyes",
    "usercentrics",
    "privacy-mgmt",
    "privacy-center",
];

/// Installed on every new document before any page script runs.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
window.navigator.permissions.query = (parameters) =>
  parameters.name === 'notifications'
    ? Promise.resolve({ state: Notification.permission })
    : originalQuery(parameters);
"#;

/// What "the page is loaded" means for a navigation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavWait {
    NetworkIdle,
    DomContentLoaded,
}

impl NavWait {
    pub fn lifecycle_name(self) -> &'static str {
        match self {
            NavWait::NetworkIdle => "networkIdle",
            NavWait::DomContentLoaded => "DOMContentLoaded",
        }
    }
}

/// Primary/fallback deadlines for the two navigation strategies.
#[derive(Debug, Clone, Copy)]
pub struct NavTimeouts {
    pub primary: Duration,
    pub fallback: Duration,
}

impl Default for NavTimeouts {
    fn default() -> Self {
        Self {
            primary: Duration::from_secs(20),
            fallback: Duration::from_secs(15),
        }
    }
}

/// Result of evaluating a script in page context.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl EvalOutcome {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Prepend `https://` when the URL has no scheme. Data and about URLs pass
/// through untouched.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.contains("://") || trimmed.starts_with("data:") || trimmed.starts_with("about:") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Whether a request URL points at a known consent-management provider.
pub fn is_cmp_url(url: &str) -> bool {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', '?'])
        .next()
        .unwrap_or("");
    CMP_HOSTS.iter().any(|cmp| host.contains(cmp))
}

/// Run the primary navigation strategy, then the fallback once on failure.
/// Surfaces the final error.
pub(crate) async fn run_navigation<F, Fut>(timeouts: NavTimeouts, mut attempt: F) -> Result<()>
where
    F: FnMut(NavWait, Duration) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match attempt(NavWait::NetworkIdle, timeouts.primary).await {
        Ok(()) => Ok(()),
        Err(primary_err) => {
            tracing::warn!(
                "primary navigation strategy failed ({primary_err}); retrying with DOMContentLoaded"
            );
            attempt(NavWait::DomContentLoaded, timeouts.fallback).await
        }
    }
}

/// A single page (target) in the browser, plus its command channel.
pub struct ChromePage {
    channel: CdpChannel,
    closed: AtomicBool,
    crash_hooks: Arc<parking_lot::Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>>,
}

impl ChromePage {
    /// Create a new target, attach to it, and prepare it for driving:
    /// viewport override, stealth init script, lifecycle events, crash hook.
    pub async fn create(client: Arc<CdpClient>, width: u32, height: u32) -> Result<Self> {
        let result = client
            .send_request(
                "Target.createTarget",
                Some(json!({ "url": "about:blank" })),
                None,
            )
            .await?;
        let target_id = result["targetId"]
            .as_str()
            .ok_or(DriverError::InvalidResponse(0))?
            .to_string();

        let channel = CdpChannel::attach(client, target_id).await?;

        channel.enable_page().await?;
        channel
            .send(
                "Page.setLifecycleEventsEnabled",
                Some(json!({ "enabled": true })),
            )
            .await?;
        channel
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                Some(json!({ "source": STEALTH_SCRIPT })),
            )
            .await?;

        let page = Self {
            channel,
            closed: AtomicBool::new(false),
            crash_hooks: Arc::new(parking_lot::Mutex::new(Vec::new())),
        };
        page.apply_viewport(width, height).await?;
        page.subscribe_crash_events();
        Ok(page)
    }

    pub fn channel(&self) -> &CdpChannel {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a hook fired when the renderer for this target crashes.
    pub fn on_crash(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        self.crash_hooks.lock().push(hook);
    }

    fn subscribe_crash_events(&self) {
        let session_id = self.channel.session_id.clone();
        let hooks = self.crash_hooks.clone();
        self.channel.client().subscribe(
            "Inspector.targetCrashed",
            Arc::new(move |event| {
                if event.session_id.as_deref() != Some(session_id.as_str()) {
                    return;
                }
                tracing::warn!("renderer crashed for session {session_id}");
                for hook in hooks.lock().iter() {
                    hook();
                }
            }),
        );
    }

    /// Navigate with the two-strategy wait. Returns the final URL.
    pub async fn navigate(&self, url: &str, timeouts: NavTimeouts) -> Result<String> {
        let url = normalize_url(url);

        let channel = self.channel.clone();
        let nav_url = url.clone();
        run_navigation(timeouts, move |wait, deadline| {
            let channel = channel.clone();
            let url = nav_url.clone();
            async move {
                // Subscribe before navigating so a fast load is not missed.
                let events = channel.client().event_stream();
                let result = channel
                    .send("Page.navigate", Some(json!({ "url": url })))
                    .await?;
                if let Some(error_text) = result["errorText"].as_str() {
                    if !error_text.is_empty() {
                        return Err(DriverError::Navigation {
                            url,
                            reason: error_text.to_string(),
                        });
                    }
                }
                channel
                    .wait_for_lifecycle(events, wait.lifecycle_name(), deadline)
                    .await
            }
        })
        .await
        .map_err(|e| DriverError::Navigation {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        Ok(url)
    }

    pub async fn apply_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.channel
            .send(
                "Emulation.setDeviceMetricsOverride",
                Some(json!({
                    "width": width,
                    "height": height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                })),
            )
            .await?;
        Ok(())
    }

    /// Evaluate a string as a function body in page context.
    pub async fn eval(&self, body: &str) -> Result<EvalOutcome> {
        let expression = format!("(function() {{ {body} }})()");
        let result = self
            .channel
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Ok(EvalOutcome::err(message));
        }

        Ok(EvalOutcome::ok(result["result"]["value"].clone()))
    }

    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        self.dispatch_mouse("mouseMoved", x, y, None).await?;
        self.dispatch_mouse("mousePressed", x, y, Some("left")).await?;
        self.dispatch_mouse("mouseReleased", x, y, Some("left")).await?;
        Ok(())
    }

    pub async fn hover(&self, x: f64, y: f64) -> Result<()> {
        self.dispatch_mouse("mouseMoved", x, y, None).await
    }

    async fn dispatch_mouse(
        &self,
        kind: &str,
        x: f64,
        y: f64,
        button: Option<&str>,
    ) -> Result<()> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if let Some(button) = button {
            params["button"] = json!(button);
            params["clickCount"] = json!(1);
        }
        self.channel
            .send("Input.dispatchMouseEvent", Some(params))
            .await?;
        Ok(())
    }

    /// Scroll via injected `window.scrollBy` - portable across remote
    /// browsers, unlike synthetic wheel events.
    pub async fn scroll_by(&self, delta_y: f64) -> Result<()> {
        let outcome = self.eval(&format!("window.scrollBy(0, {delta_y});")).await?;
        if let Some(error) = outcome.error {
            return Err(DriverError::Eval(error));
        }
        Ok(())
    }

    /// Type text with a per-character delay, as a human would.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        for ch in text.chars() {
            self.channel
                .send(
                    "Input.dispatchKeyEvent",
                    Some(json!({
                        "type": "keyDown",
                        "text": ch.to_string(),
                        "key": ch.to_string(),
                    })),
                )
                .await?;
            self.channel
                .send(
                    "Input.dispatchKeyEvent",
                    Some(json!({
                        "type": "keyUp",
                        "key": ch.to_string(),
                    })),
                )
                .await?;
            tokio::time::sleep(TYPE_CHAR_DELAY).await;
        }
        Ok(())
    }

    /// Capture a JPEG screenshot, base64-encoded.
    pub async fn screenshot_jpeg(&self) -> Result<String> {
        let result = self
            .channel
            .send(
                "Page.captureScreenshot",
                Some(json!({ "format": "jpeg", "quality": SCREENSHOT_JPEG_QUALITY })),
            )
            .await?;
        result["data"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| DriverError::Eval("screenshot returned no data".into()))
    }

    /// Current page HTML.
    pub async fn content(&self) -> Result<String> {
        let outcome = self
            .eval("return document.documentElement.outerHTML;")
            .await?;
        if let Some(error) = outcome.error {
            return Err(DriverError::Eval(error));
        }
        Ok(outcome
            .result
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default())
    }

    /// Abort requests to known consent-management providers; everything else
    /// continues. Interception failures must never block the page, so every
    /// error in the event path is swallowed.
    pub async fn block_consent_requests(&self) -> Result<()> {
        self.channel
            .send(
                "Fetch.enable",
                Some(json!({
                    "patterns": [{ "urlPattern": "*", "requestStage": "Request" }],
                })),
            )
            .await?;

        let channel = self.channel.clone();
        let session_id = self.channel.session_id.clone();
        self.channel.client().subscribe(
            "Fetch.requestPaused",
            Arc::new(move |event| {
                if event.session_id.as_deref() != Some(session_id.as_str()) {
                    return;
                }
                let Some(params) = event.params else { return };
                let Some(request_id) = params["requestId"].as_str().map(String::from) else {
                    return;
                };
                let url = params["request"]["url"].as_str().unwrap_or("").to_string();
                let channel = channel.clone();
                tokio::spawn(async move {
                    if is_cmp_url(&url) {
                        tracing::debug!(%url, "blocking consent-provider request");
                        let _ = channel
                            .send(
                                "Fetch.failRequest",
                                Some(json!({
                                    "requestId": request_id,
                                    "errorReason": "BlockedByClient",
                                })),
                            )
                            .await;
                    } else {
                        let _ = channel
                            .send(
                                "Fetch.continueRequest",
                                Some(json!({ "requestId": request_id })),
                            )
                            .await;
                    }
                });
            }),
        );

        Ok(())
    }

    /// Close the target. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel
            .client()
            .send_request(
                "Target.closeTarget",
                Some(json!({ "targetId": self.channel.target_id })),
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_added_when_missing() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("  example.com/a?b=1 "), "https://example.com/a?b=1");
    }

    #[test]
    fn existing_schemes_are_preserved() {
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
        assert_eq!(normalize_url("about:blank"), "about:blank");
        assert_eq!(
            normalize_url("data:text/html,<p>hi</p>"),
            "data:text/html,<p>hi</p>"
        );
    }

    #[test]
    fn cmp_hosts_are_recognized() {
        assert!(is_cmp_url("https://cdn.cookielaw.org/consent/x.js"));
        assert!(is_cmp_url("https://app.onetrust.com/banner"));
        assert!(is_cmp_url("https://consent.cookiebot.com/uc.js"));
        assert!(is_cmp_url("https://secure.quantcast.com/choice"));
        assert!(is_cmp_url("https://example.privacy-mgmt.com/sdk"));
    }

    #[test]
    fn ordinary_hosts_pass_through() {
        assert!(!is_cmp_url("https://example.com/index.html"));
        assert!(!is_cmp_url("https://news.ycombinator.com/"));
        // Matching is on the host, not the path or query.
        assert!(!is_cmp_url("https://example.com/onetrust-docs"));
    }

    #[tokio::test]
    async fn fallback_runs_after_primary_failure() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let calls2 = calls.clone();
        let seen2 = seen.clone();
        let result = run_navigation(NavTimeouts::default(), move |wait, _deadline| {
            let calls = calls2.clone();
            let seen = seen2.clone();
            async move {
                seen.lock().push(wait);
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DriverError::Timeout("lifecycle event networkIdle".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *seen.lock(),
            vec![NavWait::NetworkIdle, NavWait::DomContentLoaded]
        );
    }

    #[tokio::test]
    async fn final_failure_is_surfaced() {
        let result = run_navigation(NavTimeouts::default(), |_wait, _deadline| async {
            Err(DriverError::Timeout("lifecycle event".into()))
        })
        .await;
        assert!(matches!(result, Err(DriverError::Timeout(_))));
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = run_navigation(NavTimeouts::default(), move |_wait, _deadline| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
