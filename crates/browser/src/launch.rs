//! Chromium process launch and remote-endpoint attachment.
//!
//! The gateway either owns a local headless Chromium per session or attaches
//! to a remote debugging endpoint; both paths end in the same CDP WebSocket.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, Command};

use crate::error::{DriverError, Result};

const STARTUP_POLLS: u32 = 50;
const STARTUP_POLL_DELAY: Duration = Duration::from_millis(100);

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// How to reach the browser. Configuration-driven; the rest of the driver is
/// identical for both modes.
#[derive(Debug, Clone)]
pub enum BrowserMode {
    Launch(LaunchOptions),
    Attach { ws_url: String },
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: PathBuf,
    pub headless: bool,
    pub user_agent: String,
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromium"),
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    /// Full argument list for the Chromium invocation.
    ///
    /// Automation-detection flags off, sandboxing off for constrained hosts,
    /// renderer old-space capped.
    pub fn args(&self, port: u16) -> Vec<String> {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(
            [
                "--disable-blink-features=AutomationControlled",
                "--no-sandbox",
                "--disable-setuid-sandbox",
                "--disable-dev-shm-usage",
                "--disable-gpu",
                "--no-first-run",
                "--no-default-browser-check",
                "--mute-audio",
                "--hide-scrollbars",
                "--js-flags=--max-old-space-size=512",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(format!("--user-agent={}", self.user_agent));
        args.push(format!("--remote-debugging-port={port}"));
        args.extend(self.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }
}

#[derive(Debug, Deserialize)]
struct DevToolsVersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    websocket_debugger_url: String,
}

/// Spawn Chromium and return the child plus its browser-level WebSocket URL.
pub(crate) async fn launch_chromium(opts: &LaunchOptions) -> Result<(Child, String)> {
    let port = pick_free_port()?;

    let mut child = Command::new(&opts.executable)
        .args(opts.args(port))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::Launch(format!("spawn {:?}: {e}", opts.executable)))?;

    let ws_url = match wait_for_ws_url(port, &mut child).await {
        Ok(url) => url,
        Err(e) => {
            let _ = child.start_kill();
            return Err(e);
        }
    };

    tracing::debug!(port, %ws_url, "chromium ready");
    Ok((child, ws_url))
}

fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| DriverError::Launch(format!("bind port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| DriverError::Launch(format!("local_addr: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll the DevTools `/json/version` endpoint until the browser WebSocket URL
/// appears, bailing out early if the process exits.
async fn wait_for_ws_url(port: u16, child: &mut Child) -> Result<String> {
    let url = format!("http://127.0.0.1:{port}/json/version");

    for _ in 0..STARTUP_POLLS {
        tokio::time::sleep(STARTUP_POLL_DELAY).await;

        if let Some(status) = child
            .try_wait()
            .map_err(|e| DriverError::Launch(format!("wait: {e}")))?
        {
            return Err(DriverError::Launch(format!(
                "browser exited early with {status}"
            )));
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(info) = resp.json::<DevToolsVersionInfo>().await else {
            continue;
        };
        return Ok(info.websocket_debugger_url);
    }

    Err(DriverError::Launch(format!(
        "browser did not expose a DevTools endpoint on port {port} in time"
    )))
}
