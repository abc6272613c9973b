//! Session control plane: the per-client `{browser, page, cdp}` triple, its
//! health probe, and the manager that creates, recovers, and destroys it.
//!
//! Lifecycle: Starting -> Healthy <-> Degraded -> Recovering -> {Healthy,
//! Terminated}. Replacement during recovery is atomic from the map's point
//! of view: old handles are closed before the new session is installed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use periscope_browser::{
    Browser, Cdp, Driver, NavTimeouts, Page, ScreencastProfile, Viewport,
};

use crate::config::{FabricConfig, SessionSettings};
use crate::connection::ClientSink;
use crate::error::GatewayError;
use crate::fabric::with_timeout;
use crate::memory::{MemoryGovernor, MemoryPressure};

/// Solid black page shown while the real navigation is still in flight, so
/// the first screencast frame is never a white flash.
const BLACK_PAGE_URL: &str =
    "data:text/html,<html><body style=\"background:%23000;margin:0\"></body></html>";

/// Deadline for one whole create attempt (launch + page + channel). A wedged
/// browser must not hold the lifecycle lock indefinitely.
const CREATE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(45);

/// The per-client triple plus liveness state. The session exclusively owns
/// its three handles; only `SessionManager` closes them.
pub struct Session {
    pub client_id: String,
    pub browser: Arc<dyn Browser>,
    pub page: Arc<dyn Page>,
    pub cdp: Arc<dyn Cdp>,
    viewport: parking_lot::RwLock<Viewport>,
    last_activity: parking_lot::Mutex<Instant>,
    /// Consecutive failed probes; only ever incremented or reset to zero.
    health_failures: AtomicU32,
    healthy: AtomicBool,
}

impl Session {
    fn new(
        client_id: String,
        browser: Arc<dyn Browser>,
        page: Arc<dyn Page>,
        cdp: Arc<dyn Cdp>,
        viewport: Viewport,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            browser,
            page,
            cdp,
            viewport: parking_lot::RwLock::new(viewport),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            health_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        })
    }

    pub fn viewport(&self) -> Viewport {
        *self.viewport.read()
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.write() = viewport;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::SeqCst)
    }

    fn record_probe_success(&self) {
        self.health_failures.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
    }

    /// Returns the new consecutive-failure count.
    fn record_probe_failure(&self) -> u32 {
        self.health_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Owns the `client_id -> Session` map. All lifecycle mutations serialize
/// through one async mutex, which makes concurrent get/cleanup/recover on the
/// same client linearizable.
pub struct SessionManager {
    driver: Arc<dyn Driver>,
    fabric: FabricConfig,
    settings: SessionSettings,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Health-probe handles keyed by client id; never stored on the session
    /// itself so there is no cycle through the timer.
    probes: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    /// Client channels for recovery notices.
    sinks: parking_lot::RwLock<HashMap<String, Arc<dyn ClientSink>>>,
    lifecycle: AsyncMutex<()>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        fabric: FabricConfig,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            driver,
            fabric,
            settings,
            sessions: RwLock::new(HashMap::new()),
            probes: parking_lot::Mutex::new(HashMap::new()),
            sinks: parking_lot::RwLock::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
            background: parking_lot::Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        })
    }

    /// Spawn the stale-session sweep and the memory-pressure listener.
    pub fn start_background(&self, governor: &MemoryGovernor) {
        let mut background = self.background.lock();

        let manager = self.self_ref.clone();
        let sweep_interval = self.settings.sweep_interval;
        let session_timeout = self.settings.session_timeout;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let stale: Vec<String> = {
                    let sessions = manager.sessions.read().await;
                    sessions
                        .iter()
                        .filter(|(_, s)| s.idle_for() > session_timeout)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for client_id in stale {
                    tracing::info!(%client_id, "sweeping idle session");
                    manager.cleanup(&client_id, true).await;
                }
            }
        }));

        let manager = self.self_ref.clone();
        let mut pressure = governor.subscribe();
        background.push(tokio::spawn(async move {
            loop {
                match pressure.recv().await {
                    Ok(MemoryPressure::Emergency) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.degrade_all().await;
                    }
                    Ok(MemoryPressure::Cleanup) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop_background(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }

    /// Attach the client channel used for recovery notices.
    pub fn register_sink(&self, client_id: &str, sink: Arc<dyn ClientSink>) {
        self.sinks.write().insert(client_id.to_string(), sink);
    }

    pub fn unregister_sink(&self, client_id: &str) {
        self.sinks.write().remove(client_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Create a session for the client: browser, page (black initial frame),
    /// CMP blocklist, CDP channel, disconnect hook, health probe.
    pub async fn create(
        &self,
        client_id: &str,
        viewport: Viewport,
    ) -> Result<Arc<Session>, GatewayError> {
        let _guard = self.lifecycle.lock().await;
        self.create_locked(client_id, viewport).await
    }

    async fn create_locked(
        &self,
        client_id: &str,
        viewport: Viewport,
    ) -> Result<Arc<Session>, GatewayError> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.settings.max_create_retries.max(1) {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_secs(1) * (attempt - 1)).await;
            }
            match with_timeout(
                self.create_once(client_id, viewport),
                CREATE_ATTEMPT_TIMEOUT,
                "session create",
            )
            .await
            {
                Ok(session) => {
                    tracing::info!(%client_id, attempt, "session created");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(%client_id, attempt, error = %e, "session create attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(GatewayError::SessionCreateFailed(last_error))
    }

    async fn create_once(
        &self,
        client_id: &str,
        viewport: Viewport,
    ) -> Result<Arc<Session>, GatewayError> {
        let browser = self.driver.launch().await?;
        let page = browser.new_page(viewport).await?;

        // Interception problems must not block the page.
        if let Err(e) = page.block_consent_requests().await {
            tracing::warn!(%client_id, error = %e, "consent blocklist unavailable");
        }

        // Present a solid black frame before the CDP channel exists.
        let nav = NavTimeouts {
            primary: self.fabric.nav_primary_timeout,
            fallback: self.fabric.nav_fallback_timeout,
        };
        page.navigate(BLACK_PAGE_URL, nav).await?;

        let cdp = page.new_cdp().await?;

        // A dropped browser transport invalidates every session riding on it.
        let manager = self.self_ref.clone();
        let browser_ref = browser.clone();
        browser.on_disconnect(Arc::new(move || {
            let Some(manager) = manager.upgrade() else { return };
            let browser_ref = browser_ref.clone();
            tokio::spawn(async move {
                let sessions = manager.sessions.read().await;
                for session in sessions.values() {
                    if Arc::ptr_eq(&session.browser, &browser_ref) {
                        tracing::warn!(client_id = %session.client_id, "browser disconnected");
                        session.mark_unhealthy();
                    }
                }
            });
        }));

        // Renderer crash flags just this session.
        let manager = self.self_ref.clone();
        let crash_client = client_id.to_string();
        page.on_crash(Arc::new(move || {
            let Some(manager) = manager.upgrade() else { return };
            let crash_client = crash_client.clone();
            tokio::spawn(async move {
                if let Some(session) = manager.sessions.read().await.get(&crash_client) {
                    session.mark_unhealthy();
                }
            });
        }));

        let session = Session::new(
            client_id.to_string(),
            browser,
            page,
            cdp,
            viewport,
        );

        self.sessions
            .write()
            .await
            .insert(client_id.to_string(), session.clone());
        self.spawn_probe(client_id);

        Ok(session)
    }

    /// Fetch the client's session, refreshing its activity stamp. An
    /// unhealthy session is recovered before being returned.
    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(client_id).cloned()?;
        session.touch();
        if session.is_healthy() {
            Some(session)
        } else {
            tracing::info!(%client_id, "session unhealthy on access, recovering");
            self.recover(client_id).await
        }
    }

    /// `Page.enable` + `Page.startScreencast` at the standard profile capped
    /// to the given dimensions.
    pub async fn start_screencast(
        &self,
        session: &Arc<Session>,
    ) -> Result<(), GatewayError> {
        let viewport = session.viewport();
        session.cdp.enable_page().await?;
        session
            .cdp
            .start_screencast(ScreencastProfile::standard_for(viewport.width, viewport.height))
            .await?;
        Ok(())
    }

    /// Apply a new viewport and restart the screencast at the new size.
    pub async fn update_viewport(
        &self,
        client_id: &str,
        width: u32,
        height: u32,
    ) -> Result<(), GatewayError> {
        let session = self
            .get(client_id)
            .await
            .ok_or(GatewayError::SessionUnavailable)?;
        let viewport = Viewport { width, height };

        session.page.set_viewport(viewport).await?;
        if let Err(e) = session.cdp.stop_screencast().await {
            tracing::debug!(%client_id, error = %e, "stop before viewport restart failed");
        }
        session.set_viewport(viewport);
        self.start_screencast(&session).await?;
        Ok(())
    }

    /// Tear down a session's handles. Close failures are logged and
    /// swallowed; the handles are gone either way.
    pub async fn cleanup(&self, client_id: &str, remove_from_map: bool) {
        let _guard = self.lifecycle.lock().await;
        self.cleanup_locked(client_id, remove_from_map).await;
    }

    async fn cleanup_locked(&self, client_id: &str, remove_from_map: bool) {
        if let Some(handle) = self.probes.lock().remove(client_id) {
            handle.abort();
        }

        let session = self.sessions.read().await.get(client_id).cloned();
        if let Some(session) = session {
            close_session_handles(&session).await;
        }

        if remove_from_map {
            self.sessions.write().await.remove(client_id);
        }
    }

    /// Graceful-shutdown path: close every session in parallel.
    pub async fn cleanup_all(&self) {
        let _guard = self.lifecycle.lock().await;

        for (_, handle) in self.probes.lock().drain() {
            handle.abort();
        }

        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        tracing::info!(count = drained.len(), "closing all sessions");
        futures_util::future::join_all(
            drained.iter().map(|session| close_session_handles(session)),
        )
        .await;
    }

    /// Replace a broken session: close the old handles, then create fresh
    /// ones under the same client id and viewport. The client is notified on
    /// success; on failure the entry is removed.
    pub async fn recover(&self, client_id: &str) -> Option<Arc<Session>> {
        let _guard = self.lifecycle.lock().await;

        let viewport = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(client_id)?;
            if session.is_healthy() {
                // Another caller already recovered this client.
                return Some(session.clone());
            }
            session.viewport()
        };

        tracing::info!(%client_id, "recovering session");
        self.cleanup_locked(client_id, false).await;

        match self.create_locked(client_id, viewport).await {
            Ok(session) => {
                let sink = self.sinks.read().get(client_id).cloned();
                if let Some(sink) = sink {
                    sink.send_json(&json!({ "type": "session_recovered" }));
                }
                Some(session)
            }
            Err(e) => {
                tracing::error!(%client_id, error = %e, "recovery failed, dropping session");
                self.sessions.write().await.remove(client_id);
                self.probes.lock().remove(client_id);
                None
            }
        }
    }

    /// Emergency degrade: restart every live screencast at the low profile.
    async fn degrade_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        tracing::warn!(count = sessions.len(), "degrading all screencasts");
        for session in sessions {
            if let Err(e) = session.cdp.stop_screencast().await {
                tracing::debug!(client_id = %session.client_id, error = %e, "stop failed");
            }
            if let Err(e) = session
                .cdp
                .start_screencast(ScreencastProfile::degraded())
                .await
            {
                tracing::warn!(client_id = %session.client_id, error = %e, "degraded restart failed");
            }
        }
    }

    fn spawn_probe(&self, client_id: &str) {
        let manager = self.self_ref.clone();
        let client_id = client_id.to_string();
        let interval = self.settings.health_check_interval;
        let probe_timeout = self.settings.probe_timeout;
        let max_failures = self.settings.max_health_failures;

        let probe_client = client_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would probe a session still being
            // installed; skip it.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let session = manager.sessions.read().await.get(&probe_client).cloned();
                let Some(session) = session else { break };

                match run_health_probe(&session, probe_timeout).await {
                    Ok(()) => session.record_probe_success(),
                    Err(reason) => {
                        let failures = session.record_probe_failure();
                        tracing::warn!(
                            client_id = %probe_client,
                            failures,
                            %reason,
                            "health probe failed"
                        );
                        if failures >= max_failures {
                            session.mark_unhealthy();
                            // Recovery tears this probe down; run it from its
                            // own task and bow out.
                            let recover_mgr = manager.clone();
                            let recover_client = probe_client.clone();
                            tokio::spawn(async move {
                                recover_mgr.recover(&recover_client).await;
                            });
                            break;
                        }
                    }
                }
            }
        });

        if let Some(old) = self.probes.lock().insert(client_id, handle) {
            old.abort();
        }
    }
}

/// The four-step liveness check: transport up, process up, page responsive,
/// CDP channel responsive.
async fn run_health_probe(session: &Arc<Session>, timeout: Duration) -> Result<(), String> {
    if !session.browser.connected() {
        return Err("browser transport disconnected".into());
    }
    if !session.browser.process_alive() {
        return Err("browser process gone".into());
    }

    let outcome = with_timeout(session.page.eval("return true;"), timeout, "health eval")
        .await
        .map_err(|e| e.to_string())?;
    let truthy = outcome
        .result
        .as_ref()
        .map(|v| v.as_bool().unwrap_or(!v.is_null()))
        .unwrap_or(false);
    if !outcome.success || !truthy {
        return Err("page eval not truthy".into());
    }

    with_timeout(
        session.cdp.send(
            "Runtime.evaluate",
            json!({ "expression": "1+1", "returnByValue": true }),
        ),
        timeout,
        "health cdp",
    )
    .await
    .map_err(|e| e.to_string())?;

    Ok(())
}

async fn close_session_handles(session: &Arc<Session>) {
    if let Err(e) = session.cdp.stop_screencast().await {
        tracing::debug!(client_id = %session.client_id, error = %e, "screencast stop failed");
    }
    if !session.page.is_closed() {
        if let Err(e) = session.page.close().await {
            tracing::debug!(client_id = %session.client_id, error = %e, "page close failed");
        }
    }
    if session.browser.connected() {
        if let Err(e) = session.browser.close().await {
            tracing::debug!(client_id = %session.client_id, error = %e, "browser close failed");
        }
    }
}
