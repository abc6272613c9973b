use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use periscope_browser::{BrowserMode, CdpDriver, LaunchOptions};
use periscope_gateway::auth::AcceptNonEmpty;
use periscope_gateway::server::{serve, AppState};
use periscope_gateway::shutdown::ShutdownCoordinator;
use periscope_gateway::{
    CircuitBreaker, FabricConfig, MemoryGovernor, MessageRouter, SessionManager, SessionSettings,
};

/// Breaker around session creation: trips after repeated launch failures so
/// a broken browser install sheds load instead of stampeding.
const CREATE_BREAKER_THRESHOLD: u32 = 10;
const CREATE_BREAKER_RESET: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    name = "periscope-gateway",
    author,
    version,
    about = "Remote browser-streaming gateway"
)]
struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PERISCOPE_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    listen_addr: String,

    /// Chromium executable used for local launches.
    #[arg(long, env = "PERISCOPE_CHROME_PATH", default_value = "chromium")]
    chrome_path: String,

    /// Attach to a remote CDP endpoint instead of launching locally.
    #[arg(long, env = "PERISCOPE_CDP_URL")]
    cdp_url: Option<String>,

    /// Run the browser with a visible window (debugging aid).
    #[arg(long, env = "PERISCOPE_HEADFUL", default_value_t = false)]
    headful: bool,

    /// Process memory ceiling in MiB; defaults to 90% of system memory.
    #[arg(long, env = "PERISCOPE_MEMORY_LIMIT_MB")]
    memory_limit_mb: Option<u64>,

    /// Idle seconds before a session is swept.
    #[arg(long, env = "PERISCOPE_SESSION_TIMEOUT_SECS", default_value_t = 600)]
    session_timeout_secs: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Cockroach mode: a panicking task is a logged incident, never a process
    // exit - other clients keep streaming.
    std::panic::set_hook(Box::new(|info| {
        error!("task panicked: {info}");
    }));

    let cli = Cli::parse();
    let listen_addr: SocketAddr = cli
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

    let mode = match &cli.cdp_url {
        Some(ws_url) => BrowserMode::Attach {
            ws_url: ws_url.clone(),
        },
        None => BrowserMode::Launch(LaunchOptions {
            executable: cli.chrome_path.clone().into(),
            headless: !cli.headful,
            ..LaunchOptions::default()
        }),
    };

    let fabric = FabricConfig::from_env();
    let settings = SessionSettings {
        session_timeout: std::time::Duration::from_secs(cli.session_timeout_secs),
        ..SessionSettings::default()
    };

    let limit_bytes = cli
        .memory_limit_mb
        .map(|mb| mb * 1024 * 1024)
        .unwrap_or_else(periscope_gateway::memory::default_memory_limit);

    let governor = MemoryGovernor::new(limit_bytes);
    governor.init();

    let driver = Arc::new(CdpDriver::new(mode));
    let sessions = SessionManager::new(driver, fabric, settings);
    sessions.start_background(&governor);

    let state = AppState {
        router: MessageRouter::new(sessions.clone(), fabric),
        sessions: sessions.clone(),
        governor: governor.clone(),
        authenticator: Arc::new(AcceptNonEmpty),
        create_breaker: Arc::new(CircuitBreaker::new(
            CREATE_BREAKER_THRESHOLD,
            CREATE_BREAKER_RESET,
        )),
        active_connections: Arc::new(dashmap::DashMap::new()),
        shutdown: Arc::new(ShutdownCoordinator::new()),
        start_time: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "periscope gateway listening");

    // Signal handling: first SIGINT/SIGTERM starts the graceful teardown.
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.shutdown();
    });

    serve(state.clone(), listener)
        .await
        .context("server error")?;

    // Channels are closed; now release every browser and stop sampling.
    state.shutdown.graceful_shutdown(None).await;
    state.sessions.stop_background();
    state.sessions.cleanup_all().await;
    state.governor.shutdown();

    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
