//! Process-wide memory governor.
//!
//! Samples resident set size on an interval and sheds frame buffers before
//! the process gets anywhere near the configured ceiling. Sessions react to
//! emergencies by restarting their screencast at the degraded profile.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::pump::FrameQueue;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
const CLEANUP_PERCENT: f64 = 85.0;
const EMERGENCY_PERCENT: f64 = 95.0;
/// How many frames each client keeps through a cleanup pass.
const CLEANUP_KEEP_FRAMES: usize = 2;

/// Classified pressure reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Nominal,
    Cleanup,
    Emergency,
}

impl PressureLevel {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= EMERGENCY_PERCENT {
            PressureLevel::Emergency
        } else if percent >= CLEANUP_PERCENT {
            PressureLevel::Cleanup
        } else {
            PressureLevel::Nominal
        }
    }
}

/// Event fanned out to interested components (the session manager restarts
/// screencasts degraded on `Emergency`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Cleanup,
    Emergency,
}

/// Explicitly constructed process-wide service; the gateway passes it by
/// reference so tests can substitute their own instance.
pub struct MemoryGovernor {
    queues: DashMap<String, FrameQueue>,
    limit_bytes: u64,
    events: broadcast::Sender<MemoryPressure>,
    sampler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<MemoryGovernor>,
}

impl MemoryGovernor {
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new_cyclic(|weak| Self {
            queues: DashMap::new(),
            limit_bytes: limit_bytes.max(1),
            events,
            sampler: parking_lot::Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Start the sampling task.
    pub fn init(&self) {
        let governor = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(governor) = governor.upgrade() else { break };
                let percent = governor.rss_percent();
                let level = PressureLevel::from_percent(percent);
                if level != PressureLevel::Nominal {
                    tracing::warn!(percent = format!("{percent:.1}"), ?level, "memory pressure");
                }
                governor.apply_pressure(level);
            }
        });
        *self.sampler.lock() = Some(handle);
    }

    /// Stop sampling. Called during graceful shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryPressure> {
        self.events.subscribe()
    }

    /// Stream pumps register their queue at bind time.
    pub fn register_queue(&self, client_id: impl Into<String>, queue: FrameQueue) {
        self.queues.insert(client_id.into(), queue);
    }

    /// Drop all governor state for a departed client.
    pub fn clear_client(&self, client_id: &str) {
        self.queues.remove(client_id);
    }

    pub fn tracked_clients(&self) -> usize {
        self.queues.len()
    }

    /// Apply the queue-side effects of a pressure level and notify listeners.
    /// Public so tests (and forced-pressure tooling) can drive it directly.
    pub fn apply_pressure(&self, level: PressureLevel) {
        match level {
            PressureLevel::Nominal => {}
            PressureLevel::Cleanup => {
                for entry in self.queues.iter() {
                    entry.value().trim_to(CLEANUP_KEEP_FRAMES);
                }
                let _ = self.events.send(MemoryPressure::Cleanup);
            }
            PressureLevel::Emergency => {
                for entry in self.queues.iter() {
                    entry.value().clear();
                }
                let _ = self.events.send(MemoryPressure::Emergency);
            }
        }
    }

    fn rss_percent(&self) -> f64 {
        let rss = current_process_memory_bytes();
        (rss as f64 / self.limit_bytes as f64) * 100.0
    }
}

fn current_process_memory_bytes() -> u64 {
    let mut system = System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

/// Default ceiling: 90 % of total system memory.
pub fn default_memory_limit() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        // Unknown platform reading; fall back to a conservative 2 GiB.
        2 * 1024 * 1024 * 1024
    } else {
        total / 10 * 9
    }
}
