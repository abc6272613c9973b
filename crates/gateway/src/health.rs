//! `/health` endpoint body.

use serde::Serialize;
use std::time::Instant;

use crate::fabric::BreakerState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "activeConnections")]
    pub active_connections: usize,
    #[serde(rename = "circuitBreaker")]
    pub circuit_breaker: BreakerSnapshot,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    #[serde(rename = "isOpen")]
    pub is_open: bool,
    pub failures: u32,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    active_connections: usize,
    breaker: BreakerState,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_seconds: start_time.elapsed().as_secs(),
        active_connections,
        circuit_breaker: BreakerSnapshot {
            is_open: breaker.is_open,
            failures: breaker.failures,
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_breaker() -> BreakerState {
        BreakerState {
            is_open: false,
            failures: 0,
            last_failure_at: None,
        }
    }

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, closed_breaker());
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 0, closed_breaker());
        assert!(resp.uptime_seconds >= 59);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let resp = health_check(Instant::now(), 3, closed_breaker());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["activeConnections"], 3);
        assert_eq!(json["circuitBreaker"]["isOpen"], false);
        assert_eq!(json["circuitBreaker"]["failures"], 0);
        assert!(json["uptimeSeconds"].is_number());
        assert!(json["timestamp"].is_string());
    }
}
