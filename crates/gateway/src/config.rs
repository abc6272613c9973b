//! Gateway configuration.
//!
//! The operation fabric knobs are environment-driven so deployments tune
//! timeouts without a rebuild; everything else arrives through the CLI.

use std::time::Duration;

/// Timeouts, retry counts, and breaker thresholds for browser-side work.
#[derive(Debug, Clone, Copy)]
pub struct FabricConfig {
    /// First navigation strategy deadline (network idle).
    pub nav_primary_timeout: Duration,
    /// Fallback navigation strategy deadline (DOM content loaded).
    pub nav_fallback_timeout: Duration,
    pub nav_retries: u32,
    pub nav_backoff: Duration,
    /// Default deadline for non-navigation operations.
    pub op_timeout: Duration,
    pub op_retries: u32,
    /// Backoff between non-navigation retries.
    pub op_backoff: Duration,
    pub circuit_threshold: u32,
    pub circuit_reset: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            nav_primary_timeout: Duration::from_millis(20_000),
            nav_fallback_timeout: Duration::from_millis(15_000),
            nav_retries: 3,
            nav_backoff: Duration::from_millis(2_000),
            op_timeout: Duration::from_millis(10_000),
            op_retries: 2,
            op_backoff: Duration::from_millis(500),
            circuit_threshold: 5,
            circuit_reset: Duration::from_millis(60_000),
        }
    }
}

impl FabricConfig {
    /// Build from environment variables, falling back to defaults for unset
    /// or malformed values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            nav_primary_timeout: env_ms("NAV_PRIMARY_TIMEOUT_MS", defaults.nav_primary_timeout),
            nav_fallback_timeout: env_ms("NAV_FALLBACK_TIMEOUT_MS", defaults.nav_fallback_timeout),
            nav_retries: env_u32("NAV_RETRIES", defaults.nav_retries),
            nav_backoff: env_ms("NAV_BACKOFF_MS", defaults.nav_backoff),
            op_timeout: env_ms("OP_TIMEOUT_MS", defaults.op_timeout),
            op_retries: env_u32("OP_RETRIES", defaults.op_retries),
            op_backoff: defaults.op_backoff,
            circuit_threshold: env_u32("CIRCUIT_THRESHOLD", defaults.circuit_threshold),
            circuit_reset: env_ms("CIRCUIT_RESET_MS", defaults.circuit_reset),
        }
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Attempts for session creation (1 s x attempt backoff between them).
    pub max_create_retries: u32,
    pub health_check_interval: Duration,
    /// Deadline for each individual health probe step.
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a session is declared unhealthy.
    pub max_health_failures: u32,
    /// Idle time after which a session is swept.
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_create_retries: 3,
            health_check_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            max_health_failures: 3,
            session_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn env_ms(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "malformed duration, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "malformed count, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabric_defaults_match_contract() {
        let cfg = FabricConfig::default();
        assert_eq!(cfg.nav_primary_timeout, Duration::from_secs(20));
        assert_eq!(cfg.nav_fallback_timeout, Duration::from_secs(15));
        assert_eq!(cfg.nav_retries, 3);
        assert_eq!(cfg.nav_backoff, Duration::from_secs(2));
        assert_eq!(cfg.op_timeout, Duration::from_secs(10));
        assert_eq!(cfg.op_retries, 2);
        assert_eq!(cfg.circuit_threshold, 5);
        assert_eq!(cfg.circuit_reset, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("NAV_RETRIES", "7");
        std::env::set_var("OP_TIMEOUT_MS", "2500");
        let cfg = FabricConfig::from_env();
        assert_eq!(cfg.nav_retries, 7);
        assert_eq!(cfg.op_timeout, Duration::from_millis(2500));
        std::env::remove_var("NAV_RETRIES");
        std::env::remove_var("OP_TIMEOUT_MS");
    }

    #[test]
    fn malformed_env_falls_back() {
        std::env::set_var("CIRCUIT_THRESHOLD", "lots");
        let cfg = FabricConfig::from_env();
        assert_eq!(cfg.circuit_threshold, FabricConfig::default().circuit_threshold);
        std::env::remove_var("CIRCUIT_THRESHOLD");
    }

    #[test]
    fn session_defaults() {
        let s = SessionSettings::default();
        assert_eq!(s.health_check_interval, Duration::from_secs(15));
        assert_eq!(s.session_timeout, Duration::from_secs(600));
        assert!(s.max_health_failures >= 1);
    }
}
