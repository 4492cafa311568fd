//! Runtime configuration for the gateway.

use std::time::Duration;

use crate::router::{DEFAULT_BACKEND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEALTH_TIMEOUT};
use crate::session::DEFAULT_SESSION_TIMEOUT;
use crate::traffic::DEFAULT_TRAFFIC_CAPACITY;

/// Gateway configuration.
///
/// All parameters can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (e.g., "127.0.0.1:8900")
    pub listen_addr: String,

    /// Idle timeout before a session expires
    pub session_timeout: Duration,

    /// Ring-buffer capacity of the traffic log
    pub traffic_capacity: usize,

    /// Timeout for forwarded backend requests (connection + response)
    pub backend_timeout: Duration,

    /// Connect timeout for backend requests
    pub connect_timeout: Duration,

    /// Timeout for backend health probes
    pub health_timeout: Duration,

    /// Interval between SSE keep-alive frames
    pub heartbeat_interval: Duration,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8900".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            traffic_capacity: DEFAULT_TRAFFIC_CAPACITY,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            heartbeat_interval: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `ARENA_GATEWAY_LISTEN` (default: "127.0.0.1:8900")
    /// - `ARENA_GATEWAY_SESSION_TIMEOUT_SECS` (default: 3600)
    /// - `ARENA_GATEWAY_TRAFFIC_CAPACITY` (default: 1000)
    /// - `ARENA_GATEWAY_BACKEND_TIMEOUT_SECS` (default: 30)
    /// - `ARENA_GATEWAY_CONNECT_TIMEOUT_SECS` (default: 5)
    /// - `ARENA_GATEWAY_HEALTH_TIMEOUT_SECS` (default: 5)
    /// - `ARENA_GATEWAY_HEARTBEAT_SECS` (default: 30)
    /// - `ARENA_GATEWAY_MAX_BODY_BYTES` (default: 1048576)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: std::env::var("ARENA_GATEWAY_LISTEN")
                .unwrap_or(defaults.listen_addr),
            session_timeout: env_duration_secs(
                "ARENA_GATEWAY_SESSION_TIMEOUT_SECS",
                defaults.session_timeout,
            ),
            traffic_capacity: env_parse(
                "ARENA_GATEWAY_TRAFFIC_CAPACITY",
                defaults.traffic_capacity,
            ),
            backend_timeout: env_duration_secs(
                "ARENA_GATEWAY_BACKEND_TIMEOUT_SECS",
                defaults.backend_timeout,
            ),
            connect_timeout: env_duration_secs(
                "ARENA_GATEWAY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            health_timeout: env_duration_secs(
                "ARENA_GATEWAY_HEALTH_TIMEOUT_SECS",
                defaults.health_timeout,
            ),
            heartbeat_interval: env_duration_secs(
                "ARENA_GATEWAY_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            ),
            max_body_size: env_parse("ARENA_GATEWAY_MAX_BODY_BYTES", defaults.max_body_size),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
