use std::time::Duration;

use marquee_common::InstanceId;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Base URL of the identity/data service (e.g. `http://localhost:4001`).
    pub data_service_url: String,
    /// Redis URL for cross-instance fan-out. `None` runs a single-instance
    /// in-process bus.
    pub redis_url: Option<String>,
    /// Upper bound for every data-service call, in seconds.
    pub rpc_timeout_secs: u64,
    /// Sessions silent for longer than this are closed, in seconds.
    pub idle_timeout_secs: u64,
    /// Shared secret required on `/internal/*` when set.
    pub internal_token: Option<String>,
    /// Snowflake worker id for session ids.
    pub worker_id: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 3000),
            data_service_url: required_var("DATA_SERVICE_URL"),
            redis_url: optional_var("REDIS_URL"),
            rpc_timeout_secs: parsed_var("RPC_TIMEOUT_SECS", 10),
            idle_timeout_secs: parsed_var("IDLE_TIMEOUT_SECS", 60),
            internal_token: optional_var("INTERNAL_TOKEN"),
            worker_id: parsed_var("WORKER_ID", 0),
        }
    }

    /// Runtime knobs derived from this configuration.
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            worker_id: self.worker_id,
            ..GatewaySettings::default()
        }
    }
}

/// Knobs the session and room layer reads at runtime.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub instance_id: InstanceId,
    pub idle_timeout: Duration,
    /// How often the keepalive loop checks `last_seen`.
    pub keepalive_check: Duration,
    pub rpc_timeout: Duration,
    /// Playback clock increment period.
    pub clock_tick: Duration,
    /// Outbound frames buffered per session before new ones are dropped.
    pub outbound_capacity: usize,
    /// Inbound events buffered between the read loop and the room loop.
    pub event_capacity: usize,
    pub worker_id: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::generate(),
            idle_timeout: Duration::from_secs(60),
            keepalive_check: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            clock_tick: Duration::from_secs(1),
            outbound_capacity: 256,
            event_capacity: 64,
            worker_id: 0,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
