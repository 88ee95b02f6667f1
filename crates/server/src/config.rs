//! Server configuration: a TOML file with environment-variable overrides.
//!
//! Environment variables (`BUS_URL`, `STORE_URL`, `POLICY_URL`,
//! `HTTP_PORT`, `LOG_LEVEL`, `LOG_JSON`, `EMISSION_INTERVAL`,
//! `CORRELATION_WINDOW`, `TRACK_COUNT`, `AGENT_ID`, `AGENT_SECRET`) win
//! over file values, so containerized deployments need no config file.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AegisConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Store backend settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Bus settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Policy engine settings.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Pipeline agent settings.
    #[serde(default)]
    pub agents: AgentsConfig,
}

/// HTTP server settings.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful-shutdown budget in seconds.
    #[serde(default = "default_shutdown_seconds")]
    pub shutdown_timeout_seconds: u64,
    /// Log level when `RUST_LOG`/`LOG_LEVEL` are unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines.
    #[serde(default)]
    pub log_json: bool,
}

/// Store backend settings.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// `memory`, or `postgres` (requires the `postgres` build feature).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// Connection URL for networked backends.
    pub url: Option<String>,
}

/// Bus settings. The embedded bus ignores the URL; a networked
/// [`aegis_bus::MessageBus`] implementation would use it.
#[derive(Debug, Default, Deserialize)]
pub struct BusConfig {
    /// Broker URL for a networked bus backend.
    pub url: Option<String>,
}

/// Policy engine settings.
#[derive(Debug, Default, Deserialize)]
pub struct PolicyConfig {
    /// Engine base URL (e.g. `http://localhost:8181`). Unset disables
    /// policy evaluation.
    pub url: Option<String>,
}

/// Pipeline agent settings, shared by `aegis-server` and `aegis-agentd`.
#[derive(Debug, Deserialize)]
pub struct AgentsConfig {
    /// Run the pipeline stages inside the server process. Disable when
    /// `aegis-agentd` hosts them instead.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Agent id prefix (`AGENT_ID`).
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Hex-encoded 32-byte envelope signing key (`AGENT_SECRET`).
    pub secret: Option<String>,
    /// Sensor emission interval in milliseconds (`EMISSION_INTERVAL`).
    #[serde(default = "default_emission_interval_ms")]
    pub emission_interval_ms: u64,
    /// Simulated track count (`TRACK_COUNT`).
    #[serde(default = "default_track_count")]
    pub track_count: usize,
    /// Start the sensor paused.
    #[serde(default)]
    pub sensor_paused: bool,
    /// Correlator merge window in seconds (`CORRELATION_WINDOW`).
    #[serde(default = "default_correlation_window_secs")]
    pub correlation_window_secs: u64,
    /// Display window for "active" tracks, in seconds.
    #[serde(default = "default_display_window_secs")]
    pub track_display_window_secs: u64,
    /// Hard retention cutoff for inactive tracks, in seconds.
    #[serde(default = "default_hard_ttl_secs")]
    pub track_hard_ttl_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_port() -> u16 {
    8080
}
fn default_shutdown_seconds() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_store_backend() -> String {
    "memory".to_owned()
}
fn default_true() -> bool {
    true
}
fn default_agent_id() -> String {
    "aegis".to_owned()
}
fn default_emission_interval_ms() -> u64 {
    1000
}
fn default_track_count() -> usize {
    10
}
fn default_correlation_window_secs() -> u64 {
    10
}
fn default_display_window_secs() -> u64 {
    60
}
fn default_hard_ttl_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_seconds(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: None,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_id: default_agent_id(),
            secret: None,
            emission_interval_ms: default_emission_interval_ms(),
            track_count: default_track_count(),
            sensor_paused: false,
            correlation_window_secs: default_correlation_window_secs(),
            track_display_window_secs: default_display_window_secs(),
            track_hard_ttl_secs: default_hard_ttl_secs(),
        }
    }
}

impl AegisConfig {
    /// Apply environment-variable overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BUS_URL") {
            self.bus.url = Some(url);
        }
        if let Ok(url) = std::env::var("STORE_URL") {
            self.store.url = Some(url);
            self.store.backend = "postgres".to_owned();
        }
        if let Ok(url) = std::env::var("POLICY_URL") {
            self.policy.url = Some(url);
        }
        if let Ok(port) = std::env::var("HTTP_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Ok(json) = std::env::var("LOG_JSON") {
            self.server.log_json = json == "true" || json == "1";
        }
        if let Ok(interval) = std::env::var("EMISSION_INTERVAL")
            && let Ok(interval) = interval.parse()
        {
            self.agents.emission_interval_ms = interval;
        }
        if let Ok(window) = std::env::var("CORRELATION_WINDOW")
            && let Ok(window) = window.parse()
        {
            self.agents.correlation_window_secs = window;
        }
        if let Ok(count) = std::env::var("TRACK_COUNT")
            && let Ok(count) = count.parse()
        {
            self.agents.track_count = count;
        }
        if let Ok(id) = std::env::var("AGENT_ID") {
            self.agents.agent_id = id;
        }
        if let Ok(secret) = std::env::var("AGENT_SECRET") {
            self.agents.secret = Some(secret);
        }
    }

    /// The display window used as the default `since` for track queries.
    #[must_use]
    pub fn display_window(&self) -> Duration {
        Duration::from_secs(self.agents.track_display_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AegisConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, "memory");
        assert!(config.agents.enabled);
        assert_eq!(config.agents.track_count, 10);
    }

    #[test]
    fn file_values_parse() {
        let config: AegisConfig = toml::from_str(
            r#"
            [server]
            port = 9090
            log_json = true

            [agents]
            track_count = 3
            emission_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.server.log_json);
        assert_eq!(config.agents.track_count, 3);
        assert_eq!(config.agents.emission_interval_ms, 250);
    }
}
