//! Client configuration.
//!
//! Read from `~/.config/exo/config.toml`; every field has a default, so a
//! missing file or section is fine. `EXO_HOST`, `EXO_PORT` and
//! `EXO_WEBSOCKET_PORT` override the backend address.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use exo_core::{
    Address,
    address::{DEFAULT_FALLBACK_PORT, DEFAULT_PRIMARY_PORT},
};
use exo_discovery::{DockerCliConfig, LaunchTemplate, runtime::DEFAULT_LABEL};
use exo_session::{ManagerConfig, ReconnectPolicy};
use exo_transport::{FramedConfig, RawSocketConfig, framed::PRIMARY_PATH};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Backend host override.
pub const ENV_HOST: &str = "EXO_HOST";
/// Primary port override.
pub const ENV_PORT: &str = "EXO_PORT";
/// Fallback port override.
pub const ENV_WEBSOCKET_PORT: &str = "EXO_WEBSOCKET_PORT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Host used when no discovery runs
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,
    #[serde(default = "default_fallback_port")]
    pub fallback_port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            primary_port: default_primary_port(),
            fallback_port: default_fallback_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bound on establishing either socket
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Time the primary gets before the fallback joins
    #[serde(default = "default_primary_grace")]
    pub primary_grace_ms: u64,
    /// Bound on one whole connection attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which the primary is considered dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_primary_path")]
    pub primary_path: String,
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            primary_grace_ms: default_primary_grace(),
            attempt_timeout_ms: default_attempt_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            primary_path: default_primary_path(),
            fallback_path: default_fallback_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Envelopes held while disconnected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Runtime base command, e.g. "docker" or "podman --remote"
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,
    #[serde(default = "default_label")]
    pub label: String,
    /// Host the published container ports are reached on
    #[serde(default = "default_host")]
    pub host: String,
    /// Image to launch when no backend runs; launching is off without it
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    /// Extra `run` arguments
    #[serde(default)]
    pub run_args: Vec<String>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_launch_ready_attempts")]
    pub launch_ready_attempts: u32,
    #[serde(default = "default_launch_ready_interval")]
    pub launch_ready_interval_ms: u64,
    /// Where the last used backend is remembered
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Use the static backend address when running inside a container
    #[serde(default = "default_true")]
    pub skip_in_container: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            runtime_command: default_runtime_command(),
            label: default_label(),
            host: default_host(),
            image: None,
            container_name: None,
            run_args: Vec::new(),
            probe_timeout_ms: default_probe_timeout(),
            launch_ready_attempts: default_launch_ready_attempts(),
            launch_ready_interval_ms: default_launch_ready_interval(),
            state_file: None,
            skip_in_container: default_true(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_primary_port() -> u16 {
    DEFAULT_PRIMARY_PORT
}

const fn default_fallback_port() -> u16 {
    DEFAULT_FALLBACK_PORT
}

const fn default_connect_timeout() -> u64 {
    5_000
}

const fn default_primary_grace() -> u64 {
    3_000
}

const fn default_attempt_timeout() -> u64 {
    10_000
}

const fn default_heartbeat_interval() -> u64 {
    10_000
}

const fn default_heartbeat_timeout() -> u64 {
    30_000
}

const fn default_ack_timeout() -> u64 {
    15_000
}

fn default_primary_path() -> String {
    PRIMARY_PATH.to_string()
}

fn default_fallback_path() -> String {
    "/".to_string()
}

const fn default_base_delay() -> u64 {
    500
}

const fn default_max_delay() -> u64 {
    8_000
}

const fn default_max_attempts() -> u32 {
    6
}

const fn default_queue_capacity() -> usize {
    32
}

fn default_runtime_command() -> String {
    "docker".to_string()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

const fn default_probe_timeout() -> u64 {
    1_000
}

const fn default_launch_ready_attempts() -> u32 {
    10
}

const fn default_launch_ready_interval() -> u64 {
    1_000
}

const fn default_true() -> bool {
    true
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if path_str == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

impl ClientConfig {
    /// Load from the default path, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed, or an
    /// override is not a valid value.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load from `path`, or the defaults if it does not exist.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Always `~/.config/exo/config.toml`, on every platform.
    #[must_use]
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("exo")
            .join("config.toml")
    }

    /// Apply `EXO_HOST`, `EXO_PORT` and `EXO_WEBSOCKET_PORT` from `lookup`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidOverride`] for a port that does not parse.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            self.backend.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.backend.primary_port = parse_port(ENV_PORT, &port)?;
        }
        if let Some(port) = lookup(ENV_WEBSOCKET_PORT) {
            self.backend.fallback_port = parse_port(ENV_WEBSOCKET_PORT, &port)?;
        }
        Ok(())
    }

    /// Static backend address.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(
            self.backend.host.clone(),
            self.backend.primary_port,
            self.backend.fallback_port,
        )
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            primary_grace: Duration::from_millis(self.transport.primary_grace_ms),
            attempt_timeout: Duration::from_millis(self.transport.attempt_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: self.reconnect.max_attempts,
            },
            queue_capacity: self.reconnect.queue_capacity,
        }
    }

    #[must_use]
    pub fn framed_config(&self) -> FramedConfig {
        FramedConfig {
            path: self.transport.primary_path.clone(),
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.transport.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.transport.heartbeat_timeout_ms),
            ack_timeout: Duration::from_millis(self.transport.ack_timeout_ms),
        }
    }

    #[must_use]
    pub fn raw_socket_config(&self) -> RawSocketConfig {
        RawSocketConfig {
            path: self.transport.fallback_path.clone(),
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
        }
    }

    #[must_use]
    pub fn docker_config(&self) -> DockerCliConfig {
        let d = &self.discovery;
        DockerCliConfig {
            command: d.runtime_command.clone(),
            label: d.label.clone(),
            host: d.host.clone(),
            primary_port: default_primary_port(),
            fallback_port: default_fallback_port(),
            launch: d.image.clone().map(|image| LaunchTemplate {
                image,
                name: d.container_name.clone(),
                args: d.run_args.clone(),
            }),
        }
    }

    #[must_use]
    pub fn discovery_config(&self) -> exo_discovery::DiscoveryConfig {
        exo_discovery::DiscoveryConfig {
            launch_ready_attempts: self.discovery.launch_ready_attempts,
            launch_ready_interval: Duration::from_millis(self.discovery.launch_ready_interval_ms),
        }
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.probe_timeout_ms)
    }

    /// Configured state file with `~` expanded.
    #[must_use]
    pub fn state_file(&self) -> Option<PathBuf> {
        self.discovery.state_file.as_deref().map(expand_tilde)
    }
}

fn parse_port(name: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ConfigError::InvalidOverride {
            name,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.address(), Address::new("localhost", 8080, 8765));
        assert_eq!(config.manager_config().reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_partial_sections() {
        let config: ClientConfig = toml::from_str(
            r#"
            [backend]
            host = "10.1.2.3"

            [reconnect]
            max_attempts = 3

            [discovery]
            runtime_command = "podman"
            image = "exo/backend:dev"
            state_file = "~/exo-last.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.host, "10.1.2.3");
        assert_eq!(config.backend.primary_port, 8080);
        assert_eq!(config.manager_config().reconnect.max_attempts, 3);
        assert_eq!(config.manager_config().queue_capacity, 32);

        let docker = config.docker_config();
        assert_eq!(docker.command, "podman");
        assert_eq!(docker.launch.unwrap().image, "exo/backend:dev");
        assert!(!config.state_file().unwrap().starts_with("~"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_HOST, "backend.local"),
            (ENV_PORT, "9080"),
            (ENV_WEBSOCKET_PORT, " 9765 "),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.address(), Address::new("backend.local", 9080, 9765));
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = ClientConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_PORT).then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { name: ENV_PORT, .. }));
        assert!(
            config
                .apply_overrides(|name| (name == ENV_WEBSOCKET_PORT).then(|| "0".to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = ClientConfig::default();
        config.discovery.run_args = vec!["--rm".to_string()];
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<ClientConfig>(&text).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("exo-no-such-config.toml");
        assert_eq!(ClientConfig::load_from(&path).unwrap(), ClientConfig::default());
    }
}
