//! Endpoint configuration

use crate::cert::CredentialInputs;
use crate::transport::RelaySettings;
use crate::tunnel::TunnelSettings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tlsmux_core::tracing::LogFormat;
use tlsmux_core::{ValidateConfig, validators};

/// Prefix of environment overrides, e.g. `TLSMUX__LISTEN__BIND_ADDR`
pub const ENV_PREFIX: &str = "TLSMUX";

/// Complete endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Process settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Listener settings
    #[serde(default)]
    pub listen: ListenConfig,
    /// Credential inputs for the serving identity
    #[serde(default)]
    pub identity: CredentialInputs,
    /// Byte relay settings
    #[serde(default)]
    pub relay: RelayConfig,
    /// Multiplexed tunnel settings
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to accept TLS connections on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Destination string: `host:port`, or `path/host:port,...` in tunnel mode
    #[serde(default)]
    pub destination: String,
    /// Serve the multiplexed tunnel instead of the raw relay
    #[serde(default)]
    pub tunnel: bool,
    /// Tunnel path used when the destination string names none
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// TLS handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Byte relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Per-direction idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Destination connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Destination to client buffer, bytes
    #[serde(default = "default_buffer")]
    pub outbound_buffer: usize,
    /// Client to destination buffer, bytes
    #[serde(default = "default_buffer")]
    pub inbound_buffer: usize,
}

/// Tunnel listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_max_header_list_size")]
    pub max_header_list_size: u32,
    /// Seconds without an open tunnel stream before a connection is closed
    #[serde(default = "default_max_connection_idle")]
    pub max_connection_idle_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_service_name() -> String {
    "tlsmux.Tunnel".to_string()
}

const fn default_max_connections() -> usize {
    1024
}

const fn default_handshake_timeout() -> u64 {
    10
}

const fn default_idle_timeout() -> u64 {
    300
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_buffer() -> usize {
    32 * 1024
}

const fn default_keepalive_interval() -> u64 {
    60
}

const fn default_keepalive_timeout() -> u64 {
    20
}

const fn default_max_message_size() -> usize {
    64 * 1024
}

const fn default_initial_window_size() -> u32 {
    1024 * 1024
}

const fn default_max_concurrent_streams() -> u32 {
    64
}

const fn default_max_header_list_size() -> u32 {
    2048
}

const fn default_max_connection_idle() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            destination: String::new(),
            tunnel: false,
            service_name: default_service_name(),
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            outbound_buffer: default_buffer(),
            inbound_buffer: default_buffer(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            max_message_size: default_max_message_size(),
            initial_window_size: default_initial_window_size(),
            max_concurrent_streams: default_max_concurrent_streams(),
            max_header_list_size: default_max_header_list_size(),
            max_connection_idle_secs: default_max_connection_idle(),
        }
    }
}

impl EndpointConfig {
    /// Load configuration from defaults, an optional `tlsmux.{toml,yaml}` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("tlsmux").required(false))
            .add_source(File::with_name("config/tlsmux").required(false))
            .add_source(env_source());

        builder.build()?.try_deserialize()
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(path))
            // Environment can override file settings
            .add_source(env_source());

        builder.build()?.try_deserialize()
    }

    pub const fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
            outbound_buffer: self.relay.outbound_buffer,
            inbound_buffer: self.relay.inbound_buffer,
        }
    }

    pub const fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            keepalive_interval: Duration::from_secs(self.tunnel.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.tunnel.keepalive_timeout_secs),
            max_message_size: self.tunnel.max_message_size,
            initial_window_size: self.tunnel.initial_window_size,
            max_concurrent_streams: self.tunnel.max_concurrent_streams,
            max_header_list_size: self.tunnel.max_header_list_size,
            max_connection_idle: Duration::from_secs(self.tunnel.max_connection_idle_secs),
        }
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.listen.handshake_timeout_secs)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

impl ValidateConfig for EndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validators::validate_log_level(&self.server.log_level, "server.log_level")?;

        // Listener
        let port = self
            .listen
            .bind_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .ok_or_else(|| {
                ConfigError::Message(format!(
                    "listen.bind_addr: expected host:port, got [{}]",
                    self.listen.bind_addr
                ))
            })?;
        validators::validate_port(port, "listen.bind_addr")?;
        validators::validate_not_empty(&self.listen.destination, "listen.destination")?;
        if self.listen.tunnel {
            validators::validate_not_empty(&self.listen.service_name, "listen.service_name")?;
        }
        validators::validate_range(
            self.listen.max_connections,
            1,
            1_000_000,
            "listen.max_connections",
        )?;
        validators::validate_range(
            self.listen.handshake_timeout_secs,
            1,
            300,
            "listen.handshake_timeout_secs",
        )?;

        // Relay
        validators::validate_range(
            self.relay.idle_timeout_secs,
            1,
            86_400,
            "relay.idle_timeout_secs",
        )?;
        validators::validate_range(
            self.relay.connect_timeout_secs,
            1,
            300,
            "relay.connect_timeout_secs",
        )?;
        validators::validate_range(
            self.relay.outbound_buffer,
            512,
            16 * 1024 * 1024,
            "relay.outbound_buffer",
        )?;
        validators::validate_range(
            self.relay.inbound_buffer,
            512,
            16 * 1024 * 1024,
            "relay.inbound_buffer",
        )?;

        // Tunnel
        validators::validate_range(
            self.tunnel.keepalive_interval_secs,
            1,
            3600,
            "tunnel.keepalive_interval_secs",
        )?;
        validators::validate_range(
            self.tunnel.keepalive_timeout_secs,
            1,
            600,
            "tunnel.keepalive_timeout_secs",
        )?;
        validators::validate_range(
            self.tunnel.max_message_size,
            1024,
            16 * 1024 * 1024,
            "tunnel.max_message_size",
        )?;
        // HTTP/2 flow control windows are capped at 2^31 - 1
        validators::validate_range(
            self.tunnel.initial_window_size,
            65_535,
            0x7fff_ffff,
            "tunnel.initial_window_size",
        )?;
        validators::validate_range(
            self.tunnel.max_concurrent_streams,
            1,
            10_000,
            "tunnel.max_concurrent_streams",
        )?;
        validators::validate_range(
            self.tunnel.max_header_list_size,
            256,
            1024 * 1024,
            "tunnel.max_header_list_size",
        )?;
        validators::validate_range(
            self.tunnel.max_connection_idle_secs,
            1,
            86_400,
            "tunnel.max_connection_idle_secs",
        )?;

        Ok(())
    }
}
