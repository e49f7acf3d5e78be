//! Device configuration.
//!
//! The configuration is a JSON document, as stored by the provisioning
//! portal. Every field has a default, so a file only needs to name the
//! gateway host and the device MAC.
//!
//! ```json
//! {
//!   "gateway": { "host": "192.168.1.10" },
//!   "identity": { "mac": "24:0a:c4:12:34:56" },
//!   "registration": { "username": "alice", "has_relay": true }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backpressure::{DEFAULT_ACK_TIMEOUT, DEFAULT_RETRY_TICK, DEFAULT_SEND_BUFFER_SIZE};
use crate::connection::{
    ConnectionBuilder, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_GATEWAY_PORT, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_RETRY_DELAY,
};
use crate::device::{LoopConfig, DEFAULT_LOOP_DELAY, DEFAULT_MAX_CONNECT_FAILURES};
use crate::error::{DoorbellError, Result};
use crate::protocol::{MacAddress, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::session::{DEFAULT_RELAY_OPEN, DEFAULT_STREAM_WINDOW};
use crate::transport::{TcpConfig, DEFAULT_CONNECT_TIMEOUT};

/// Main device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub gateway: GatewayConfig,
    pub registration: RegistrationConfig,
    pub identity: IdentityConfig,
    pub link: LinkConfig,
    pub session: SessionSettings,
    pub device: LoopSettings,
    pub logging: LoggingConfig,
}

/// Where the gateway lives and how hard to try reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_GATEWAY_PORT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
            retry_delay_ms: millis(DEFAULT_RETRY_DELAY),
        }
    }
}

/// Registration with gateways that ask for a username.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Username entered by the user, if any.
    pub username: Option<String>,
    /// The device has a door relay fitted.
    pub has_relay: bool,
    /// Append the relay byte to the Username packet.
    pub announce_relay: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            username: None,
            has_relay: false,
            announce_relay: true,
        }
    }
}

impl RegistrationConfig {
    /// Relay byte to send with the username.
    pub fn relay_flag(&self) -> Option<bool> {
        self.announce_relay.then_some(self.has_relay)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Station MAC, `aa:bb:cc:dd:ee:ff`.
    pub mac: String,
}

/// Link timings and buffer sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ack_timeout_ms: u64,
    pub retry_tick_ms: u64,
    pub max_payload_size: u32,
    pub send_buffer_size: usize,
    pub read_chunk_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: millis(DEFAULT_ACK_TIMEOUT),
            retry_tick_ms: millis(DEFAULT_RETRY_TICK),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Streaming and relay timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub stream_window_ms: u64,
    pub default_relay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stream_window_ms: millis(DEFAULT_STREAM_WINDOW),
            default_relay_ms: millis(DEFAULT_RELAY_OPEN),
        }
    }
}

/// Main loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub loop_delay_ms: u64,
    pub max_connect_failures: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            loop_delay_ms: millis(DEFAULT_LOOP_DELAY),
            max_connect_failures: DEFAULT_MAX_CONNECT_FAILURES,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
    /// Colored text output.
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            color: true,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl DeviceConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DoorbellError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            return Err(DoorbellError::Config("Gateway host is empty".into()));
        }
        if self.gateway.port == 0 {
            return Err(DoorbellError::Config("Gateway port must be non-zero".into()));
        }

        let timeouts = [
            ("gateway.connect_timeout_ms", self.gateway.connect_timeout_ms),
            ("link.ack_timeout_ms", self.link.ack_timeout_ms),
            ("link.retry_tick_ms", self.link.retry_tick_ms),
            ("session.stream_window_ms", self.session.stream_window_ms),
            ("device.loop_delay_ms", self.device.loop_delay_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(DoorbellError::Config(format!("{name} must be non-zero")));
        }

        if self.link.send_buffer_size == 0 || self.link.read_chunk_size == 0 {
            return Err(DoorbellError::Config(
                "Link buffer sizes must be non-zero".into(),
            ));
        }

        self.mac()?;
        Ok(())
    }

    /// Parsed station MAC.
    pub fn mac(&self) -> Result<MacAddress> {
        self.identity.mac.parse()
    }

    /// Connection builder carrying every gateway, link and session setting.
    pub fn connection_builder(&self) -> Result<ConnectionBuilder> {
        Ok(ConnectionBuilder::new(self.gateway.host.clone())
            .port(self.gateway.port)
            .connect_attempts(self.gateway.connect_attempts)
            .retry_delay(Duration::from_millis(self.gateway.retry_delay_ms))
            .read_chunk_size(self.link.read_chunk_size)
            .max_payload_size(self.link.max_payload_size)
            .ack_timeout(Duration::from_millis(self.link.ack_timeout_ms))
            .retry_tick(Duration::from_millis(self.link.retry_tick_ms))
            .mac(self.mac()?)
            .stream_window(Duration::from_millis(self.session.stream_window_ms))
            .default_relay_open(Duration::from_millis(self.session.default_relay_ms))
            .relay_flag(self.registration.relay_flag()))
    }

    /// TCP transport settings.
    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            connect_timeout: Duration::from_millis(self.gateway.connect_timeout_ms),
            send_buffer_size: self.link.send_buffer_size,
            read_chunk_size: self.link.read_chunk_size,
            ..TcpConfig::default()
        }
    }

    /// Device loop settings.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            loop_delay: Duration::from_millis(self.device.loop_delay_ms),
            max_connect_failures: self.device.max_connect_failures.max(1),
        }
    }
}

/// Initialize logging from configuration.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| DoorbellError::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| DoorbellError::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
