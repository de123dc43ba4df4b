//! Configuration value objects for transports and hubs.
//!
//! Every tunable lives here and is handed to a transport or hub when it is
//! constructed. All structs deserialize with `#[serde(default)]`, so a config
//! file only needs to name the fields it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base listening port used when a hub is started without an explicit port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default number of port increments a hub tries before giving up.
pub const DEFAULT_MAX_PORT_RETRIES: u32 = 99;

/// Default socket read / accept timeout in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 2_000;

/// Default read buffer size in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256;

/// Maximum size of a single escaped record (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialization used on the wire. Both peers of a connection must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// MessagePack records separated by a three-byte NUL delimiter.
    #[default]
    Binary,
    /// Legacy newline-delimited JSON objects (`{"type": .., "data": ..}`).
    JsonLines,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::JsonLines => write!(f, "json_lines"),
        }
    }
}

/// Retry policy for transient connection failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try). `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_delay_ms: 10,
            max_delay_ms: 1_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A bounded policy with `max_attempts` attempts and the default delays.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on a single socket read before the read loop wakes up to
    /// flush pending writes and re-check its shutdown signal.
    pub io_timeout_ms: u64,
    /// Upper bound on a single outbound connect attempt.
    pub connect_timeout_ms: u64,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Largest escaped record sent or accepted. Both peers should agree.
    pub max_frame_bytes: usize,
    /// Compress every record with zlib.
    pub compression: bool,
    /// Every channel write requires an acknowledgement from the peer.
    pub require_ack: bool,
    /// Queue writes while the write gate is closed instead of failing.
    pub buffer_enabled: bool,
    /// Record serialization.
    pub wire_format: WireFormat,
    /// Capacity of the per-transport event broadcast channel.
    pub event_capacity: usize,
    /// Retry policy for outbound connects.
    pub connect_retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_bytes: MAX_FRAME_SIZE,
            compression: false,
            require_ack: false,
            buffer_enabled: false,
            wire_format: WireFormat::Binary,
            event_capacity: 256,
            connect_retry: RetryConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

/// Settings for a hub (connection manager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Host the listener binds on.
    pub host: String,
    /// Requested listening port. `None` starts at [`DEFAULT_PORT`] and
    /// always searches upward for a free port.
    pub port: Option<u16>,
    /// When an explicit `port` is taken, try the following ports instead of
    /// failing.
    pub find_open_port: bool,
    /// How many times the port may be incremented before binding fails.
    pub max_port_retries: u32,
    /// Settings applied to every transport the hub creates.
    pub transport: TransportConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            find_open_port: false,
            max_port_retries: DEFAULT_MAX_PORT_RETRIES,
            transport: TransportConfig::default(),
        }
    }
}

impl HubConfig {
    /// Port the first bind attempt uses.
    pub fn base_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Whether an address-in-use failure may move on to the next port.
    pub fn auto_port(&self) -> bool {
        self.port.is_none() || self.find_open_port
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hub: HubConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.io_timeout(), Duration::from_secs(2));
        assert_eq!(config.read_buffer_size, 256);
        assert_eq!(config.max_frame_bytes, MAX_FRAME_SIZE);
        assert!(!config.compression);
        assert!(!config.require_ack);
        assert!(!config.buffer_enabled);
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert_eq!(config.connect_retry.max_attempts, None);
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = TransportConfig {
            io_timeout_ms: 0,
            ..TransportConfig::default()
        };
        assert_eq!(config.io_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_hub_port_selection() {
        let auto = HubConfig::default();
        assert_eq!(auto.base_port(), DEFAULT_PORT);
        assert!(auto.auto_port());

        let explicit = HubConfig {
            port: Some(9000),
            ..HubConfig::default()
        };
        assert_eq!(explicit.base_port(), 9000);
        assert!(!explicit.auto_port());

        let searching = HubConfig {
            port: Some(9000),
            find_open_port: true,
            ..HubConfig::default()
        };
        assert!(searching.auto_port());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [hub]
            port = 9100

            [hub.transport]
            require_ack = true
            wire_format = "json_lines"
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.port, Some(9100));
        assert_eq!(config.hub.host, "0.0.0.0");
        assert!(config.hub.transport.require_ack);
        assert_eq!(config.hub.transport.wire_format, WireFormat::JsonLines);
        assert_eq!(config.hub.max_port_retries, DEFAULT_MAX_PORT_RETRIES);
    }

    #[test]
    fn test_retry_config_json() {
        let json = serde_json::to_string(&RetryConfig::bounded(4)).unwrap();
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_attempts, Some(4));
        assert_eq!(back.min_delay_ms, 10);
    }
}
