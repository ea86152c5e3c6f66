//! Configuration for the SSH daemon

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SSH daemon configuration
///
/// Passed explicitly to [`crate::Server::new`]; nothing is read from process globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port (default: 2222 for non-privileged)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum public keys a client may offer on one connection (NIST 800-53: AC-7)
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,

    /// Delay before answering a rejected authentication, in milliseconds
    #[serde(default = "default_auth_rejection_time_ms")]
    pub auth_rejection_time_ms: u64,

    /// Idle connection timeout in seconds (0 disables)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Unanswered keepalives before the connection is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Shell used for `shell` requests and as the `-c` interpreter for `exec`
    #[serde(default = "default_shell")]
    pub shell: PathBuf,

    /// Connect timeout for direct-tcpip forwards, in seconds
    ///
    /// The connect runs inside the channel-open callback, so other traffic on the
    /// same connection waits for it.
    #[serde(default = "default_forward_connect_timeout")]
    pub forward_connect_timeout_secs: u64,

    /// Allow clients to allocate a PTY
    #[serde(default = "default_true")]
    pub allow_pty: bool,

    /// Allow direct-tcpip (local) port forwarding
    #[serde(default = "default_true")]
    pub allow_port_forwarding: bool,

    /// Maximum packet size (RFC 4254 recommends 32768 bytes minimum)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Window size for flow control
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Client input a channel may buffer before its process consumes it, in bytes
    ///
    /// NIST 800-53: SC-5 (Denial of Service Protection)
    /// Implementation: A channel that exceeds it is closed
    #[serde(default = "default_max_channel_buffer")]
    pub max_channel_buffer: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
///
/// Consumed by the embedding binary when it installs the tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_rejection_time_ms: default_auth_rejection_time_ms(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            shell: default_shell(),
            forward_connect_timeout_secs: default_forward_connect_timeout(),
            allow_pty: true,
            allow_port_forwarding: true,
            max_packet_size: default_max_packet_size(),
            window_size: default_window_size(),
            max_channel_buffer: default_max_channel_buffer(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file cannot be read or parsed
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the text is not valid configuration
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first invalid field
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_auth_attempts == 0 {
            return Err(crate::Error::Config(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_packet_size < 32768 {
            return Err(crate::Error::Config(
                "max_packet_size must be at least 32768 bytes (RFC 4254)".to_string(),
            ));
        }

        if self.window_size < self.max_packet_size {
            return Err(crate::Error::Config(
                "window_size must not be smaller than max_packet_size".to_string(),
            ));
        }

        if self.max_channel_buffer < self.max_packet_size as usize {
            return Err(crate::Error::Config(
                "max_channel_buffer must not be smaller than max_packet_size".to_string(),
            ));
        }

        if self.shell.as_os_str().is_empty() {
            return Err(crate::Error::Config("shell must not be empty".to_string()));
        }

        if self.forward_connect_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "forward_connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Idle timeout as a duration, `None` when disabled
    pub const fn inactivity_timeout(&self) -> Option<Duration> {
        match self.inactivity_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Keepalive interval as a duration, `None` when disabled
    pub const fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Delay applied to rejected authentication attempts
    pub const fn auth_rejection_time(&self) -> Duration {
        Duration::from_millis(self.auth_rejection_time_ms)
    }

    /// Connect timeout for direct-tcpip forwards
    pub const fn forward_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_connect_timeout_secs)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    2222 // Non-privileged port
}

const fn default_max_connections() -> usize {
    64
}

// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
// Matches the OpenSSH MaxAuthTries default
const fn default_max_auth_attempts() -> u32 {
    6
}

const fn default_auth_rejection_time_ms() -> u64 {
    1000
}

const fn default_inactivity_timeout() -> u64 {
    0
}

const fn default_keepalive_interval() -> u64 {
    30
}

const fn default_keepalive_max() -> usize {
    3
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/sh")
}

const fn default_forward_connect_timeout() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

const fn default_max_packet_size() -> u32 {
    32768 // RFC 4254 minimum
}

const fn default_window_size() -> u32 {
    2_097_152 // 2MB
}

const fn default_max_channel_buffer() -> usize {
    4_194_304 // 4MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 2222);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.max_auth_attempts, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_auth_attempts_rejected() {
        let config = ServerConfig {
            max_auth_attempts: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_packet_size_validation() {
        let config = ServerConfig {
            max_packet_size: 1024,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_buffer_validation() {
        let config = ServerConfig {
            max_channel_buffer: 1024,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(ServerConfig::default().max_channel_buffer, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            port = 2200
            allow_pty = false

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 2200);
        assert!(!config.allow_pty);
        assert!(config.allow_port_forwarding);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.shell, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_disabled_timers() {
        let config = ServerConfig {
            keepalive_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.keepalive_interval().is_none());
        assert!(config.inactivity_timeout().is_none());
        assert_eq!(config.forward_connect_timeout(), Duration::from_secs(5));
    }
}
