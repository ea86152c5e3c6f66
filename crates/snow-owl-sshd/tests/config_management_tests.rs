//! Configuration Management Tests
//!
//! NIST 800-53: CM-6 (Configuration Settings), AC-7 (Unsuccessful Logon Attempts)
//! Implementation: Tests for TOML loading, defaults and validation

use snow_owl_sshd::{Error, LogFormat, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_config_defaults() {
    let config = ServerConfig::default();

    assert_eq!(config.bind_address, "0.0.0.0");
    assert_eq!(config.port, 2222);
    assert_eq!(config.max_auth_attempts, 6);
    assert_eq!(config.shell, PathBuf::from("/bin/sh"));
    assert!(config.allow_pty);
    assert!(config.allow_port_forwarding);
    assert_eq!(config.forward_connect_timeout(), Duration::from_secs(5));
    assert_eq!(config.max_channel_buffer, 4 * 1024 * 1024);
    assert_eq!(config.logging.format, LogFormat::Text);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_from_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("sshd.toml");
    std::fs::write(
        &path,
        r#"
bind_address = "127.0.0.1"
port = 2022
max_auth_attempts = 3
inactivity_timeout_secs = 600
shell = "/bin/bash"
allow_port_forwarding = false

[logging]
level = "debug"
format = "json"
"#,
    )
    .unwrap();

    let config = ServerConfig::from_file(path.to_str().unwrap()).unwrap();

    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.port, 2022);
    assert_eq!(config.max_auth_attempts, 3);
    assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(600)));
    assert_eq!(config.shell, PathBuf::from("/bin/bash"));
    assert!(!config.allow_port_forwarding);
    assert!(config.allow_pty);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_config_missing_file() {
    let result = ServerConfig::from_file("/nonexistent/sshd.toml");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_config_rejects_malformed_toml() {
    let result = ServerConfig::from_toml("port = \"not a number\"");
    assert!(matches!(result, Err(Error::Config(_))));
}

/// NIST 800-53: AC-7 - A zero attempt cap would lock everyone out
#[test]
fn test_config_validation() {
    let config = ServerConfig {
        max_auth_attempts: 0,
        ..ServerConfig::default()
    };
    assert!(config.validate().is_err());

    let config = ServerConfig {
        max_packet_size: 1024,
        ..ServerConfig::default()
    };
    assert!(config.validate().is_err());

    let config = ServerConfig {
        shell: PathBuf::new(),
        ..ServerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_disabled_timers() {
    let config = ServerConfig {
        inactivity_timeout_secs: 0,
        keepalive_interval_secs: 0,
        ..ServerConfig::default()
    };

    assert_eq!(config.inactivity_timeout(), None);
    assert_eq!(config.keepalive_interval(), None);
}
