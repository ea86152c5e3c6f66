//! # Snow Owl SSHD
//!
//! Minimal embeddable SSH server daemon.
//!
//! This crate serves the SSH connection protocol as defined in:
//! - RFC 4251: SSH Protocol Architecture
//! - RFC 4252: SSH Authentication Protocol (public key only)
//! - RFC 4253: SSH Transport Layer Protocol
//! - RFC 4254: SSH Connection Protocol
//!
//! ## Features
//!
//! - Public key authentication against an in-memory authorized key set
//! - Shell and exec sessions, with or without a PTY
//! - Local port forwarding (`direct-tcpip`)
//! - Pluggable channel types through [`ChannelRegistry`]
//! - Graceful stop that closes every channel before disconnecting
//!
//! ## Example
//!
//! ```no_run
//! use snow_owl_sshd::{Server, ServerConfig};
//!
//! # async fn run(authorized_keys: &[u8]) -> snow_owl_sshd::Result<()> {
//! let mut server = Server::new(ServerConfig::default());
//! server.random_hostkey()?;
//! server.add_authorized_keys(authorized_keys)?;
//! let addr = server.listen_and_serve(2222).await?;
//! println!("listening on {addr}");
//! server.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connection_tracker;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod server;

pub use channel::{ChannelContext, ChannelFactory, ChannelHandler, ChannelRegistry, InputChunk};
pub use config::{LogFormat, LoggingConfig, ServerConfig};
pub use connection_tracker::ConnectionInfo;
pub use error::{Error, Result};
pub use keys::KeyStore;
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{Server, ServerHandle};
