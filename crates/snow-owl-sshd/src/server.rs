//! SSH Server Implementation
//!
//! This module owns the listener and supervises every connection accepted on it
//! (RFC 4251-4254 over TCP).
//!
//! NIST 800-53: AC-10 (Concurrent Session Control), AC-12 (Session Termination),
//! SC-7 (Boundary Protection)
//! Implementation: A cancellation token tree (server, connection, channel) and a task
//! tracker give a stop that reaches every task and a wait that returns once they
//! have all finished.

use crate::channel::{ChannelFactory, ChannelRegistry};
use crate::connection::{serve_connection, Shared};
use crate::connection_tracker::{ConnectionInfo, ConnectionTracker};
use crate::keys::KeyStore;
use crate::metrics::Metrics;
use crate::{Error, Result, ServerConfig};
use russh::keys::PublicKey;
use russh::{MethodKind, MethodSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

/// First delay after a resource-exhaustion accept error
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Upper bound for the accept backoff
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How an accept error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// The pending connection died before it was accepted; retry at once
    Connection,
    /// The process ran out of descriptors or buffers; retry with backoff
    Resource,
    /// The listener is unusable
    Fatal,
}

/// Classify an accept error
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptErrorKind::Connection,
        io::ErrorKind::OutOfMemory => return AcceptErrorKind::Resource,
        _ => {}
    }

    match err.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
            AcceptErrorKind::Resource
        }
        Some(libc::EPROTO | libc::ENETDOWN | libc::EHOSTUNREACH | libc::ENETUNREACH) => {
            AcceptErrorKind::Connection
        }
        _ => AcceptErrorKind::Fatal,
    }
}

/// Cloneable stop/wait handle for a [`Server`]
///
/// NIST 800-53: AC-12 (Session Termination)
#[derive(Debug, Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ServerHandle {
    /// Stop accepting and close every connection; idempotent
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(event = "server_stop", "Stopping SSH server");
            self.cancel.cancel();
        }
    }

    /// Wait until the listener is closed and every connection has drained
    ///
    /// Returns immediately if the server never started.
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }

    /// Whether [`ServerHandle::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Embeddable SSH server
///
/// Key material is configured first, then [`Server::listen_and_serve`] freezes it
/// and starts accepting. [`Server::stop`] and [`Server::wait`] (or a
/// [`ServerHandle`]) control the lifecycle.
pub struct Server {
    config: Arc<ServerConfig>,
    keys: KeyStore,
    registry: ChannelRegistry,
    metrics: Metrics,
    tracker: ConnectionTracker,
    cancel: CancellationToken,
    tasks: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create an idle server with an empty key store
    pub fn new(config: ServerConfig) -> Self {
        let tracker = ConnectionTracker::new(config.max_connections);
        // Closed from the start so wait() on a server that never started returns
        let tasks = TaskTracker::new();
        tasks.close();

        Self {
            config: Arc::new(config),
            keys: KeyStore::new(),
            registry: ChannelRegistry::with_defaults(),
            metrics: Metrics::new(),
            tracker,
            cancel: CancellationToken::new(),
            tasks,
            local_addr: None,
        }
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.local_addr.is_some() {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    /// Add a freshly generated in-memory Ed25519 host key
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] after `listen_and_serve`, [`Error::KeyGen`] if
    /// generation fails
    pub fn random_hostkey(&mut self) -> Result<()> {
        self.ensure_not_started()?;
        self.keys.generate_random_identity()
    }

    /// Add a host key from serialized private key bytes
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] after `listen_and_serve`, [`Error::KeyParse`] for
    /// unusable key material
    ///
    /// # NIST 800-53: IA-5 (Authenticator Management)
    pub fn add_hostkey(&mut self, raw: &[u8]) -> Result<()> {
        self.ensure_not_started()?;
        self.keys.set_host_identity(raw)
    }

    /// Add authorized client keys from authorized_keys formatted bytes
    ///
    /// # Returns
    ///
    /// The number of keys loaded from this input
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] after `listen_and_serve`, [`Error::KeyParse`] if the
    /// input is not UTF-8
    ///
    /// # NIST 800-53: AC-2 (Account Management)
    pub fn add_authorized_keys(&mut self, raw: &[u8]) -> Result<usize> {
        self.ensure_not_started()?;
        let loaded = self.keys.load_authorized_keys(raw)?;
        if loaded == 0 && raw.iter().any(|b| !b.is_ascii_whitespace()) {
            warn!("No usable keys found in authorized keys input");
        }
        Ok(loaded)
    }

    /// Register (or replace) the factory for a channel type
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] after `listen_and_serve`
    pub fn register_channel_type(
        &mut self,
        kind: impl Into<String>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<()> {
        self.ensure_not_started()?;
        self.registry.register(kind, factory);
        Ok(())
    }

    /// Bind `bind_address:port` and start serving in the background
    ///
    /// Port 0 binds an ephemeral port. A host key is generated if none was added.
    ///
    /// # Returns
    ///
    /// The bound address
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if called twice
    /// - [`Error::Listener`] if the server was stopped or the address cannot be bound
    /// - [`Error::NoAuthorizedKeys`] if no client key was authorized
    /// - [`Error::Config`] if the configuration is invalid
    ///
    /// # NIST 800-53: AC-3 (Access Enforcement), SC-7 (Boundary Protection)
    pub async fn listen_and_serve(&mut self, port: u16) -> Result<SocketAddr> {
        self.ensure_not_started()?;
        if self.cancel.is_cancelled() {
            return Err(Error::Listener("server has been stopped".into()));
        }
        self.config.validate()?;

        // NIST 800-53: AC-3 - Authentication against an empty set always fails
        if self.keys.authorized_count() == 0 {
            return Err(Error::NoAuthorizedKeys);
        }
        if !self.keys.has_host_identity() {
            info!("No host key configured, generating one");
            self.keys.generate_random_identity()?;
        }

        let listener = TcpListener::bind((self.config.bind_address.as_str(), port))
            .await
            .map_err(|e| {
                Error::Listener(format!(
                    "failed to bind {}:{port}: {e}",
                    self.config.bind_address
                ))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Listener(format!("failed to read bound address: {e}")))?;

        let shared = Arc::new(Shared {
            keys: Arc::new(self.keys.clone()),
            config: self.config.clone(),
            ssh_config: Arc::new(ssh_config(&self.config, &self.keys)),
            registry: Arc::new(self.registry.clone()),
            metrics: self.metrics.clone(),
            tracker: self.tracker.clone(),
        });

        info!(
            event = "server_start",
            address = %local_addr,
            host_keys = self.keys.host_keys().len(),
            authorized_keys = self.keys.authorized_count(),
            channel_types = ?self.registry.kinds(),
            "SSH server listening"
        );

        self.tasks.spawn(
            accept_loop(listener, shared, self.cancel.clone(), self.tasks.clone())
                .instrument(tracing::info_span!("listener", address = %local_addr)),
        );
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and close every connection; idempotent
    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Wait until the listener is closed and every connection has drained
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }

    /// Cloneable stop/wait handle
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cancel: self.cancel.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Bound address, once listening
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Public halves of the host identities
    pub fn host_public_keys(&self) -> Vec<PublicKey> {
        self.keys.host_public_keys()
    }

    /// Number of authorized client keys
    pub fn authorized_key_count(&self) -> usize {
        self.keys.authorized_count()
    }

    /// Snapshot of the live connections
    pub async fn live_connections(&self) -> Vec<ConnectionInfo> {
        self.tracker.list().await
    }

    /// Number of live connections
    pub async fn active_connections(&self) -> usize {
        self.tracker.active_count().await
    }

    /// Server metrics
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Transport configuration for every connection
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts), AC-12 (Session Termination)
fn ssh_config(config: &ServerConfig, keys: &KeyStore) -> russh::server::Config {
    // The transport counts every request (none, unsigned offer, signature); the per-key cap
    // is enforced by the authenticator and this is only a backstop
    let max_auth_attempts = usize::try_from(config.max_auth_attempts)
        .unwrap_or(usize::MAX)
        .saturating_mul(2)
        .saturating_add(2);

    russh::server::Config {
        keys: keys.host_keys().to_vec(),
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        max_auth_attempts,
        auth_rejection_time: config.auth_rejection_time(),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: config.inactivity_timeout(),
        keepalive_interval: config.keepalive_interval(),
        keepalive_max: config.keepalive_max,
        window_size: config.window_size,
        maximum_packet_size: config.max_packet_size,
        ..Default::default()
    }
}

/// Accept connections until cancelled or the listener fails
///
/// NIST 800-53: AC-10 (Concurrent Session Control), SC-5 (Denial of Service Protection)
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff = ACCEPT_BACKOFF_MIN;

                if cancel.is_cancelled() {
                    debug!(%peer, "Dropping connection accepted during shutdown");
                    break;
                }

                // NIST 800-53: AC-10 - Enforce the concurrent connection limit
                let Some(id) = shared.tracker.register_connection(peer).await else {
                    shared.metrics.record_rejected_connection();
                    drop(stream);
                    continue;
                };

                shared.metrics.record_connection();
                info!(event = "connection_accepted", connection_id = id, %peer, "Accepted connection");

                let _ = stream.set_nodelay(true);
                tasks.spawn(
                    serve_connection(shared.clone(), stream, peer, id, cancel.child_token())
                        .instrument(tracing::info_span!("connection", id, peer = %peer)),
                );
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptErrorKind::Connection => {
                    debug!(error = %e, "Connection failed during accept");
                }
                AcceptErrorKind::Resource => {
                    let err = Error::Accept(e.to_string());
                    shared.metrics.record_accept_error();
                    warn!(
                        error = %err,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Accept failed, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
                AcceptErrorKind::Fatal => {
                    let err = Error::Listener(e.to_string());
                    error!(error = %err, "Listener failed, no longer accepting connections");
                    break;
                }
            },
        }
    }

    drop(listener);
    info!(event = "listener_closed", "Listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorized_line() -> String {
        let key = russh::keys::PrivateKey::random(
            &mut rand::rngs::OsRng,
            russh::keys::ssh_key::Algorithm::Ed25519,
        )
        .unwrap();
        format!("{}\n", key.public_key().to_openssh().unwrap())
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_classify_accept_error() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_accept_error(&reset), AcceptErrorKind::Connection);

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&aborted), AcceptErrorKind::Connection);

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_accept_error(&emfile), AcceptErrorKind::Resource);

        let enobufs = io::Error::from_raw_os_error(libc::ENOBUFS);
        assert_eq!(classify_accept_error(&enobufs), AcceptErrorKind::Resource);

        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify_accept_error(&ebadf), AcceptErrorKind::Fatal);
    }

    #[test]
    fn test_ssh_config_backstop() {
        let mut keys = KeyStore::new();
        keys.generate_random_identity().unwrap();
        let config = ssh_config(&ServerConfig::default(), &keys);

        assert_eq!(config.max_auth_attempts, 14);
        assert_eq!(config.keys.len(), 1);
        assert_eq!(config.auth_rejection_time, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_wait_before_start_returns() {
        let server = Server::new(local_config());
        tokio::time::timeout(Duration::from_secs(1), server.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refuses_to_start_without_authorized_keys() {
        let mut server = Server::new(local_config());
        server.random_hostkey().unwrap();

        let result = server.listen_and_serve(0).await;
        assert!(matches!(result, Err(Error::NoAuthorizedKeys)));
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_generates_hostkey_and_freezes_keys() {
        let mut server = Server::new(local_config());
        assert_eq!(server.add_authorized_keys(authorized_line().as_bytes()).unwrap(), 1);
        assert!(server.host_public_keys().is_empty());

        let addr = server.listen_and_serve(0).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.host_public_keys().len(), 1);

        assert!(matches!(server.random_hostkey(), Err(Error::AlreadyStarted)));
        assert!(matches!(
            server.add_authorized_keys(authorized_line().as_bytes()),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(server.listen_and_serve(0).await, Err(Error::AlreadyStarted)));

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_server_cannot_start() {
        let mut server = Server::new(local_config());
        server.add_authorized_keys(authorized_line().as_bytes()).unwrap();
        server.stop();

        assert!(matches!(server.listen_and_serve(0).await, Err(Error::Listener(_))));
        assert!(server.handle().is_stopped());
    }
}
