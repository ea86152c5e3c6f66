//! Per-connection protocol handling
//!
//! NIST 800-53: AC-12 (Session Termination), IA-2 (Identification and Authentication)
//! STIG: V-222601 - Session termination
//! Implementation: One [`ConnectionHandler`] per accepted socket. It answers the
//! authentication callbacks through an [`Authenticator`] and demultiplexes channel
//! traffic to per-channel pump tasks.

use crate::auth::{AuthDecision, Authenticator};
use crate::channel::{
    ChannelContext, ChannelEvent, ChannelOpen, ChannelRegistry, ChannelRequest, InputBudget,
    spawn_pump,
};
use crate::config::ServerConfig;
use crate::connection_tracker::ConnectionTracker;
use crate::keys::KeyStore;
use crate::metrics::Metrics;
use crate::{Error, Result};
use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

/// How long channels get to wind down before the disconnect is sent
const CHANNEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the transport gets to flush the disconnect message
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by every connection of one server
pub(crate) struct Shared {
    pub keys: Arc<KeyStore>,
    pub config: Arc<ServerConfig>,
    pub ssh_config: Arc<russh::server::Config>,
    pub registry: Arc<ChannelRegistry>,
    pub metrics: Metrics,
    pub tracker: ConnectionTracker,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, no authentication request yet
    PreAuth,
    /// At least one key has been offered
    Authenticating,
    /// Channels may be opened
    Authenticated,
    /// The connection is being torn down
    Closing,
}

/// Connection-side view of one open channel
struct OpenChannel {
    events: mpsc::UnboundedSender<ChannelEvent>,
    budget: InputBudget,
    cancel: CancellationToken,
}

/// russh handler for one accepted connection
///
/// NIST 800-53: AC-3 (Access Enforcement), AC-7 (Unsuccessful Logon Attempts),
/// AC-12 (Session Termination)
pub struct ConnectionHandler {
    id: u64,
    peer: SocketAddr,
    shared: Arc<Shared>,
    authenticator: Authenticator,
    state: ConnectionState,
    user: Option<String>,
    /// Parent of every channel token
    cancel: CancellationToken,
    /// Channel pumps and their relay tasks
    tasks: TaskTracker,
    channels: HashMap<ChannelId, OpenChannel>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        shared: Arc<Shared>,
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        let authenticator =
            Authenticator::new(shared.keys.clone(), shared.config.max_auth_attempts);
        Self {
            id,
            peer,
            shared,
            authenticator,
            state: ConnectionState::PreAuth,
            user: None,
            cancel,
            tasks,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        }
    }

    /// Turn an authenticator verdict into a transport answer
    ///
    /// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    fn answer(&mut self, decision: AuthDecision) -> Result<Auth> {
        match decision {
            AuthDecision::Accept => Ok(Auth::Accept),
            AuthDecision::Reject => {
                self.shared.metrics.record_auth_failure();
                Ok(Self::reject())
            }
            AuthDecision::Disconnect => {
                if self.state != ConnectionState::Closing {
                    self.shared.metrics.record_auth_lockout();
                }
                self.state = ConnectionState::Closing;
                Err(Error::TooManyAuthAttempts(self.shared.config.max_auth_attempts))
            }
        }
    }

    async fn open_channel(
        &mut self,
        channel: Channel<Msg>,
        request: ChannelOpen,
        session: &mut Session,
    ) -> Result<bool> {
        let id = channel.id();
        // All channel I/O goes through handler callbacks and the session handle
        drop(channel);

        let kind = request.kind();
        if self.state != ConnectionState::Authenticated {
            warn!(channel_type = kind, state = ?self.state, "Channel open before authentication");
            self.shared.metrics.record_channel_rejected();
            return Ok(false);
        }
        let Some(factory) = self.shared.registry.get(kind) else {
            warn!(channel_type = kind, "No handler for channel type, refusing open");
            self.shared.metrics.record_channel_rejected();
            return Ok(false);
        };
        let (Some(user), Some(options)) = (
            self.user.clone(),
            self.authenticator.granted_options().cloned(),
        ) else {
            return Ok(false);
        };

        let cancel = self.cancel.child_token();
        let span = tracing::info_span!("channel", id = ?id, channel_type = kind);
        let ctx = ChannelContext {
            id,
            handle: session.handle(),
            config: self.shared.config.clone(),
            options,
            user,
            peer: self.peer,
            cancel: cancel.clone(),
            tasks: self.tasks.clone(),
            metrics: self.shared.metrics.clone(),
        };

        match factory.open(&request, ctx).instrument(span.clone()).await {
            Ok(handler) => {
                debug!(channel = ?id, channel_type = kind, "Channel opened");
                let events = spawn_pump(&self.tasks, span, handler, cancel.clone());
                let budget = InputBudget::new(self.shared.config.max_channel_buffer);
                self.channels.insert(
                    id,
                    OpenChannel {
                        events,
                        budget,
                        cancel,
                    },
                );
                Ok(true)
            }
            Err(e) => {
                warn!(channel_type = kind, error = %e, "Channel open refused");
                self.shared.metrics.record_channel_rejected();
                Ok(false)
            }
        }
    }

    /// Deliver a request to the channel pump and send its verdict, in receipt order
    async fn dispatch_request(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<()> {
        let kind = request.kind();
        let accepted = match self.channels.get(&channel) {
            Some(open) => {
                let (reply, verdict) = oneshot::channel();
                if open.events.send(ChannelEvent::Request { request, reply }).is_ok() {
                    verdict.await.unwrap_or(false)
                } else {
                    false
                }
            }
            None => {
                debug!(channel = ?channel, request = kind, "Request for unknown channel");
                false
            }
        };

        if accepted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    fn deliver(&self, channel: ChannelId, event: ChannelEvent) {
        if let Some(open) = self.channels.get(&channel) {
            // A pump that already exited has released the channel
            let _ = open.events.send(event);
        }
    }

    /// Queue client input for the channel pump, closing a channel that overruns its budget
    ///
    /// NIST 800-53: SC-5 (Denial of Service Protection)
    fn deliver_data(&mut self, channel: ChannelId, data: &[u8]) {
        let Some(open) = self.channels.get(&channel) else {
            return;
        };
        match open.budget.admit(Bytes::copy_from_slice(data)) {
            Some(chunk) => {
                let _ = open.events.send(ChannelEvent::Data(chunk));
            }
            None => {
                warn!(
                    event = "channel_input_overflow",
                    channel = ?channel,
                    pending = open.budget.pending(),
                    limit = self.shared.config.max_channel_buffer,
                    "Channel input buffer exhausted, closing channel"
                );
                self.shared.metrics.record_input_overflow();
                open.cancel.cancel();
                self.channels.remove(&channel);
            }
        }
    }

    /// Answer for an authentication method that is never offered
    fn refuse_method(&mut self, user: &str, method: &str) -> Result<Auth> {
        match self.authenticator.reject_method(user, method) {
            AuthDecision::Disconnect => self.answer(AuthDecision::Disconnect),
            // Not a key attempt, so not an authentication failure either
            AuthDecision::Accept | AuthDecision::Reject => Ok(Self::reject()),
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Channels never outlive their connection
        self.cancel.cancel();
    }
}

impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        self.refuse_method(user, "none")
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth> {
        // NIST 800-53: IA-2 - Password authentication is never offered
        self.refuse_method(user, "password")
    }

    // NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
    // Implementation: Unsigned offer answered from the public key alone
    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        self.state = ConnectionState::Authenticating;
        self.shared.metrics.record_auth_attempt();
        let decision = self.authenticator.offer(user, public_key);
        self.answer(decision)
    }

    // STIG: V-222578 - Called only after the signature over the exchange hash verified
    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        self.state = ConnectionState::Authenticating;
        let decision = self.authenticator.verify(user, public_key);
        if decision == AuthDecision::Accept {
            self.user = Some(user.to_string());
        }
        self.answer(decision)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<()> {
        self.state = ConnectionState::Authenticated;
        self.shared.metrics.record_auth_success();
        if let Some(user) = &self.user {
            info!(event = "session_authenticated", user = %user, "Connection authenticated");
            self.shared.tracker.set_user(self.id, user).await;
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool> {
        self.open_channel(channel, ChannelOpen::Session, session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool> {
        let request = ChannelOpen::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator: originator_address.to_string(),
            originator_port,
        };
        self.open_channel(channel, request, session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool> {
        let request = ChannelOpen::X11 {
            originator: originator_address.to_string(),
            originator_port,
        };
        self.open_channel(channel, request, session).await
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(open) = self.channels.remove(&channel) {
            let _ = open.events.send(ChannelEvent::Close);
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.deliver(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        self.deliver_data(channel, data);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        };
        self.dispatch_request(channel, request, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.dispatch_request(channel, request, session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        self.dispatch_request(channel, ChannelRequest::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::Exec {
            command: data.to_vec(),
        };
        self.dispatch_request(channel, request, session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::Subsystem {
            name: name.to_string(),
        };
        self.dispatch_request(channel, request, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::WindowChange {
            cols: col_width,
            rows: row_height,
        };
        self.dispatch_request(channel, request, session).await
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, session: &mut Session) -> Result<()> {
        self.dispatch_request(channel, ChannelRequest::Signal { signal }, session)
            .await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::X11 {
            single_connection,
            protocol: x11_auth_protocol.to_string(),
            screen: x11_screen_number,
        };
        self.dispatch_request(channel, request, session).await
    }
}

/// Serve one accepted socket until it closes or `cancel` fires
///
/// NIST 800-53: AC-12 (Session Termination)
/// Implementation: On shutdown, channels are closed first, then the disconnect is
/// sent and the socket released. Errors never leave this function.
pub(crate) async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    cancel: CancellationToken,
) {
    let tasks = TaskTracker::new();
    let handler = ConnectionHandler::new(id, peer, shared.clone(), cancel.clone(), tasks.clone());

    let started = tokio::select! {
        started = russh::server::run_stream(shared.ssh_config.clone(), stream, handler) => started,
        () = cancel.cancelled() => {
            debug!("Server stopping, dropping connection before handshake");
            finish(&shared, id, &tasks, &cancel).await;
            return;
        }
    };

    let running = match started {
        Ok(running) => running,
        Err(e) => {
            let e = Error::handshake(e.to_string());
            warn!(event = "handshake_failed", error = %e, "SSH handshake failed");
            shared.metrics.record_failed_connection();
            finish(&shared, id, &tasks, &cancel).await;
            return;
        }
    };

    let handle = running.handle();
    tokio::pin!(running);

    let result = tokio::select! {
        result = &mut running => result,
        () = cancel.cancelled() => {
            debug!("Server stopping, closing channels");
            tasks.close();
            let drain = async {
                if tokio::time::timeout(CHANNEL_DRAIN_TIMEOUT, tasks.wait()).await.is_err() {
                    warn!("Channels did not close in time");
                }
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "server shutting down".to_string(),
                        "en".to_string(),
                    )
                    .await;
            };
            tokio::pin!(drain);

            // The transport must keep running while channels send their final messages
            let ended = tokio::select! {
                result = &mut running => Some(result),
                () = &mut drain => None,
            };
            match ended {
                Some(result) => result,
                None => tokio::time::timeout(DISCONNECT_TIMEOUT, &mut running)
                    .await
                    .unwrap_or(Ok(())),
            }
        }
    };

    match result {
        Ok(()) => debug!("Connection closed cleanly"),
        Err(Error::TooManyAuthAttempts(max)) => {
            warn!(event = "auth_lockout", max_attempts = max, "Closed connection after too many authentication attempts");
        }
        Err(e) => {
            if e.is_security_event() {
                warn!(event = "security_event", error = %e, "Connection ended by security event");
            } else if e.is_recoverable() {
                debug!(error = %e, "Connection ended after a channel error");
            } else {
                warn!(error = %e, "Connection ended with error");
            }
            shared.metrics.record_failed_connection();
        }
    }

    finish(&shared, id, &tasks, &cancel).await;
}

async fn finish(shared: &Shared, id: u64, tasks: &TaskTracker, cancel: &CancellationToken) {
    cancel.cancel();
    tasks.close();
    if tokio::time::timeout(CHANNEL_DRAIN_TIMEOUT, tasks.wait())
        .await
        .is_err()
    {
        warn!("Channel tasks still running at connection teardown");
    }
    shared.tracker.unregister_connection(id).await;
    shared.metrics.record_connection_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::PrivateKey;
    use russh::keys::ssh_key::Algorithm;

    fn random_key() -> PrivateKey {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
    }

    fn test_handler(max_auth_attempts: u32) -> ConnectionHandler {
        let config = ServerConfig {
            max_auth_attempts,
            ..ServerConfig::default()
        };
        let shared = Arc::new(Shared {
            keys: Arc::new(KeyStore::new()),
            config: Arc::new(config),
            ssh_config: Arc::new(russh::server::Config::default()),
            registry: Arc::new(ChannelRegistry::with_defaults()),
            metrics: Metrics::new(),
            tracker: ConnectionTracker::new(0),
        });
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        ConnectionHandler::new(1, peer, shared, CancellationToken::new(), TaskTracker::new())
    }

    /// NIST 800-53: AC-7 - Once the cap is exceeded, every method closes the connection
    #[tokio::test]
    async fn test_refused_methods_disconnect_after_cap() {
        let mut handler = test_handler(2);

        for _ in 0..2 {
            let stranger = random_key();
            let answer = handler.auth_publickey_offered("bob", stranger.public_key()).await;
            assert!(matches!(answer, Ok(Auth::Reject { .. })));
        }
        assert!(matches!(handler.auth_none("bob").await, Ok(Auth::Reject { .. })));

        let stranger = random_key();
        let answer = handler.auth_publickey_offered("bob", stranger.public_key()).await;
        assert!(matches!(answer, Err(Error::TooManyAuthAttempts(2))));

        assert!(matches!(
            handler.auth_none("bob").await,
            Err(Error::TooManyAuthAttempts(2))
        ));
        assert!(matches!(
            handler.auth_password("bob", "hunter2").await,
            Err(Error::TooManyAuthAttempts(2))
        ));

        let snapshot = handler.shared.metrics.snapshot();
        assert_eq!(snapshot.auth_failures, 2);
        assert_eq!(snapshot.auth_lockouts, 1);
        assert_eq!(handler.state, ConnectionState::Closing);
    }
}
