//! Channel Layer
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-17 (Remote Access), SC-7 (Boundary Protection)
//! Implementation: Channel-open requests are dispatched through a registry keyed by
//! channel type. Every opened channel is driven by its own pump task so a slow or
//! misbehaving channel never stalls the connection that carries it.

pub mod forward;
pub mod session;

use crate::config::ServerConfig;
use crate::keys::KeyOptions;
use crate::metrics::Metrics;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, Instrument};

pub use forward::DirectTcpipFactory;
pub use session::SessionFactory;

/// Channel type name for interactive sessions (RFC 4254 section 6.1)
pub const SESSION: &str = "session";

/// Channel type name for local port forwarding (RFC 4254 section 7.2)
pub const DIRECT_TCPIP: &str = "direct-tcpip";

/// Channel type name for X11 forwarding (RFC 4254 section 6.3.2)
pub const X11: &str = "x11";

/// A channel-open request as received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    /// Interactive session
    Session,
    /// Connection to `host:port` on the server side
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator address as reported by the client
        originator: String,
        /// Originator port as reported by the client
        originator_port: u32,
    },
    /// X11 forwarding
    X11 {
        /// Originator address
        originator: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelOpen {
    /// Channel type name used as the registry key
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Session => SESSION,
            Self::DirectTcpip { .. } => DIRECT_TCPIP,
            Self::X11 { .. } => X11,
        }
    }
}

/// A channel request (RFC 4254 section 6)
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    /// `pty-req`
    Pty {
        /// TERM value requested by the client
        term: String,
        /// Width in characters
        cols: u32,
        /// Height in rows
        rows: u32,
    },
    /// `env`
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// `shell`
    Shell,
    /// `exec`
    Exec {
        /// Raw command line
        command: Vec<u8>,
    },
    /// `subsystem`
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// `window-change`
    WindowChange {
        /// Width in characters
        cols: u32,
        /// Height in rows
        rows: u32,
    },
    /// `signal`
    Signal {
        /// Signal to deliver
        signal: Sig,
    },
    /// `x11-req`
    X11 {
        /// Forward a single X11 connection only
        single_connection: bool,
        /// X11 authentication protocol
        protocol: String,
        /// X11 screen number
        screen: u32,
    },
}

impl ChannelRequest {
    /// Wire name of the request
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Pty { .. } => "pty-req",
            Self::Env { .. } => "env",
            Self::Shell => "shell",
            Self::Exec { .. } => "exec",
            Self::Subsystem { .. } => "subsystem",
            Self::WindowChange { .. } => "window-change",
            Self::Signal { .. } => "signal",
            Self::X11 { .. } => "x11-req",
        }
    }
}

/// Behaviour of one open channel
///
/// Calls arrive in the order the client sent them. Implementations must not block
/// for long inside any call: long-running work belongs in tasks spawned on
/// [`ChannelContext::tasks`].
#[async_trait]
pub trait ChannelHandler: Send {
    /// Handle a channel request; the return value becomes the success/failure reply
    async fn handle_request(&mut self, request: ChannelRequest) -> bool;

    /// Handle bytes sent by the client
    ///
    /// The chunk counts against the channel's input budget until it is dropped, so
    /// hold it only until the bytes have been written onward.
    async fn handle_data(&mut self, data: InputChunk);

    /// The client will send no more data
    async fn handle_eof(&mut self);

    /// Release every resource held by the channel
    async fn close(&mut self);
}

/// Everything a channel handler needs from its connection
#[derive(Clone)]
pub struct ChannelContext {
    /// Channel identifier on this connection
    pub id: ChannelId,
    /// Handle used to write to the channel
    pub handle: Handle,
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Options of the key that authenticated the connection
    pub options: KeyOptions,
    /// Authenticated user name
    pub user: String,
    /// Remote peer address
    pub peer: SocketAddr,
    /// Cancelled when the channel or its connection closes
    pub cancel: CancellationToken,
    /// Tracker for tasks spawned on behalf of the channel
    pub tasks: TaskTracker,
    /// Server metrics
    pub metrics: Metrics,
}

/// Creates handlers for one channel type
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel
    ///
    /// # Errors
    ///
    /// Any error is answered with a channel open failure; the connection stays up
    async fn open(&self, request: &ChannelOpen, ctx: ChannelContext)
        -> Result<Box<dyn ChannelHandler>>;
}

/// Dispatch table of channel factories keyed by channel type
///
/// NIST 800-53: CM-7 (Least Functionality)
/// Implementation: A channel type without a registered factory is refused
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, Arc<dyn ChannelFactory>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `session` and `direct-tcpip` factories
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SESSION, Arc::new(SessionFactory));
        registry.register(DIRECT_TCPIP, Arc::new(DirectTcpipFactory));
        registry
    }

    /// Register (or replace) the factory for a channel type
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn ChannelFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    /// Look up the factory for a channel type
    pub fn get(&self, kind: &str) -> Option<Arc<dyn ChannelFactory>> {
        self.factories.get(kind).cloned()
    }

    /// Registered channel types, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Per-channel limit on client input not yet consumed
///
/// NIST 800-53: SC-5 (Denial of Service Protection)
/// Implementation: The transport refills the client's window as soon as data is
/// received, so the window alone does not bound what a channel holds. Every chunk
/// is admitted against this budget and returns its bytes when dropped.
#[derive(Debug, Clone)]
pub struct InputBudget {
    pending: Arc<AtomicUsize>,
    limit: usize,
}

impl InputBudget {
    /// Budget of `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Charge `data` to the budget, `None` when it would exceed the limit
    pub fn admit(&self, data: Bytes) -> Option<InputChunk> {
        let len = data.len();
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                pending.checked_add(len).filter(|total| *total <= self.limit)
            })
            .ok()?;
        Some(InputChunk {
            data,
            pending: self.pending.clone(),
        })
    }

    /// Bytes admitted and not yet released
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Client input charged to an [`InputBudget`]
#[derive(Debug)]
pub struct InputChunk {
    data: Bytes,
    pending: Arc<AtomicUsize>,
}

impl Deref for InputChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for InputChunk {
    fn drop(&mut self) {
        self.pending.fetch_sub(self.data.len(), Ordering::AcqRel);
    }
}

/// Work item delivered to a channel pump
pub(crate) enum ChannelEvent {
    Request {
        request: ChannelRequest,
        reply: oneshot::Sender<bool>,
    },
    Data(InputChunk),
    Eof,
    Close,
}

/// Spawn the pump task for a freshly opened channel
///
/// The pump exits, and closes the handler, when the client closes the channel,
/// the sender is dropped, or `cancel` fires.
pub(crate) fn spawn_pump(
    tasks: &TaskTracker,
    span: tracing::Span,
    mut handler: Box<dyn ChannelHandler>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<ChannelEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tasks.spawn(
        async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    event = rx.recv() => event,
                };

                match event {
                    Some(ChannelEvent::Request { request, reply }) => {
                        let kind = request.kind();
                        let accepted = handler.handle_request(request).await;
                        debug!(request = kind, accepted, "Channel request handled");
                        // The connection may have gone away while we worked
                        let _ = reply.send(accepted);
                    }
                    Some(ChannelEvent::Data(data)) => handler.handle_data(data).await,
                    Some(ChannelEvent::Eof) => handler.handle_eof().await,
                    Some(ChannelEvent::Close) | None => break,
                }
            }

            handler.close().await;
            cancel.cancel();
            debug!("Channel pump finished");
        }
        .instrument(span),
    );

    tx
}
