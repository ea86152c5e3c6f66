//! Direct-tcpip channels (local port forwarding, RFC 4254 section 7.2)
//!
//! NIST 800-53: AC-4 (Information Flow Enforcement), SC-7 (Boundary Protection)
//! Implementation: The target is connected while the open is pending, so an
//! unreachable target is refused with an open failure instead of a channel that
//! closes immediately.

use super::{
    ChannelContext, ChannelFactory, ChannelHandler, ChannelOpen, ChannelRequest, InputChunk,
};
use crate::{Error, Result};
use async_trait::async_trait;
use russh::CryptoVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Factory for `direct-tcpip` channels
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTcpipFactory;

#[async_trait]
impl ChannelFactory for DirectTcpipFactory {
    /// NIST 800-53: AC-3 (Access Enforcement), AC-4 (Information Flow Enforcement)
    async fn open(
        &self,
        request: &ChannelOpen,
        ctx: ChannelContext,
    ) -> Result<Box<dyn ChannelHandler>> {
        let ChannelOpen::DirectTcpip {
            host,
            port,
            originator,
            originator_port,
        } = request
        else {
            return Err(Error::channel_request(format!(
                "{} is not a direct-tcpip open",
                request.kind()
            )));
        };

        if !ctx.config.allow_port_forwarding {
            return Err(Error::channel_request("port forwarding disabled"));
        }
        if ctx.options.no_port_forwarding {
            return Err(Error::channel_request(
                "port forwarding forbidden by key options",
            ));
        }

        let port = u16::try_from(*port)
            .map_err(|_| Error::channel_request(format!("invalid port {port}")))?;
        let timeout = ctx.config.forward_connect_timeout();

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| {
                Error::channel_request(format!("connect to {host}:{port} timed out"))
            })?
            .map_err(|e| Error::channel_request(format!("connect to {host}:{port}: {e}")))?;

        // Forwarded traffic is usually interactive
        let _ = stream.set_nodelay(true);

        info!(
            event = "forward_open",
            user = %ctx.user,
            target = %format!("{host}:{port}"),
            originator = %format!("{originator}:{originator_port}"),
            "Direct-tcpip forward established"
        );
        ctx.metrics.record_channel_open();
        ctx.metrics.record_forward_opened();

        Ok(Box::new(ForwardChannel::start(ctx, stream)))
    }
}

/// One established direct-tcpip channel
pub struct ForwardChannel {
    ctx: ChannelContext,
    writer: Option<mpsc::UnboundedSender<InputChunk>>,
}

impl ForwardChannel {
    fn start(ctx: ChannelContext, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        ctx.tasks.spawn(socket_to_channel(ctx.clone(), reader));
        ctx.tasks.spawn(channel_to_socket(ctx.clone(), writer, rx));

        Self {
            ctx,
            writer: Some(tx),
        }
    }
}

#[async_trait]
impl ChannelHandler for ForwardChannel {
    async fn handle_request(&mut self, request: ChannelRequest) -> bool {
        debug!(request = request.kind(), "Request on forward channel rejected");
        self.ctx.metrics.record_request_rejected();
        false
    }

    async fn handle_data(&mut self, data: InputChunk) {
        self.ctx.metrics.record_bytes_received(data.len() as u64);
        if let Some(writer) = &self.writer {
            let _ = writer.send(data);
        }
    }

    async fn handle_eof(&mut self) {
        // Half-close: the target sees EOF, the reverse direction keeps flowing
        self.writer = None;
    }

    async fn close(&mut self) {
        self.writer = None;
        self.ctx.cancel.cancel();
    }
}

async fn socket_to_channel(ctx: ChannelContext, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Forward target read failed");
                break;
            }
        };
        if ctx
            .handle
            .data(ctx.id, CryptoVec::from_slice(&buf[..n]))
            .await
            .is_err()
        {
            debug!("Channel closed, stopping forward relay");
            break;
        }
        ctx.metrics.record_bytes_sent(n as u64);
    }

    debug!("Forward target closed");
    let _ = ctx.handle.eof(ctx.id).await;
    let _ = ctx.handle.close(ctx.id).await;
}

async fn channel_to_socket(
    ctx: ChannelContext,
    mut writer: OwnedWriteHalf,
    mut data: mpsc::UnboundedReceiver<InputChunk>,
) {
    loop {
        let chunk = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            chunk = data.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        if let Err(e) = writer.write_all(&chunk).await {
            warn!(error = %e, "Forward target write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
