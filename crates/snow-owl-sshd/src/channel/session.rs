//! Session channels: shell, exec and PTY
//!
//! NIST 800-53: AC-17 (Remote Access), AU-2 (Audit Events)
//! Implementation: Runs the configured shell for `shell` and `exec` requests, wires its
//! standard streams (or a PTY) to the channel and reports how the process ended.

use super::{
    ChannelContext, ChannelFactory, ChannelHandler, ChannelOpen, ChannelRequest, InputChunk,
};
use crate::{Error, Result};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use russh::{CryptoVec, Sig};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// How long output relays may keep draining after the process exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Factory for `session` channels
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFactory;

#[async_trait]
impl ChannelFactory for SessionFactory {
    async fn open(
        &self,
        _request: &ChannelOpen,
        ctx: ChannelContext,
    ) -> Result<Box<dyn ChannelHandler>> {
        ctx.metrics.record_channel_open();
        Ok(Box::new(SessionChannel::new(ctx)))
    }
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Width in characters
    pub cols: u16,
    /// Height in rows
    pub rows: u16,
}

impl TermSize {
    /// Build from wire values, saturating at `u16::MAX`
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols: u16::try_from(cols).unwrap_or(u16::MAX),
            rows: u16::try_from(rows).unwrap_or(u16::MAX),
        }
    }
}

impl From<TermSize> for pty_process::Size {
    fn from(size: TermSize) -> Self {
        // Size::new takes rows first
        Self::new(size.rows, size.cols)
    }
}

#[derive(Debug)]
struct PtyRequest {
    term: String,
    size: TermSize,
}

/// Input for the task feeding the process
enum Input {
    Data(InputChunk),
    Resize(TermSize),
    Eof,
}

struct Process {
    pid: Option<u32>,
    input: mpsc::UnboundedSender<Input>,
}

/// One `session` channel
///
/// At most one process runs per channel. `pty-req` and `env` must arrive before
/// `shell` or `exec`; `window-change` and `signal` apply to the running process.
pub struct SessionChannel {
    ctx: ChannelContext,
    env: HashMap<String, String>,
    pty: Option<PtyRequest>,
    process: Option<Process>,
}

impl SessionChannel {
    /// Create an idle session channel
    pub fn new(ctx: ChannelContext) -> Self {
        Self {
            ctx,
            env: HashMap::new(),
            pty: None,
            process: None,
        }
    }

    /// NIST 800-53: AC-3 (Access Enforcement)
    /// Implementation: Honors the server-wide switch and the key's `no-pty` option
    fn request_pty(&mut self, term: String, size: TermSize) -> Result<()> {
        if !self.ctx.config.allow_pty {
            return Err(Error::channel_request("PTY allocation disabled"));
        }
        if self.ctx.options.no_pty {
            return Err(Error::channel_request("PTY allocation forbidden by key options"));
        }
        if self.process.is_some() {
            return Err(Error::channel_request("session already started"));
        }
        if self.pty.is_some() {
            return Err(Error::channel_request("PTY already requested"));
        }

        debug!(term = %term, cols = size.cols, rows = size.rows, "PTY requested");
        self.pty = Some(PtyRequest { term, size });
        Ok(())
    }

    fn set_env(&mut self, name: String, value: String) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::channel_request("session already started"));
        }
        debug!(name = %name, "Environment variable set");
        self.env.insert(name, value);
        Ok(())
    }

    fn resize(&mut self, size: TermSize) -> Result<()> {
        let pty = self
            .pty
            .as_mut()
            .ok_or_else(|| Error::channel_request("window-change without PTY"))?;
        pty.size = size;

        if let Some(process) = &self.process {
            // The input task may already be gone if the process exited
            let _ = process.input.send(Input::Resize(size));
        }
        Ok(())
    }

    fn signal(&self, sig: &Sig) -> Result<()> {
        let pid = self
            .process
            .as_ref()
            .and_then(|process| process.pid)
            .ok_or_else(|| Error::channel_request("no running process"))?;
        let signal = signal_from_sig(sig)
            .ok_or_else(|| Error::channel_request(format!("unknown signal {sig:?}")))?;
        let pid = i32::try_from(pid)
            .map_err(|_| Error::channel_request(format!("invalid process id {pid}")))?;

        info!(event = "session_signal", pid, signal = signal.as_str(), "Delivering signal");
        signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| Error::channel_request(format!("kill failed: {e}")))
    }

    /// Start the shell, or `shell -c command`
    ///
    /// A `command="..."` key option replaces whatever the client asked for; the
    /// client's command is passed along in `SSH_ORIGINAL_COMMAND`.
    ///
    /// NIST 800-53: AC-17 (Remote Access), AC-6 (Least Privilege), AU-2 (Audit Events)
    fn start(&mut self, requested: Option<Vec<u8>>) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::channel_request("session already started"));
        }

        let command = match &self.ctx.options.command {
            Some(forced) => {
                info!(
                    event = "forced_command",
                    user = %self.ctx.user,
                    command = %forced,
                    "Running command from key options"
                );
                if let Some(original) = &requested {
                    self.env.insert(
                        "SSH_ORIGINAL_COMMAND".to_string(),
                        String::from_utf8_lossy(original).into_owned(),
                    );
                }
                Some(forced.clone().into_bytes())
            }
            None => requested,
        };

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (child, relays) = match &self.pty {
            Some(pty) => self.spawn_with_pty(pty, command.as_deref(), input_rx)?,
            None => self.spawn_with_pipes(command.as_deref(), input_rx)?,
        };

        let pid = child.id();
        info!(
            event = "session_start",
            user = %self.ctx.user,
            pid,
            pty = self.pty.is_some(),
            command = %command
                .as_deref()
                .map_or_else(|| "<shell>".into(), String::from_utf8_lossy),
            "Session process started"
        );

        self.ctx.tasks.spawn(wait_and_report(self.ctx.clone(), child, relays));
        self.ctx.metrics.record_session_started();
        self.process = Some(Process {
            pid,
            input: input_tx,
        });
        Ok(())
    }

    fn spawn_with_pipes(
        &self,
        command: Option<&[u8]>,
        input: mpsc::UnboundedReceiver<Input>,
    ) -> Result<(Child, Vec<JoinHandle<()>>)> {
        let mut cmd = tokio::process::Command::new(&self.ctx.config.shell);
        if let Some(command) = command {
            cmd.arg("-c").arg(OsStr::from_bytes(command));
        }
        cmd.envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::channel_request("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::channel_request("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::channel_request("child stderr unavailable"))?;

        self.ctx.tasks.spawn(pipe_input(stdin, input));
        let relays = vec![
            spawn_output(&self.ctx, stdout, None),
            // SSH_EXTENDED_DATA_STDERR
            spawn_output(&self.ctx, stderr, Some(1)),
        ];
        Ok((child, relays))
    }

    fn spawn_with_pty(
        &self,
        request: &PtyRequest,
        command: Option<&[u8]>,
        input: mpsc::UnboundedReceiver<Input>,
    ) -> Result<(Child, Vec<JoinHandle<()>>)> {
        let pty = pty_process::Pty::new().map_err(pty_error)?;
        let pts = pty.pts().map_err(pty_error)?;

        let mut cmd = pty_process::Command::new(&self.ctx.config.shell);
        if let Some(command) = command {
            cmd.arg("-c").arg(OsStr::from_bytes(command));
        }
        cmd.envs(&self.env).env("TERM", &request.term);

        let child = cmd.spawn(&pts).map_err(pty_error)?;
        // Only the child may hold the slave side, or reads never see EOF
        drop(pts);

        let (reader, writer) = pty.into_split();
        // Resizing before spawn is not portable
        if let Err(e) = writer.resize(request.size.into()) {
            warn!(error = %e, "Failed to set initial PTY size");
        }

        self.ctx.tasks.spawn(pty_input(writer, input));
        let relays = vec![spawn_output(&self.ctx, reader, None)];
        Ok((child, relays))
    }
}

#[async_trait]
impl ChannelHandler for SessionChannel {
    async fn handle_request(&mut self, request: ChannelRequest) -> bool {
        let kind = request.kind();
        let result = match request {
            ChannelRequest::Pty { term, cols, rows } => {
                self.request_pty(term, TermSize::new(cols, rows))
            }
            ChannelRequest::Env { name, value } => self.set_env(name, value),
            ChannelRequest::Shell => self.start(None),
            ChannelRequest::Exec { command } => self.start(Some(command)),
            ChannelRequest::Subsystem { name } => Err(Error::channel_request(format!(
                "subsystem {name} not supported"
            ))),
            ChannelRequest::WindowChange { cols, rows } => self.resize(TermSize::new(cols, rows)),
            ChannelRequest::Signal { signal } => self.signal(&signal),
            ChannelRequest::X11 { .. } => Err(Error::channel_request("X11 forwarding not supported")),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(request = kind, error = %e, "Session request rejected");
                self.ctx.metrics.record_request_rejected();
                false
            }
        }
    }

    async fn handle_data(&mut self, data: InputChunk) {
        self.ctx.metrics.record_bytes_received(data.len() as u64);
        match &self.process {
            Some(process) => {
                let _ = process.input.send(Input::Data(data));
            }
            None => debug!(bytes = data.len(), "Discarding data sent before shell or exec"),
        }
    }

    async fn handle_eof(&mut self) {
        if let Some(process) = &self.process {
            let _ = process.input.send(Input::Eof);
        }
    }

    async fn close(&mut self) {
        // Dropping the sender ends the input task; the waiter kills the process
        self.process = None;
        self.ctx.cancel.cancel();
    }
}

fn pty_error(err: impl std::fmt::Display) -> Error {
    Error::channel_request(format!("PTY error: {err}"))
}

async fn pipe_input<W>(mut stdin: W, mut input: mpsc::UnboundedReceiver<Input>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = input.recv().await {
        match message {
            Input::Data(data) => {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
            Input::Resize(_) => {}
            Input::Eof => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn pty_input(
    mut writer: pty_process::OwnedWritePty,
    mut input: mpsc::UnboundedReceiver<Input>,
) {
    while let Some(message) = input.recv().await {
        match message {
            Input::Data(data) => {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            Input::Resize(size) => {
                if let Err(e) = writer.resize(size.into()) {
                    debug!(error = %e, "PTY resize failed");
                }
            }
            // A PTY has no half-close
            Input::Eof => {}
        }
    }
}

fn spawn_output<R>(ctx: &ChannelContext, mut reader: R, extended: Option<u32>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let handle = ctx.handle.clone();
    let id = ctx.id;
    let metrics = ctx.metrics.clone();

    ctx.tasks.spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            // A PTY master reports EIO once the slave side is closed
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = CryptoVec::from_slice(&buf[..n]);
            let sent = match extended {
                Some(code) => handle.extended_data(id, code, chunk).await,
                None => handle.data(id, chunk).await,
            };
            if sent.is_err() {
                debug!("Channel closed, stopping output relay");
                break;
            }
            metrics.record_bytes_sent(n as u64);
        }
    })
}

/// Wait for the process, drain its output, then report the exit and close the channel
async fn wait_and_report(ctx: ChannelContext, mut child: Child, relays: Vec<JoinHandle<()>>) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = ctx.cancel.cancelled() => {
            debug!("Channel closed, killing session process");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    for mut relay in relays {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut relay)
            .await
            .is_err()
        {
            relay.abort();
        }
    }

    match status {
        Ok(status) => report_exit(&ctx, status).await,
        Err(e) => warn!(error = %e, "Failed to wait for session process"),
    }

    let _ = ctx.handle.eof(ctx.id).await;
    let _ = ctx.handle.close(ctx.id).await;
}

async fn report_exit(ctx: &ChannelContext, status: ExitStatus) {
    if let Some(code) = status.code() {
        info!(event = "session_exit", exit_code = code, "Session process exited");
        // Exit codes are 0..=255 on Unix
        let code = u32::try_from(code).unwrap_or(255);
        let _ = ctx.handle.exit_status_request(ctx.id, code).await;
    } else if let Some(raw) = status.signal() {
        let sig = sig_from_raw(raw);
        info!(event = "session_exit", signal = ?sig, "Session process killed by signal");
        let _ = ctx
            .handle
            .exit_signal_request(
                ctx.id,
                sig,
                status.core_dumped(),
                String::new(),
                "en".to_string(),
            )
            .await;
    }
}

/// Map a raw signal number to its SSH name (RFC 4254 section 6.10)
pub fn sig_from_raw(raw: i32) -> Sig {
    match Signal::try_from(raw) {
        Ok(Signal::SIGABRT) => Sig::ABRT,
        Ok(Signal::SIGALRM) => Sig::ALRM,
        Ok(Signal::SIGFPE) => Sig::FPE,
        Ok(Signal::SIGHUP) => Sig::HUP,
        Ok(Signal::SIGILL) => Sig::ILL,
        Ok(Signal::SIGINT) => Sig::INT,
        Ok(Signal::SIGKILL) => Sig::KILL,
        Ok(Signal::SIGPIPE) => Sig::PIPE,
        Ok(Signal::SIGQUIT) => Sig::QUIT,
        Ok(Signal::SIGSEGV) => Sig::SEGV,
        Ok(Signal::SIGTERM) => Sig::TERM,
        Ok(Signal::SIGUSR1) => Sig::USR1,
        Ok(other) => Sig::Custom(other.as_str().trim_start_matches("SIG").to_string()),
        Err(_) => Sig::Custom(raw.to_string()),
    }
}

/// Map an SSH signal name to a POSIX signal
pub fn signal_from_sig(sig: &Sig) -> Option<Signal> {
    let name = match sig {
        Sig::Custom(name) => name.clone(),
        // Named variants print as their bare SSH name
        other => format!("{other:?}"),
    };
    format!("SIG{name}").parse().ok()
}
