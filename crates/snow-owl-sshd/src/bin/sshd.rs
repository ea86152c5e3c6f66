//! SSH Daemon Binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: Standalone SSH daemon with JSON logging for SIEM integration
//!
//! Run with: cargo run --bin snow-owl-sshd -- --authkey ~/.ssh/id_ed25519.pub

use anyhow::{Context, Result};
use clap::Parser;
use russh::keys::ssh_key::HashAlg;
use snow_owl_sshd::{LogFormat, LoggingConfig, Server, ServerConfig};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host key file; a random key is generated when omitted
    #[arg(long)]
    hostkey: Option<PathBuf>,

    /// Authorized keys file
    #[arg(long)]
    authkey: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    // NIST 800-53 AU-9, AU-12: Structured audit output
    let _log_guard = init_logging(&config.logging);

    if let Err(e) = run(config, &args).await {
        error!(event = "server_error", error = %format!("{e:#}"), "SSH daemon failed");
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind_address.clone_from(bind);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(file) = &args.log_file {
        config.logging.file = Some(file.clone());
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    config.validate()?;
    Ok(config)
}

/// Install the tracing subscriber
///
/// Falls back to stderr when the log directory cannot be created.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let appender = logging.file.as_deref().and_then(file_appender);

    match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            match logging.format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter())
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_span_list(true)
                    .init(),
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(filter())
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
            }
            Some(guard)
        }
        None => {
            match logging.format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter())
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true)
                    .init(),
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(filter())
                    .with_writer(std::io::stderr)
                    .init(),
            }
            None
        }
    }
}

fn file_appender(path: &Path) -> Option<tracing_appender::rolling::RollingFileAppender> {
    let file_name = path.file_name()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Failed to create log directory: {e}");
        eprintln!("Falling back to stderr logging");
        return None;
    }

    Some(tracing_appender::rolling::daily(dir, file_name))
}

async fn run(config: ServerConfig, args: &Args) -> Result<()> {
    let port = config.port;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Snow Owl SSH daemon"
    );
    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port,
        max_connections = config.max_connections,
        max_auth_attempts = config.max_auth_attempts,
        shell = %config.shell.display(),
        allow_pty = config.allow_pty,
        allow_port_forwarding = config.allow_port_forwarding,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "SSH daemon configuration"
    );

    let mut server = Server::new(config);

    match &args.hostkey {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read host key {}", path.display()))?;
            server
                .add_hostkey(&raw)
                .with_context(|| format!("failed to load host key {}", path.display()))?;
        }
        None => {
            warn!("No host key given, using a random key for this run");
            server.random_hostkey()?;
        }
    }

    let raw = std::fs::read(&args.authkey)
        .with_context(|| format!("failed to read authorized keys {}", args.authkey.display()))?;
    let loaded = server.add_authorized_keys(&raw)?;
    info!(event = "authorized_keys_loaded", count = loaded, "Loaded authorized keys");

    for key in server.host_public_keys() {
        info!(
            event = "host_key",
            algorithm = key.algorithm().as_str(),
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "Serving host key"
        );
    }

    let addr = server.listen_and_serve(port).await?;
    info!(event = "server_running", address = %addr, "SSH daemon is accepting connections");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!(event = "server_shutdown", "Shutdown requested");
    server.stop();
    server.wait().await;

    info!(
        event = "server_stopped",
        summary = %server.metrics().snapshot().summary(),
        "SSH daemon stopped"
    );
    Ok(())
}
