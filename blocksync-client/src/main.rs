// blocksync client: keeps one local file synchronized with a blocksync server.

mod client;
mod config;
mod tls;

use std::path::PathBuf;

use anyhow::{Context, Result};
use blocksync_core::tls::client_config;
use blocksync_core::{FileWatcher, Login};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::client::ClientSession;

/// blocksync client - synchronize a file with a blocksync server
#[derive(Parser, Debug)]
#[command(name = "blocksync-client")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (default ~/.config/blocksync/client.toml)
    #[arg(long, env = "BLOCKSYNC_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Server address, host:port
    #[arg(short = 'u', long)]
    server: Option<String>,

    /// File to synchronize
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// Hex SHA3-256 fingerprint of the server certificate
    #[arg(long)]
    fingerprint: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Block length in KiB
    #[arg(short = 'b', long)]
    block_length: Option<u32>,

    /// Strong checksum bytes per block (1-32)
    #[arg(short = 'c', long)]
    checksum_length: Option<u32>,

    /// Log level
    #[arg(long, default_value = "info", env = "BLOCKSYNC_LOG_LEVEL")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(server) = args.server {
        cfg.server = server;
    }
    if let Some(input) = args.input {
        cfg.input = Some(input);
    }
    if let Some(fingerprint) = args.fingerprint {
        cfg.fingerprint = Some(fingerprint);
    }
    if let Some(username) = args.username {
        cfg.username = username;
    }
    if let Some(password) = args.password {
        cfg.password = password;
    }
    if let Some(kib) = args.block_length {
        cfg.block_length_kib = kib;
    }
    if let Some(len) = args.checksum_length {
        cfg.strong_length = len;
    }

    let fingerprint = cfg.pinned_fingerprint()?;
    let input = cfg.input_path()?.to_path_buf();
    let watcher = FileWatcher::new(&input, cfg.block_length()?, cfg.strong_length)
        .with_context(|| format!("watching {}", input.display()))?;
    info!(path = %input.display(), server = %cfg.server, "starting");

    let stream = tls::connect(
        &cfg.server,
        &cfg.server_name,
        client_config(fingerprint).context("building TLS client config")?,
        cfg.connect_timeout(),
    )
    .await?;
    info!(server = %cfg.server, "connected");

    let mut session = ClientSession::new(
        stream,
        watcher,
        Login::new(cfg.username.as_str(), cfg.password.as_str()),
        cfg.poll_interval(),
    )
    .with_frame_timeout(cfg.frame_timeout());
    session.handshake().await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "cannot wait for shutdown signals; stopping"),
        }
        let _ = stop_tx.send(true);
    });
    session.run(stop_rx).await?;
    info!("blocksync client stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
