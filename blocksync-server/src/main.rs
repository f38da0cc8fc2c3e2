// blocksync server: accepts TLS sessions and stores each user's file as content-addressed blocks.

mod config;
mod registry;
mod server;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use blocksync_core::integrity::certificate_fingerprint;
use blocksync_core::{AuthError, Authenticator, MemoryDb};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::server::{Server, ServerOptions};

/// blocksync server - block store for file synchronization clients
#[derive(Parser, Debug)]
#[command(name = "blocksync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (default ~/.config/blocksync/server.toml, then /etc/blocksync/server.toml)
    #[arg(long, env = "BLOCKSYNC_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

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
    if let Some(bind) = args.bind {
        cfg.bind_address = bind;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(cert) = args.cert {
        cfg.cert_path = cert;
    }
    if let Some(key) = args.key {
        cfg.key_path = key;
    }

    let certs = tls::load_certs(&cfg.cert_path)?;
    let key = tls::load_key(&cfg.key_path)?;
    let fingerprint = hex::encode(certificate_fingerprint(certs[0].as_ref()));
    let acceptor = tls::acceptor(tls::server_config(certs, key)?);
    info!(%fingerprint, cert = %cfg.cert_path.display(), "server certificate");

    let db = Arc::new(MemoryDb::new());
    for user in &cfg.users {
        match db.register(user.username.as_bytes(), user.password.as_bytes()) {
            Ok(()) => {}
            Err(AuthError::AlreadyExists) => {
                warn!(user = %user.username, "user listed twice in config; keeping the first")
            }
            Err(e) => return Err(e).context("registering configured users"),
        }
    }
    if cfg.users.is_empty() {
        warn!("no users configured; every login will fail");
    }

    let listener = TcpListener::bind(cfg.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr()))?;
    let server = Server::new(
        listener,
        acceptor,
        db,
        ServerOptions {
            handshake_timeout: cfg.handshake_timeout(),
            frame_timeout: cfg.frame_timeout(),
        },
    );
    info!(addr = %server.local_addr()?, users = cfg.users.len(), "listening");

    server
        .run(async {
            match shutdown_signal().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!(error = %e, "cannot wait for shutdown signals; stopping"),
            }
        })
        .await
        .context("server error")?;
    info!("blocksync server stopped");
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
