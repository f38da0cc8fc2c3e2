//! Accept loop and per-connection peer task.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blocksync_core::transport::{write_message, FrameReader};
use blocksync_core::{Database, Message, PeerSession, SessionError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::registry::{self, RegistryHandle};

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub handshake_timeout: Duration,
    pub frame_timeout: Option<Duration>,
}

pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    db: Arc<dyn Database>,
    options: ServerOptions,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        db: Arc<dyn Database>,
        options: ServerOptions,
    ) -> Self {
        Self {
            listener,
            acceptor,
            db,
            options,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then stop every session
    /// and return once all of them have closed.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let registry = registry::spawn();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, addr)) => {
                        tokio::spawn(handle_connection(
                            tcp,
                            addr,
                            self.acceptor.clone(),
                            registry.clone(),
                            self.db.clone(),
                            self.options,
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
        drop(self.listener);
        registry.stop_all().await;
        info!("all sessions closed");
        Ok(())
    }
}

async fn handle_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    registry: RegistryHandle,
    db: Arc<dyn Database>,
    options: ServerOptions,
) {
    let id = addr.to_string();
    debug!(peer = %id, "tcp connection");
    let stream = match tokio::time::timeout(options.handshake_timeout, acceptor.accept(tcp)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(peer = %id, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %id, "TLS handshake timed out");
            return;
        }
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    if !registry.register(id.clone(), stop_tx).await {
        return;
    }
    info!(peer = %id, "session started");
    let session = PeerSession::new(id.clone(), db);
    match serve_peer(stream, session, options.frame_timeout, stop_rx).await {
        Ok(()) => info!(peer = %id, "session ended"),
        Err(e) => warn!(peer = %id, error = %e, "session failed"),
    }
    registry.closed(id);
}

/// Drive one session until the peer disconnects, a fatal error occurs, or a
/// stop is requested. The stream is shut down before returning in every case.
pub async fn serve_peer<S>(
    stream: S,
    mut session: PeerSession,
    frame_timeout: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half).with_body_timeout(frame_timeout);
    let result = loop {
        if *stop.borrow() {
            debug!(peer = %session.peer(), "stop requested");
            break Ok(());
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            next = reader.next_message() => {
                let msg = match next {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!(peer = %session.peer(), "peer disconnected");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                };
                debug!(peer = %session.peer(), kind = msg.name(), "frame received");
                if let Err(e) = respond(&mut session, msg, &mut write_half).await {
                    break Err(e);
                }
            }
        }
    };
    let mut stream = reader.into_inner().unsplit(write_half);
    if let Err(e) = stream.shutdown().await {
        debug!(peer = %session.peer(), error = %e, "shutdown after session end");
    }
    result
}

async fn respond<W: AsyncWrite + Unpin>(
    session: &mut PeerSession,
    msg: Message,
    writer: &mut W,
) -> Result<(), SessionError> {
    for reply in session.on_message(msg)? {
        write_message(writer, &reply).await?;
    }
    Ok(())
}
