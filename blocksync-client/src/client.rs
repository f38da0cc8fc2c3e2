//! Client session: handshake, then keep the watched file in sync with the server.

use std::fmt;
use std::time::Duration;

use blocksync_core::signature::SignatureError;
use blocksync_core::transport::{write_message, FrameReader};
use blocksync_core::{
    Block, FileWatcher, Hello, Login, Message, Reply, ReplyCode, RequestBlock, SessionError,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Which handshake send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Hello,
    Login,
    ShortMetadata,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeStep::Hello => "hello",
            HandshakeStep::Login => "login",
            HandshakeStep::ShortMetadata => "short metadata",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("handshake failed at {step}: {source}")]
pub struct HandshakeError {
    pub step: HandshakeStep,
    #[source]
    pub source: SessionError,
}

impl HandshakeError {
    fn at(step: HandshakeStep) -> impl FnOnce(SessionError) -> Self {
        move |source| Self { step, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("watched file: {0}")]
    Signature(#[from] SignatureError),
    #[error("server refused the session: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Session(SessionError::Io(e))
    }
}

pub struct ClientSession<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    watcher: FileWatcher,
    credentials: Login,
    poll_interval: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    pub fn new(stream: S, watcher: FileWatcher, credentials: Login, poll_interval: Duration) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half),
            writer,
            watcher,
            credentials,
            poll_interval,
        }
    }

    /// Limit the time between a frame header and the end of its body. `None` disables.
    pub fn with_frame_timeout(mut self, limit: Option<Duration>) -> Self {
        self.reader = self.reader.with_body_timeout(limit);
        self
    }

    /// Send Hello, Login and the file's short metadata, in that order.
    pub async fn handshake(&mut self) -> Result<(), HandshakeError> {
        self.send(&Message::Hello(Hello::new()))
            .await
            .map_err(HandshakeError::at(HandshakeStep::Hello))?;
        let login = Message::Login(self.credentials.clone());
        self.send(&login)
            .await
            .map_err(HandshakeError::at(HandshakeStep::Login))?;
        let short = self
            .watcher
            .short_metadata()
            .map_err(|e| HandshakeError::at(HandshakeStep::ShortMetadata)(SessionError::Io(e)))?;
        self.send(&Message::ShortMetadata(short))
            .await
            .map_err(HandshakeError::at(HandshakeStep::ShortMetadata))?;
        debug!(path = %self.watcher.path().display(), "handshake sent");
        Ok(())
    }

    /// Serve the server's requests and re-announce the file whenever it changes,
    /// until the server closes the connection or `stop` is raised.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let result = loop {
            if *stop.borrow() {
                break Ok(());
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_file().await {
                        break Err(e);
                    }
                }
                next = self.reader.next_message() => match next {
                    Ok(Some(msg)) => {
                        if let Err(e) = self.on_message(msg).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        info!("server closed the connection");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                }
            }
        };
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "shutdown after session end");
        }
        result
    }

    async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        write_message(&mut self.writer, msg).await
    }

    async fn poll_file(&mut self) -> Result<(), ClientError> {
        if self.watcher.poll_changed()? {
            info!(path = %self.watcher.path().display(), "file changed, announcing");
            self.send_short().await?;
        }
        Ok(())
    }

    async fn send_short(&mut self) -> Result<(), ClientError> {
        let short = self.watcher.short_metadata()?;
        self.send(&Message::ShortMetadata(short)).await?;
        Ok(())
    }

    async fn on_message(&mut self, msg: Message) -> Result<(), ClientError> {
        match msg {
            Message::Reply(reply) => self.on_reply(reply).await,
            Message::RequestBlock(req) => self.on_request_block(req).await,
            other => {
                debug!(kind = other.name(), "ignoring message");
                Ok(())
            }
        }
    }

    async fn on_reply(&mut self, reply: Reply) -> Result<(), ClientError> {
        let text = reply.message_lossy();
        match reply.code {
            ReplyCode::Ok => info!(message = %text, "server ok"),
            ReplyCode::AuthFailed => {
                return Err(ClientError::Rejected(format!("login failed: {text}")))
            }
            ReplyCode::NotAuthenticated => {
                return Err(ClientError::Rejected(format!("not authenticated: {text}")))
            }
            ReplyCode::SendExtendedMetadata => {
                // The file may have moved on since it was announced; announce again instead.
                if self.watcher.poll_changed()? {
                    info!("file changed before signature was sent, announcing again");
                    return self.send_short().await;
                }
                let extended = self.watcher.extended_metadata()?;
                info!(blocks = extended.block_count, "sending block signature");
                self.send(&Message::ExtendedMetadata(extended)).await?;
            }
            ReplyCode::Stale => warn!(server_version = %text, "server holds a newer version of the file"),
            ReplyCode::SyncComplete => info!("file synchronized"),
            ReplyCode::ReconstructionFailed => error!(message = %text, "server could not rebuild the file"),
            ReplyCode::Other(code) => warn!(code, message = %text, "unknown reply"),
        }
        Ok(())
    }

    async fn on_request_block(&mut self, req: RequestBlock) -> Result<(), ClientError> {
        match self.watcher.block_for(&req.checksum)? {
            Some(data) => {
                debug!(checksum = %hex::encode(&req.checksum), len = data.len(), "sending block");
                self.send(&Message::Block(Block {
                    checksum: req.checksum,
                    data,
                }))
                .await?;
            }
            None => warn!(checksum = %hex::encode(&req.checksum), "requested block not in file"),
        }
        Ok(())
    }
}
