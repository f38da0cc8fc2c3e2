//! Server-side peer session: authentication gating and the sync handlers.
//! Host-driven: the host feeds decoded messages in arrival order and writes
//! back the returned messages. Any `Err` is fatal to the session.

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::block_file::BlockFile;
use crate::db::{Database, StoreError};
use crate::integrity;
use crate::metadata::{ExtendedFileMetadata, ShortFileMetadata};
use crate::protocol::{Block, Hello, Login, Message, Reply, ReplyCode};
use crate::sync::{self, Reconciliation, SyncDecision};
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Per-connection state. Authenticated iff a username is recorded.
pub struct PeerSession {
    peer: String,
    db: Arc<dyn Database>,
    version: Option<u16>,
    capabilities: u16,
    username: Option<Vec<u8>>,
    /// Short metadata accepted and stored; waiting for its signature.
    awaiting_signature: Option<ShortFileMetadata>,
    reconciliation: Option<Reconciliation>,
}

impl PeerSession {
    pub fn new(peer: impl Into<String>, db: Arc<dyn Database>) -> Self {
        Self {
            peer: peer.into(),
            db,
            version: None,
            capabilities: 0,
            username: None,
            awaiting_signature: None,
            reconciliation: None,
        }
    }

    /// Remote endpoint identity.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn version(&self) -> Option<u16> {
        self.version
    }

    pub fn capabilities(&self) -> u16 {
        self.capabilities
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    pub fn username(&self) -> Option<&[u8]> {
        self.username.as_deref()
    }

    pub fn pending_blocks(&self) -> usize {
        self.reconciliation.as_ref().map_or(0, Reconciliation::pending)
    }

    /// Process one received message; returns the messages to send back, in order.
    pub fn on_message(&mut self, msg: Message) -> Result<Vec<Message>, SessionError> {
        match msg {
            Message::Hello(hello) => {
                self.on_hello(hello);
                Ok(Vec::new())
            }
            Message::Login(login) => Ok(vec![self.on_login(login)]),
            Message::ShortMetadata(meta) => match self.require_auth("short metadata") {
                Some(reply) => Ok(vec![reply]),
                None => self.on_short_metadata(meta),
            },
            Message::ExtendedMetadata(meta) => match self.require_auth("extended metadata") {
                Some(reply) => Ok(vec![reply]),
                None => self.on_extended_metadata(meta),
            },
            Message::Block(block) => match self.require_auth("block") {
                Some(reply) => Ok(vec![reply]),
                None => self.on_block(block),
            },
            Message::RequestBlock(req) => {
                debug!(peer = %self.peer, checksum = %hex::encode(&req.checksum), "ignoring block request from client");
                Ok(Vec::new())
            }
            Message::Reply(reply) => {
                debug!(peer = %self.peer, code = ?reply.code, message = %reply.message_lossy(), "peer reply");
                Ok(Vec::new())
            }
            Message::Unrecognized { kind, payload } => {
                debug!(peer = %self.peer, kind, len = payload.len(), "discarding unrecognized frame");
                Ok(Vec::new())
            }
        }
    }

    fn on_hello(&mut self, hello: Hello) {
        self.version = Some(hello.version);
        self.capabilities = hello.capabilities;
        info!(peer = %self.peer, version = hello.version, capabilities = hello.capabilities, "hello");
    }

    fn on_login(&mut self, login: Login) -> Message {
        let user = String::from_utf8_lossy(&login.username).into_owned();
        match self.db.login(&login.username, &login.password) {
            Ok(()) => {
                info!(peer = %self.peer, %user, "authenticated");
                self.awaiting_signature = None;
                self.reconciliation = None;
                self.username = Some(login.username);
                Message::Reply(Reply::new(ReplyCode::Ok, "authenticated"))
            }
            Err(e) => {
                warn!(peer = %self.peer, %user, error = %e, "login failed");
                Message::Reply(Reply::new(
                    ReplyCode::AuthFailed,
                    "invalid username or password",
                ))
            }
        }
    }

    fn require_auth(&self, what: &str) -> Option<Message> {
        if self.is_authenticated() {
            return None;
        }
        warn!(peer = %self.peer, what, "dropping message sent without authentication");
        Some(Message::Reply(Reply::new(
            ReplyCode::NotAuthenticated,
            "login required",
        )))
    }

    fn user(&self) -> &[u8] {
        self.username.as_deref().unwrap_or_default()
    }

    fn on_short_metadata(&mut self, incoming: ShortFileMetadata) -> Result<Vec<Message>, SessionError> {
        let current = self.db.retrieve_short(self.user())?;
        match sync::decide(&incoming, current.as_ref()) {
            SyncDecision::Store => {
                info!(
                    peer = %self.peer,
                    size = incoming.file_size,
                    changed = %incoming.timestamp_string(),
                    "new file version"
                );
                self.db.put_short(self.user(), incoming.clone())?;
                self.reconciliation = None;
                self.awaiting_signature = Some(incoming);
                Ok(vec![Message::Reply(Reply::new(
                    ReplyCode::SendExtendedMetadata,
                    "send block signature",
                ))])
            }
            SyncDecision::Duplicate => {
                if self.awaiting_signature.is_some() || self.reconciliation.is_some() {
                    debug!(peer = %self.peer, "file unchanged, reconciliation in progress");
                    return Ok(vec![Message::Reply(Reply::new(ReplyCode::Ok, "sync in progress"))]);
                }
                let stored = current.unwrap_or(incoming);
                if self.stored_version_complete(&stored)? {
                    info!(peer = %self.peer, size = stored.file_size, "file unchanged");
                    return Ok(vec![Message::Reply(Reply::new(ReplyCode::Ok, "up to date"))]);
                }
                // An earlier reconciliation was cut off: resume it.
                warn!(peer = %self.peer, size = stored.file_size, "stored version incomplete, asking for signature again");
                self.awaiting_signature = Some(stored);
                Ok(vec![Message::Reply(Reply::new(
                    ReplyCode::SendExtendedMetadata,
                    "send block signature",
                ))])
            }
            SyncDecision::Stale => {
                // Notify only: the server does not push its version back.
                let stored = current
                    .map(|c| c.timestamp_string())
                    .unwrap_or_default();
                warn!(
                    peer = %self.peer,
                    size = incoming.file_size,
                    changed = %incoming.timestamp_string(),
                    %stored,
                    "peer holds a stale file"
                );
                Ok(vec![Message::Reply(Reply::new(ReplyCode::Stale, stored))])
            }
        }
    }

    fn on_extended_metadata(
        &mut self,
        extended: ExtendedFileMetadata,
    ) -> Result<Vec<Message>, SessionError> {
        let Some(short) = self.awaiting_signature.take() else {
            warn!(peer = %self.peer, "dropping unsolicited block signature");
            return Ok(Vec::new());
        };
        sync::check_signature(&extended, &short)
            .map_err(|e| SessionError::Protocol(format!("bad block signature: {e}")))?;
        self.db.put_extended(self.user(), extended.clone())?;
        let (reconciliation, requests) = Reconciliation::begin(short, extended, self.db.as_ref());
        info!(
            peer = %self.peer,
            blocks = reconciliation.extended().block_count,
            missing = reconciliation.pending(),
            "block signature stored"
        );
        self.reconciliation = Some(reconciliation);
        if requests.is_empty() {
            return Ok(vec![self.finish_reconciliation()?]);
        }
        Ok(requests.into_iter().map(Message::RequestBlock).collect())
    }

    fn on_block(&mut self, block: Block) -> Result<Vec<Message>, SessionError> {
        let Some(reconciliation) = self.reconciliation.as_mut() else {
            return Err(SessionError::Protocol(format!(
                "unsolicited block {}",
                hex::encode(&block.checksum)
            )));
        };
        let next = reconciliation
            .accept_block(&block)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let complete = reconciliation.is_complete();
        debug!(peer = %self.peer, checksum = %hex::encode(&block.checksum), len = block.data.len(), "block stored");
        self.db.put_block(&block.checksum, block.data)?;
        if complete {
            return Ok(vec![self.finish_reconciliation()?]);
        }
        Ok(next.into_iter().map(Message::RequestBlock).collect())
    }

    /// The stored signature fits the stored short metadata, every block is
    /// present, and the blocks rebuild the recorded content hash.
    fn stored_version_complete(&self, short: &ShortFileMetadata) -> Result<bool, SessionError> {
        let Some(extended) = self.db.retrieve_extended(self.user())? else {
            return Ok(false);
        };
        if sync::check_signature(&extended, short).is_err()
            || !sync::missing_blocks(&extended, self.db.as_ref()).is_empty()
        {
            return Ok(false);
        }
        let rebuilt = integrity::content_hash_reader(BlockFile::new(self.db.as_ref(), &extended))?;
        Ok(rebuilt.as_slice() == short.file_hash.as_slice())
    }

    /// Rebuild the file from the block store and compare it with the accepted content hash.
    fn finish_reconciliation(&mut self) -> Result<Message, SessionError> {
        let Some(reconciliation) = self.reconciliation.take() else {
            return Err(SessionError::Protocol("no reconciliation in progress".into()));
        };
        let file = BlockFile::new(self.db.as_ref(), reconciliation.extended());
        let rebuilt = integrity::content_hash_reader(file)?;
        if rebuilt.as_slice() == reconciliation.short().file_hash.as_slice() {
            info!(peer = %self.peer, size = reconciliation.short().file_size, "file synchronized");
            Ok(Message::Reply(Reply::new(ReplyCode::SyncComplete, "synchronized")))
        } else {
            error!(peer = %self.peer, "rebuilt file does not match the reported content hash");
            Ok(Message::Reply(Reply::new(
                ReplyCode::ReconstructionFailed,
                "content hash mismatch",
            )))
        }
    }
}

/// Fatal to the one session; never to the process.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("bad frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("timed out waiting for frame body")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}
