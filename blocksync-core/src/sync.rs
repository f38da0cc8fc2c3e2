//! Sync decision engine: classify incoming metadata against the stored version,
//! and track the block exchange that follows an accepted version.

use std::collections::{HashSet, VecDeque};

use crate::db::BlockStore;
use crate::integrity::{self, HASH_LEN};
use crate::metadata::{ExtendedFileMetadata, MetadataError, ShortFileMetadata};
use crate::protocol::{Block, RequestBlock};

/// What to do with an incoming short metadata report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// No prior version, or the incoming one is newer with different content: store it and reconcile.
    Store,
    /// Same size and content hash as the stored version.
    Duplicate,
    /// Not newer, but different content: the peer holds a stale or divergent copy.
    Stale,
}

/// Decide from metadata alone. Overwrite is checked before equality.
pub fn decide(incoming: &ShortFileMetadata, current: Option<&ShortFileMetadata>) -> SyncDecision {
    match current {
        None => SyncDecision::Store,
        Some(cur) if incoming.should_overwrite(cur) => SyncDecision::Store,
        Some(cur) if incoming.same_content(cur) => SyncDecision::Duplicate,
        Some(_) => SyncDecision::Stale,
    }
}

/// Check a signature is usable for reconciliation against the short metadata it belongs to.
pub fn check_signature(
    extended: &ExtendedFileMetadata,
    accepted: &ShortFileMetadata,
) -> Result<(), MetadataError> {
    extended.validate()?;
    if extended.strong_len == 0 || extended.strong_len as usize > HASH_LEN {
        return Err(MetadataError::UnsupportedStrongLength(extended.strong_len));
    }
    if extended.block_len == 0 {
        return Err(MetadataError::ZeroBlockLength);
    }
    if let Some(key) = extended
        .weak_hashes
        .keys()
        .find(|k| u64::from(**k) >= extended.block_count)
    {
        return Err(MetadataError::WeakKey(*key));
    }
    let block_len = u64::from(extended.block_len);
    let fits = match extended.block_count {
        0 => extended.file_size == 0,
        n => {
            let max = n.saturating_mul(block_len);
            let min = (n - 1).saturating_mul(block_len);
            extended.file_size > min && extended.file_size <= max
        }
    };
    if !fits || extended.file_size != accepted.file_size {
        return Err(MetadataError::SizeMismatch {
            file_size: extended.file_size,
            block_count: extended.block_count,
            block_len: extended.block_len,
        });
    }
    Ok(())
}

/// Distinct strong hashes the store lacks, in first-occurrence block order.
pub fn missing_blocks<S: BlockStore + ?Sized>(
    extended: &ExtendedFileMetadata,
    store: &S,
) -> Vec<Vec<u8>> {
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for hash in &extended.strong_hashes {
        if seen.insert(hash.as_slice()) && !store.has_block(hash) {
            missing.push(hash.clone());
        }
    }
    missing
}

/// Most block requests outstanding at once. The server only writes requests
/// while the peer is writing blocks, so the window must fit in a socket buffer.
pub const REQUEST_WINDOW: usize = 16;

/// Block exchange for one accepted signature. Missing hashes are requested at
/// most `REQUEST_WINDOW` at a time; each accepted block releases the next request.
#[derive(Debug)]
pub struct Reconciliation {
    extended: ExtendedFileMetadata,
    short: ShortFileMetadata,
    requested: HashSet<Vec<u8>>,
    queued: VecDeque<Vec<u8>>,
}

impl Reconciliation {
    /// Start reconciling; returns the state and the first requests to send, in block order.
    pub fn begin<S: BlockStore + ?Sized>(
        short: ShortFileMetadata,
        extended: ExtendedFileMetadata,
        store: &S,
    ) -> (Self, Vec<RequestBlock>) {
        let mut rec = Self {
            queued: missing_blocks(&extended, store).into(),
            extended,
            short,
            requested: HashSet::new(),
        };
        let requests = (0..REQUEST_WINDOW).map_while(|_| rec.request_next()).collect();
        (rec, requests)
    }

    fn request_next(&mut self) -> Option<RequestBlock> {
        let checksum = self.queued.pop_front()?;
        self.requested.insert(checksum.clone());
        Some(RequestBlock { checksum })
    }

    /// Verify a delivered block. On success the block is no longer pending and
    /// may be stored; the next queued request, if any, is returned for sending.
    pub fn accept_block(&mut self, block: &Block) -> Result<Option<RequestBlock>, ReconcileError> {
        if !self.requested.contains(&block.checksum) {
            return Err(ReconcileError::Unrequested(hex::encode(&block.checksum)));
        }
        if !integrity::verify_block(&block.data, &block.checksum) {
            return Err(ReconcileError::ChecksumMismatch(hex::encode(&block.checksum)));
        }
        if block.data.len() as u64 > u64::from(self.extended.block_len) {
            return Err(ReconcileError::Oversized(hex::encode(&block.checksum)));
        }
        self.requested.remove(&block.checksum);
        Ok(self.request_next())
    }

    pub fn is_complete(&self) -> bool {
        self.requested.is_empty() && self.queued.is_empty()
    }

    /// Blocks still to arrive, requested or not.
    pub fn pending(&self) -> usize {
        self.requested.len() + self.queued.len()
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.requested.len()
    }

    pub fn extended(&self) -> &ExtendedFileMetadata {
        &self.extended
    }

    pub fn short(&self) -> &ShortFileMetadata {
        &self.short
    }
}

/// A delivered block that must not be stored. Always a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("block {0} was not requested")]
    Unrequested(String),
    #[error("block {0} does not hash to its checksum")]
    ChecksumMismatch(String),
    #[error("block {0} is longer than the block length")]
    Oversized(String),
}
