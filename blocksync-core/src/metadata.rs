//! File metadata: the short form (size, content hash, mtime) and the extended
//! block signature (per-block weak and strong checksums).

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

/// Size, whole-file content hash and last-changed time. One per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortFileMetadata {
    pub file_size: u64,
    pub file_hash: Vec<u8>,
    pub last_changed: DateTime<Utc>,
}

impl ShortFileMetadata {
    /// `self` replaces `current` only when it is strictly newer and carries different content.
    pub fn should_overwrite(&self, current: &ShortFileMetadata) -> bool {
        self.last_changed > current.last_changed && self.file_hash != current.file_hash
    }

    /// Same size and same content hash; the timestamp is ignored.
    pub fn same_content(&self, other: &ShortFileMetadata) -> bool {
        self.file_size == other.file_size && self.file_hash == other.file_hash
    }

    /// Timestamp as carried on the wire (RFC 3339, nanoseconds, UTC).
    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.last_changed)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Block signature of a file.
///
/// `block_count` must equal both the number of weak entries and the number of
/// strong hashes, and every strong hash is exactly `strong_len` bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedFileMetadata {
    pub file_size: u64,
    pub strong_len: u32,
    pub block_len: u32,
    pub block_count: u64,
    /// Block index -> rolling checksum. Carried as i64 on the wire.
    pub weak_hashes: BTreeMap<u32, i64>,
    /// Strong checksum of each block, in block order.
    pub strong_hashes: Vec<Vec<u8>>,
}

impl ExtendedFileMetadata {
    /// Check the structural invariants the wire layout depends on.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.weak_hashes.len() as u64 != self.block_count {
            return Err(MetadataError::WeakCount {
                expected: self.block_count,
                actual: self.weak_hashes.len() as u64,
            });
        }
        if self.strong_hashes.len() as u64 != self.block_count {
            return Err(MetadataError::StrongCount {
                expected: self.block_count,
                actual: self.strong_hashes.len() as u64,
            });
        }
        if let Some((index, hash)) = self
            .strong_hashes
            .iter()
            .enumerate()
            .find(|(_, h)| h.len() as u64 != u64::from(self.strong_len))
        {
            return Err(MetadataError::StrongLength {
                index: index as u64,
                expected: self.strong_len,
                actual: hash.len() as u64,
            });
        }
        Ok(())
    }

    /// Index of the first block carrying `checksum`.
    pub fn block_index_of(&self, checksum: &[u8]) -> Option<usize> {
        self.strong_hashes.iter().position(|h| h == checksum)
    }
}

/// ExtendedFileMetadata violates one of its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("block count {expected} but {actual} weak checksums")]
    WeakCount { expected: u64, actual: u64 },
    #[error("block count {expected} but {actual} strong checksums")]
    StrongCount { expected: u64, actual: u64 },
    #[error("strong checksum {index} is {actual} bytes, expected {expected}")]
    StrongLength {
        index: u64,
        expected: u32,
        actual: u64,
    },
    #[error("weak checksum key {0} is not a block index")]
    WeakKey(u32),
    #[error("strong checksum length {0} not supported")]
    UnsupportedStrongLength(u32),
    #[error("block length must be non-zero")]
    ZeroBlockLength,
    #[error("file size {file_size} does not fit {block_count} blocks of {block_len} bytes")]
    SizeMismatch {
        file_size: u64,
        block_count: u64,
        block_len: u32,
    },
}
