//! Signature engine: rsync weak checksum + truncated strong checksum per fixed-size block,
//! and a cached view of one watched file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::integrity::{self, HASH_LEN};
use crate::metadata::{ExtendedFileMetadata, ShortFileMetadata};

const CHAR_OFFSET: u32 = 31;

/// rsync-style weak checksum of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollsum {
    s1: u32,
    s2: u32,
}

impl Rollsum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(block: &[u8]) -> u32 {
        let mut sum = Self::new();
        sum.update(block);
        sum.digest()
    }

    pub fn update(&mut self, buf: &[u8]) {
        for &b in buf {
            self.s1 = self.s1.wrapping_add(u32::from(b) + CHAR_OFFSET);
            self.s2 = self.s2.wrapping_add(self.s1);
        }
    }

    pub fn digest(&self) -> u32 {
        (self.s2 << 16) | (self.s1 & 0xffff)
    }
}

/// Compute the block signature of everything `reader` yields.
pub fn compute_signature<R: Read>(
    mut reader: R,
    block_len: u32,
    strong_len: u32,
) -> Result<ExtendedFileMetadata, SignatureError> {
    if block_len == 0 {
        return Err(SignatureError::ZeroBlockLength);
    }
    if strong_len == 0 || strong_len as usize > HASH_LEN {
        return Err(SignatureError::StrongLength(strong_len));
    }
    let mut meta = ExtendedFileMetadata {
        strong_len,
        block_len,
        ..Default::default()
    };
    let mut buf = vec![0u8; block_len as usize];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        let index = u32::try_from(meta.block_count).map_err(|_| SignatureError::TooManyBlocks)?;
        meta.weak_hashes.insert(index, i64::from(Rollsum::of(block)));
        meta.strong_hashes
            .push(integrity::strong_hash(block, strong_len as usize));
        meta.block_count += 1;
        meta.file_size += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(meta)
}

/// Fill `buf` unless the reader ends first. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Size, content hash and modification time of a file on disk.
pub fn short_metadata(path: &Path) -> io::Result<ShortFileMetadata> {
    let file = File::open(path)?;
    let info = file.metadata()?;
    let file_hash = integrity::content_hash_reader(&file)?;
    Ok(ShortFileMetadata {
        file_size: info.len(),
        file_hash: file_hash.to_vec(),
        last_changed: DateTime::<Utc>::from(info.modified()?),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("block length must be non-zero")]
    ZeroBlockLength,
    #[error("strong checksum length {0} must be between 1 and 32")]
    StrongLength(u32),
    #[error("file has more blocks than a signature can index")]
    TooManyBlocks,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One watched file. Metadata is computed lazily and cached until the file's
/// size or modification time changes.
pub struct FileWatcher {
    path: PathBuf,
    block_len: u32,
    strong_len: u32,
    stamp: Option<(u64, SystemTime)>,
    short: Option<ShortFileMetadata>,
    extended: Option<ExtendedFileMetadata>,
}

impl FileWatcher {
    /// Fails if the file cannot be read or the block parameters are invalid.
    pub fn new(
        path: impl Into<PathBuf>,
        block_len: u32,
        strong_len: u32,
    ) -> Result<Self, SignatureError> {
        if block_len == 0 {
            return Err(SignatureError::ZeroBlockLength);
        }
        if strong_len == 0 || strong_len as usize > HASH_LEN {
            return Err(SignatureError::StrongLength(strong_len));
        }
        let mut watcher = Self {
            path: path.into(),
            block_len,
            strong_len,
            stamp: None,
            short: None,
            extended: None,
        };
        watcher.short_metadata()?;
        Ok(watcher)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset_cache(&mut self) {
        self.short = None;
        self.extended = None;
    }

    fn current_stamp(&self) -> io::Result<(u64, SystemTime)> {
        let info = std::fs::metadata(&self.path)?;
        Ok((info.len(), info.modified()?))
    }

    /// Returns true (and drops the cache) when size or mtime differ from the last computation.
    pub fn poll_changed(&mut self) -> io::Result<bool> {
        let stamp = self.current_stamp()?;
        if self.stamp == Some(stamp) {
            return Ok(false);
        }
        debug!(path = %self.path.display(), "watched file changed");
        self.reset_cache();
        self.stamp = Some(stamp);
        Ok(true)
    }

    pub fn short_metadata(&mut self) -> io::Result<ShortFileMetadata> {
        if let Some(short) = &self.short {
            return Ok(short.clone());
        }
        let stamp = self.current_stamp()?;
        let short = short_metadata(&self.path)?;
        self.stamp = Some(stamp);
        self.short = Some(short.clone());
        Ok(short)
    }

    pub fn extended_metadata(&mut self) -> Result<ExtendedFileMetadata, SignatureError> {
        if let Some(extended) = &self.extended {
            return Ok(extended.clone());
        }
        let file = File::open(&self.path)?;
        let extended = compute_signature(file, self.block_len, self.strong_len)?;
        self.extended = Some(extended.clone());
        Ok(extended)
    }

    /// Bytes of the first block whose strong checksum is `checksum`, re-read from disk.
    /// `None` if the signature has no such block or the block no longer matches it.
    pub fn block_for(&mut self, checksum: &[u8]) -> Result<Option<Vec<u8>>, SignatureError> {
        let extended = self.extended_metadata()?;
        let Some(index) = extended.block_index_of(checksum) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(index as u64 * u64::from(self.block_len)))?;
        let mut buf = vec![0u8; self.block_len as usize];
        let n = read_full(&mut file, &mut buf)?;
        buf.truncate(n);
        if !integrity::verify_block(&buf, checksum) {
            debug!(index, "block changed on disk since the signature was taken");
            return Ok(None);
        }
        Ok(Some(buf))
    }
}
