//! Streaming reassembly: read a file back out of the block store, one block at a time.

use std::io::{self, Cursor, Read};

use crate::db::{BlockStore, MetadataStore, StoreError};
use crate::metadata::ExtendedFileMetadata;

/// `io::Read` over the concatenation of blocks named by a signature's strong hash list.
/// Only the block currently being read is held in memory.
pub struct BlockFile<'a, S: BlockStore + ?Sized> {
    store: &'a S,
    hashes: Vec<Vec<u8>>,
    next: usize,
    current: Cursor<Vec<u8>>,
}

impl<'a, S: BlockStore + ?Sized> BlockFile<'a, S> {
    pub fn new(store: &'a S, metadata: &ExtendedFileMetadata) -> Self {
        Self {
            store,
            hashes: metadata.strong_hashes.clone(),
            next: 0,
            current: Cursor::new(Vec::new()),
        }
    }

    fn load_next(&mut self) -> io::Result<bool> {
        let Some(hash) = self.hashes.get(self.next) else {
            return Ok(false);
        };
        let block = self
            .store
            .retrieve_block(hash)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    StoreError::MissingBlock(hex::encode(hash)),
                )
            })?;
        self.next += 1;
        self.current = Cursor::new(block);
        Ok(true)
    }
}

impl<S: BlockStore + ?Sized> Read for BlockFile<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.load_next()? {
                return Ok(0);
            }
        }
    }
}

/// Open the stored file of `user`, or `None` if no signature was ever stored.
pub fn retrieve_file<'a, D>(db: &'a D, user: &[u8]) -> Result<Option<BlockFile<'a, D>>, StoreError>
where
    D: MetadataStore + BlockStore + ?Sized,
{
    Ok(db
        .retrieve_extended(user)?
        .map(|meta| BlockFile::new(db, &meta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetadataStore;
    use crate::integrity::strong_hash;
    use crate::memory_db::MemoryDb;
    use std::collections::BTreeMap;

    fn store_blocks(db: &MemoryDb, blocks: &[&[u8]]) -> ExtendedFileMetadata {
        let strong_hashes: Vec<Vec<u8>> = blocks
            .iter()
            .map(|b| {
                let h = strong_hash(b, 8);
                db.put_block(&h, b.to_vec()).unwrap();
                h
            })
            .collect();
        ExtendedFileMetadata {
            file_size: blocks.iter().map(|b| b.len() as u64).sum(),
            strong_len: 8,
            block_len: 4,
            block_count: blocks.len() as u64,
            weak_hashes: (0..blocks.len() as u32).map(|i| (i, 0)).collect::<BTreeMap<_, _>>(),
            strong_hashes,
        }
    }

    #[test]
    fn reads_blocks_in_order() {
        let db = MemoryDb::new();
        let meta = store_blocks(&db, &[b"abcd", b"efgh", b"ij"]);
        let mut out = String::new();
        BlockFile::new(&db, &meta).read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcdefghij");
    }

    #[test]
    fn repeated_blocks_are_read_each_time() {
        let db = MemoryDb::new();
        let meta = store_blocks(&db, &[b"aaaa", b"bbbb", b"aaaa"]);
        let mut out = Vec::new();
        BlockFile::new(&db, &meta).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"aaaabbbbaaaa");
    }

    #[test]
    fn small_reads_cross_block_boundaries() {
        let db = MemoryDb::new();
        let meta = store_blocks(&db, &[b"abcd", b"efgh"]);
        let mut file = BlockFile::new(&db, &meta);
        let mut buf = [0u8; 3];
        let mut out = Vec::new();
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[test]
    fn missing_block_is_an_error() {
        let db = MemoryDb::new();
        let mut meta = store_blocks(&db, &[b"abcd"]);
        meta.strong_hashes.push(vec![9; 8]);
        let mut out = Vec::new();
        let err = BlockFile::new(&db, &meta).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn retrieve_file_needs_signature() {
        let db = MemoryDb::new();
        assert!(retrieve_file(&db, b"user").unwrap().is_none());
        let meta = store_blocks(&db, &[b"xy"]);
        db.put_extended(b"user", meta).unwrap();
        let mut out = Vec::new();
        retrieve_file(&db, b"user")
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"xy");
    }
}
