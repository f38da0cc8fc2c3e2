//! Integrity: whole-file content hash, per-block strong checksum, certificate fingerprints.

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use sha3::Sha3_256;

/// Length of a whole-file content hash and the upper bound for strong checksums.
pub const HASH_LEN: usize = 32;

/// Hash a complete file (or any byte stream) without loading it into memory.
pub fn content_hash_reader<R: Read>(mut reader: R) -> io::Result<[u8; HASH_LEN]> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

pub fn content_hash(data: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(data).into()
}

/// Strong checksum of one block: SHA-256 truncated to `len` bytes (at most 32).
pub fn strong_hash(block: &[u8], len: usize) -> Vec<u8> {
    let digest = Sha256::digest(block);
    digest[..len.min(HASH_LEN)].to_vec()
}

/// Verify block data against the checksum it claims to have.
pub fn verify_block(data: &[u8], checksum: &[u8]) -> bool {
    !checksum.is_empty() && checksum.len() <= HASH_LEN && strong_hash(data, checksum.len()) == checksum
}

/// SHA3-256 fingerprint of a DER-encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha3_256::digest(der).into()
}

/// Parse a hex fingerprint as configured on the client.
pub fn parse_fingerprint(s: &str) -> Result<[u8; 32], FingerprintError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FingerprintError::Missing);
    }
    let bytes = hex::decode(s).map_err(|_| FingerprintError::NotHex)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| FingerprintError::Length(b.len()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("no server fingerprint configured")]
    Missing,
    #[error("fingerprint is not valid hex")]
    NotHex,
    #[error("fingerprint is {0} bytes, expected 32")]
    Length(usize),
}
