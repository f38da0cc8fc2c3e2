//! Database collaborators: credentials, per-user metadata, content-addressed blocks.
//!
//! Absence is never an error: lookups return `Ok(None)` and the caller decides
//! whether that is expected (first sync) or not.

use crate::metadata::{ExtendedFileMetadata, ShortFileMetadata};

/// Credentials and bearer tokens.
pub trait Authenticator: Send + Sync {
    fn register(&self, user: &[u8], password: &[u8]) -> Result<(), AuthError>;
    fn login(&self, user: &[u8], password: &[u8]) -> Result<(), AuthError>;
    /// Replace the password after checking the old one. Revokes any issued token.
    fn rekey(&self, user: &[u8], old_password: &[u8], new_password: &[u8])
        -> Result<(), AuthError>;
    /// Return the user's token, issuing one if none is valid.
    fn generate_token(&self, user: &[u8], password: &[u8]) -> Result<Vec<u8>, AuthError>;
    fn validate_token(&self, user: &[u8], token: &[u8]) -> Result<(), AuthError>;
}

/// Per-user file metadata.
pub trait MetadataStore: Send + Sync {
    fn retrieve_short(&self, user: &[u8]) -> Result<Option<ShortFileMetadata>, StoreError>;
    fn put_short(&self, user: &[u8], metadata: ShortFileMetadata) -> Result<(), StoreError>;
    fn retrieve_extended(&self, user: &[u8]) -> Result<Option<ExtendedFileMetadata>, StoreError>;
    fn put_extended(&self, user: &[u8], metadata: ExtendedFileMetadata) -> Result<(), StoreError>;
}

/// Blocks keyed by their strong checksum.
pub trait BlockStore: Send + Sync {
    fn has_block(&self, hash: &[u8]) -> bool;
    fn retrieve_block(&self, hash: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put_block(&self, hash: &[u8], block: Vec<u8>) -> Result<(), StoreError>;
}

/// Everything a peer session needs from storage.
pub trait Database: Authenticator + MetadataStore + BlockStore {}

impl<T: Authenticator + MetadataStore + BlockStore> Database for T {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user does not exist")]
    NoSuchUser,
    #[error("wrong password")]
    BadPassword,
    #[error("wrong token for this user")]
    BadToken,
    #[error("cannot hash password: {0}")]
    Hashing(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {0} missing from store")]
    MissingBlock(String),
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}
