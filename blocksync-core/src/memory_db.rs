//! In-memory implementation of every database collaborator.

use std::collections::HashMap;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use parking_lot::RwLock;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::db::{AuthError, Authenticator, BlockStore, MetadataStore, StoreError};
use crate::metadata::{ExtendedFileMetadata, ShortFileMetadata};

pub const TOKEN_SIZE: usize = 20;
const SALT_SIZE: usize = 16;

/// Argon2id hash in PHC string form.
struct Credential {
    phc: String,
}

impl Credential {
    fn new(password: &[u8]) -> Result<Self, AuthError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|e| AuthError::Hashing(e.to_string()))?;
        let phc = Argon2::default()
            .hash_password(password, &salt)
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .to_string();
        Ok(Self { phc })
    }

    fn matches(&self, password: &[u8]) -> bool {
        match PasswordHash::new(&self.phc) {
            Ok(parsed) => Argon2::default()
                .verify_password(password, &parsed)
                .is_ok(),
            Err(e) => {
                warn!(error = %e, "unreadable stored password hash");
                false
            }
        }
    }
}

/// All state lives in maps behind locks; each call is atomic on its own.
#[derive(Default)]
pub struct MemoryDb {
    users: RwLock<HashMap<Vec<u8>, Credential>>,
    tokens: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    short: RwLock<HashMap<Vec<u8>, ShortFileMetadata>>,
    extended: RwLock<HashMap<Vec<u8>, ExtendedFileMetadata>>,
    blocks: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    fn user_exists(&self, user: &[u8]) -> bool {
        self.users.read().contains_key(user)
    }
}

impl Authenticator for MemoryDb {
    fn register(&self, user: &[u8], password: &[u8]) -> Result<(), AuthError> {
        let mut users = self.users.write();
        if users.contains_key(user) {
            return Err(AuthError::AlreadyExists);
        }
        users.insert(user.to_vec(), Credential::new(password)?);
        debug!(user = %String::from_utf8_lossy(user), "user registered");
        Ok(())
    }

    fn login(&self, user: &[u8], password: &[u8]) -> Result<(), AuthError> {
        let users = self.users.read();
        let cred = users.get(user).ok_or(AuthError::NoSuchUser)?;
        if cred.matches(password) {
            Ok(())
        } else {
            Err(AuthError::BadPassword)
        }
    }

    fn rekey(
        &self,
        user: &[u8],
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<(), AuthError> {
        self.login(user, old_password)?;
        let credential = Credential::new(new_password)?;
        self.users.write().insert(user.to_vec(), credential);
        self.tokens.write().remove(user);
        Ok(())
    }

    fn generate_token(&self, user: &[u8], password: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.login(user, password)?;
        let mut tokens = self.tokens.write();
        let token = tokens.entry(user.to_vec()).or_insert_with(|| {
            let mut token = vec![0u8; TOKEN_SIZE];
            rand::thread_rng().fill_bytes(&mut token);
            token
        });
        Ok(token.clone())
    }

    fn validate_token(&self, user: &[u8], token: &[u8]) -> Result<(), AuthError> {
        if !self.user_exists(user) {
            return Err(AuthError::NoSuchUser);
        }
        match self.tokens.read().get(user) {
            Some(t) if bool::from(t.as_slice().ct_eq(token)) => Ok(()),
            _ => Err(AuthError::BadToken),
        }
    }
}

impl MetadataStore for MemoryDb {
    fn retrieve_short(&self, user: &[u8]) -> Result<Option<ShortFileMetadata>, StoreError> {
        Ok(self.short.read().get(user).cloned())
    }

    fn put_short(&self, user: &[u8], metadata: ShortFileMetadata) -> Result<(), StoreError> {
        self.short.write().insert(user.to_vec(), metadata);
        Ok(())
    }

    fn retrieve_extended(&self, user: &[u8]) -> Result<Option<ExtendedFileMetadata>, StoreError> {
        Ok(self.extended.read().get(user).cloned())
    }

    fn put_extended(&self, user: &[u8], metadata: ExtendedFileMetadata) -> Result<(), StoreError> {
        self.extended.write().insert(user.to_vec(), metadata);
        Ok(())
    }
}

impl BlockStore for MemoryDb {
    fn has_block(&self, hash: &[u8]) -> bool {
        self.blocks.read().contains_key(hash)
    }

    fn retrieve_block(&self, hash: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    fn put_block(&self, hash: &[u8], block: Vec<u8>) -> Result<(), StoreError> {
        self.blocks.write().insert(hash.to_vec(), block);
        Ok(())
    }
}
