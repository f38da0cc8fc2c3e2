//! blocksync wire protocol: message types, type tags, version and capabilities.

use std::fmt;

use crate::metadata::{ExtendedFileMetadata, ShortFileMetadata};

/// Current protocol version. Sent in Hello.
pub const PROTOCOL_VERSION: u16 = 0;

/// Capability values as they appear on the wire. LOGIN is zero and therefore implied.
pub const CAPABILITY_LOGIN: u16 = 0;
pub const CAPABILITY_SYNC: u16 = 1;
pub const CAPABILITY_TOKEN: u16 = 2;

/// Frame type tags (first two bytes of every frame header).
pub mod kind {
    pub const REPLY: u16 = 0;
    pub const HELLO: u16 = 1;
    pub const LOGIN: u16 = 2;
    pub const SHORT_FILE_METADATA: u16 = 3;
    pub const EXTENDED_FILE_METADATA: u16 = 4;
    pub const REQUEST_BLOCK: u16 = 5;
    pub const BLOCK: u16 = 6;
}

/// First message of a session: protocol version and capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub capabilities: u16,
}

impl Hello {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            capabilities: CAPABILITY_LOGIN | CAPABILITY_SYNC | CAPABILITY_TOKEN,
        }
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

/// Username and password, each carried with a 16-bit length prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Login {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl Login {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Status codes carried in a Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    AuthFailed,
    NotAuthenticated,
    /// Server accepted new short metadata and wants the block signature.
    SendExtendedMetadata,
    /// Client reported an older, divergent version.
    Stale,
    SyncComplete,
    ReconstructionFailed,
    Other(u16),
}

impl ReplyCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ReplyCode::Ok => 0,
            ReplyCode::AuthFailed => 1,
            ReplyCode::NotAuthenticated => 2,
            ReplyCode::SendExtendedMetadata => 3,
            ReplyCode::Stale => 4,
            ReplyCode::SyncComplete => 5,
            ReplyCode::ReconstructionFailed => 6,
            ReplyCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            0 => ReplyCode::Ok,
            1 => ReplyCode::AuthFailed,
            2 => ReplyCode::NotAuthenticated,
            3 => ReplyCode::SendExtendedMetadata,
            4 => ReplyCode::Stale,
            5 => ReplyCode::SyncComplete,
            6 => ReplyCode::ReconstructionFailed,
            other => ReplyCode::Other(other),
        }
    }
}

/// Error/ack signaling: a code plus a free-form message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub message: Vec<u8>,
}

impl Reply {
    pub fn new(code: ReplyCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into().into_bytes(),
        }
    }

    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

/// Ask the peer for one block by its strong checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBlock {
    pub checksum: Vec<u8>,
}

/// One block of file content, identified by its strong checksum.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    pub checksum: Vec<u8>,
    pub data: Vec<u8>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("checksum", &hex::encode(&self.checksum))
            .field("len", &self.data.len())
            .finish()
    }
}

/// All wire message types. Framing is type + length prefix (see wire module).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Reply(Reply),
    Hello(Hello),
    Login(Login),
    ShortMetadata(ShortFileMetadata),
    ExtendedMetadata(ExtendedFileMetadata),
    RequestBlock(RequestBlock),
    Block(Block),
    /// A frame with a type tag this version does not know. Receivers discard it.
    Unrecognized { kind: u16, payload: Vec<u8> },
}

impl Message {
    /// Type tag written into the frame header.
    pub fn kind(&self) -> u16 {
        match self {
            Message::Reply(_) => kind::REPLY,
            Message::Hello(_) => kind::HELLO,
            Message::Login(_) => kind::LOGIN,
            Message::ShortMetadata(_) => kind::SHORT_FILE_METADATA,
            Message::ExtendedMetadata(_) => kind::EXTENDED_FILE_METADATA,
            Message::RequestBlock(_) => kind::REQUEST_BLOCK,
            Message::Block(_) => kind::BLOCK,
            Message::Unrecognized { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Reply(_) => "reply",
            Message::Hello(_) => "hello",
            Message::Login(_) => "login",
            Message::ShortMetadata(_) => "short_metadata",
            Message::ExtendedMetadata(_) => "extended_metadata",
            Message::RequestBlock(_) => "request_block",
            Message::Block(_) => "block",
            Message::Unrecognized { .. } => "unrecognized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hello_advertises_all_capabilities() {
        let hello = Hello::new();
        assert_eq!(hello.version, 0);
        assert_eq!(hello.capabilities, 3);
    }

    #[test]
    fn reply_codes_map_both_ways() {
        for code in 0u16..10 {
            assert_eq!(ReplyCode::from_u16(code).as_u16(), code);
        }
        assert_eq!(ReplyCode::from_u16(42), ReplyCode::Other(42));
    }

    #[test]
    fn login_debug_hides_password() {
        let login = Login::new("user", "hunter2");
        let shown = format!("{:?}", login);
        assert!(shown.contains("user"));
        assert!(!shown.contains("hunter2"));
    }
}
