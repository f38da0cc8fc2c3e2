//! blocksync protocol reference implementation.
//! Host-driven: the codec, decision engine and peer session do no network I/O;
//! hosts own the sockets and feed frames through `transport`.

pub mod protocol;
pub mod wire;

pub use protocol::{
    Block, Hello, Login, Message, Reply, ReplyCode, RequestBlock, CAPABILITY_LOGIN,
    CAPABILITY_SYNC, CAPABILITY_TOKEN, PROTOCOL_VERSION,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};

pub mod block_file;
pub mod db;
pub mod integrity;
pub mod memory_db;
pub mod metadata;
pub mod session;
pub mod signature;
pub mod sync;
pub mod tls;
pub mod transport;

pub use db::{AuthError, Authenticator, BlockStore, Database, MetadataStore, StoreError};
pub use memory_db::MemoryDb;
pub use metadata::{ExtendedFileMetadata, ShortFileMetadata};
pub use session::{PeerSession, SessionError};
pub use signature::FileWatcher;
pub use sync::{decide, SyncDecision};
pub use transport::{write_message, FrameReader};
