//! Framing: 2 bytes BE type + 8 bytes BE length + payload.
//! Every payload is a fixed big-endian record; each variable-length field is
//! preceded by its length.

use std::collections::BTreeMap;

use crate::metadata::{self, ExtendedFileMetadata, MetadataError, ShortFileMetadata};
use crate::protocol::{kind, Block, Hello, Login, Message, Reply, ReplyCode, RequestBlock};

pub const HEADER_SIZE: usize = 10;
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024; // 64 MiB

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u16,
    pub length: u64,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let kind = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[2..HEADER_SIZE]);
        Self {
            kind,
            length: u64::from_be_bytes(len),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..2].copy_from_slice(&self.kind.to_be_bytes());
        out[2..].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// Encode a message into a single frame: header + payload. The header's
/// length is always the payload's byte length.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_payload(msg)?;
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let header = FrameHeader {
        kind: msg.kind(),
        length: len,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode only the type-specific payload of a message.
pub fn encode_payload(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::new();
    match msg {
        Message::Reply(reply) => {
            out.extend_from_slice(&reply.code.as_u16().to_be_bytes());
            put_bytes_u64(&mut out, &reply.message);
        }
        Message::Hello(hello) => {
            out.extend_from_slice(&hello.version.to_be_bytes());
            out.extend_from_slice(&hello.capabilities.to_be_bytes());
        }
        Message::Login(login) => {
            put_bytes_u16(&mut out, &login.username, "username")?;
            put_bytes_u16(&mut out, &login.password, "password")?;
        }
        Message::ShortMetadata(meta) => {
            out.extend_from_slice(&meta.file_size.to_be_bytes());
            put_bytes_u64(&mut out, &meta.file_hash);
            put_bytes_u64(&mut out, meta.timestamp_string().as_bytes());
        }
        Message::ExtendedMetadata(meta) => {
            meta.validate()?;
            let entries = meta.block_count as usize;
            out.reserve(24 + entries * (12 + meta.strong_len as usize));
            out.extend_from_slice(&meta.file_size.to_be_bytes());
            out.extend_from_slice(&meta.strong_len.to_be_bytes());
            out.extend_from_slice(&meta.block_len.to_be_bytes());
            out.extend_from_slice(&meta.block_count.to_be_bytes());
            for (index, weak) in &meta.weak_hashes {
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&weak.to_be_bytes());
            }
            for strong in &meta.strong_hashes {
                out.extend_from_slice(strong);
            }
        }
        Message::RequestBlock(req) => {
            put_bytes_u32(&mut out, &req.checksum, "checksum")?;
        }
        Message::Block(block) => {
            put_bytes_u32(&mut out, &block.checksum, "checksum")?;
            put_bytes_u64(&mut out, &block.data);
        }
        Message::Unrecognized { payload, .. } => {
            out.extend_from_slice(payload);
        }
    }
    Ok(out)
}

fn put_bytes_u16(
    out: &mut Vec<u8>,
    bytes: &[u8],
    field: &'static str,
) -> Result<(), FrameEncodeError> {
    let len = u16::try_from(bytes.len()).map_err(|_| FrameEncodeError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes_u32(
    out: &mut Vec<u8>,
    bytes: &[u8],
    field: &'static str,
) -> Result<(), FrameEncodeError> {
    let len = u32::try_from(bytes.len()).map_err(|_| FrameEncodeError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes_u64(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("{0} does not fit its length prefix")]
    FieldTooLong(&'static str),
    #[error("inconsistent metadata: {0}")]
    Inconsistent(#[from] MetadataError),
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FrameHeader::parse(&head);
    if header.length > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let end = HEADER_SIZE + header.length as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_message(header.kind, &bytes[HEADER_SIZE..end])?;
    Ok((msg, end))
}

/// Decode a complete payload of the given type. Unknown types decode to
/// `Message::Unrecognized`.
pub fn decode_message(kind: u16, payload: &[u8]) -> Result<Message, FrameDecodeError> {
    let mut r = PayloadReader::new(payload);
    let msg = match kind {
        kind::REPLY => {
            let code = ReplyCode::from_u16(r.u16("code")?);
            let len = r.u64("message_len")?;
            let message = r.bytes(len, "message")?.to_vec();
            Message::Reply(Reply { code, message })
        }
        kind::HELLO => Message::Hello(Hello {
            version: r.u16("version")?,
            capabilities: r.u16("capabilities")?,
        }),
        kind::LOGIN => {
            let len = r.u16("username_len")?;
            let username = r.bytes(u64::from(len), "username")?.to_vec();
            let len = r.u16("password_len")?;
            let password = r.bytes(u64::from(len), "password")?.to_vec();
            Message::Login(Login { username, password })
        }
        kind::SHORT_FILE_METADATA => {
            let file_size = r.u64("file_size")?;
            let len = r.u64("hash_len")?;
            let file_hash = r.bytes(len, "hash")?.to_vec();
            let len = r.u64("timestamp_len")?;
            let raw = r.bytes(len, "timestamp")?;
            let last_changed = std::str::from_utf8(raw)
                .ok()
                .and_then(metadata::parse_timestamp)
                .ok_or(FrameDecodeError::InvalidTimestamp)?;
            Message::ShortMetadata(ShortFileMetadata {
                file_size,
                file_hash,
                last_changed,
            })
        }
        kind::EXTENDED_FILE_METADATA => Message::ExtendedMetadata(decode_extended(&mut r)?),
        kind::REQUEST_BLOCK => {
            let len = r.u32("checksum_len")?;
            let checksum = r.bytes(u64::from(len), "checksum")?.to_vec();
            Message::RequestBlock(RequestBlock { checksum })
        }
        kind::BLOCK => {
            let len = r.u32("checksum_len")?;
            let checksum = r.bytes(u64::from(len), "checksum")?.to_vec();
            let len = r.u64("data_len")?;
            let data = r.bytes(len, "data")?.to_vec();
            Message::Block(Block { checksum, data })
        }
        other => {
            return Ok(Message::Unrecognized {
                kind: other,
                payload: payload.to_vec(),
            })
        }
    };
    r.finish()?;
    Ok(msg)
}

fn decode_extended(r: &mut PayloadReader<'_>) -> Result<ExtendedFileMetadata, FrameDecodeError> {
    let file_size = r.u64("file_size")?;
    let strong_len = r.u32("strong_len")?;
    let block_len = r.u32("block_len")?;
    let block_count = r.u64("block_count")?;

    // Reject counts the payload cannot hold before allocating anything.
    let needed = block_count
        .checked_mul(12 + u64::from(strong_len))
        .ok_or(FrameDecodeError::Malformed {
            field: "block_count",
        })?;
    if needed > r.remaining() as u64 {
        return Err(FrameDecodeError::Malformed {
            field: "block_count",
        });
    }

    let mut weak_hashes = BTreeMap::new();
    for _ in 0..block_count {
        let index = r.u32("weak_key")?;
        let weak = r.u64("weak_value")? as i64;
        weak_hashes.insert(index, weak);
    }
    let mut strong_hashes = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        strong_hashes.push(r.bytes(u64::from(strong_len), "strong_hash")?.to_vec());
    }
    let meta = ExtendedFileMetadata {
        file_size,
        strong_len,
        block_len,
        block_count,
        weak_hashes,
        strong_hashes,
    };
    // Duplicate weak keys shrink the map below block_count.
    meta.validate()?;
    Ok(meta)
}

/// Bounds-checked big-endian reader over one payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: u64, field: &'static str) -> Result<&'a [u8], FrameDecodeError> {
        if len > self.remaining() as u64 {
            return Err(FrameDecodeError::Malformed { field });
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.buf[start..self.pos])
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], FrameDecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N as u64, field)?);
        Ok(out)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FrameDecodeError> {
        self.array(field).map(u16::from_be_bytes)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FrameDecodeError> {
        self.array(field).map(u32::from_be_bytes)
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, FrameDecodeError> {
        self.array(field).map(u64::from_be_bytes)
    }

    fn finish(&self) -> Result<(), FrameDecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(FrameDecodeError::Trailing(n)),
        }
    }
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed frame: {field} exceeds the available payload")]
    Malformed { field: &'static str },
    #[error("malformed frame: {0} trailing bytes")]
    Trailing(usize),
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("inconsistent metadata: {0}")]
    Inconsistent(#[from] MetadataError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::{Rng, RngCore};

    fn random_bytes(rng: &mut impl Rng, max: usize) -> Vec<u8> {
        let len = rng.gen_range(0..=max);
        let mut out = vec![0u8; len];
        rng.fill_bytes(&mut out);
        out
    }

    fn random_short(rng: &mut impl Rng) -> ShortFileMetadata {
        ShortFileMetadata {
            file_size: rng.gen(),
            file_hash: random_bytes(rng, 40),
            last_changed: Utc
                .timestamp_opt(rng.gen_range(0..4_000_000_000), rng.gen_range(0..1_000_000_000))
                .unwrap(),
        }
    }

    fn random_extended(rng: &mut impl Rng) -> ExtendedFileMetadata {
        let strong_len = rng.gen_range(0..33u32);
        let block_count = rng.gen_range(0..20u64);
        ExtendedFileMetadata {
            file_size: rng.gen(),
            strong_len,
            block_len: rng.gen(),
            block_count,
            weak_hashes: (0..block_count as u32).map(|i| (i, rng.gen())).collect(),
            strong_hashes: (0..block_count)
                .map(|_| {
                    let mut h = vec![0u8; strong_len as usize];
                    rng.fill_bytes(&mut h);
                    h
                })
                .collect(),
        }
    }

    fn random_messages(rng: &mut impl Rng) -> Vec<Message> {
        vec![
            Message::Reply(Reply {
                code: ReplyCode::from_u16(rng.gen()),
                message: random_bytes(rng, 64),
            }),
            Message::Hello(Hello {
                version: rng.gen(),
                capabilities: rng.gen(),
            }),
            Message::Login(Login::new(random_bytes(rng, 32), random_bytes(rng, 32))),
            Message::ShortMetadata(random_short(rng)),
            Message::ExtendedMetadata(random_extended(rng)),
            Message::RequestBlock(RequestBlock {
                checksum: random_bytes(rng, 32),
            }),
            Message::Block(Block {
                checksum: random_bytes(rng, 32),
                data: random_bytes(rng, 512),
            }),
        ]
    }

    #[test]
    fn random_messages_survive_the_wire() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            for msg in random_messages(&mut rng) {
                let frame = encode_frame(&msg).unwrap();
                let (decoded, n) = decode_frame(&frame).unwrap();
                assert_eq!(n, frame.len());
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn header_length_matches_payload() {
        let mut rng = rand::thread_rng();
        for msg in random_messages(&mut rng) {
            let payload = encode_payload(&msg).unwrap();
            let frame = encode_frame(&msg).unwrap();
            let mut head = [0u8; HEADER_SIZE];
            head.copy_from_slice(&frame[..HEADER_SIZE]);
            let header = FrameHeader::parse(&head);
            assert_eq!(header.kind, msg.kind());
            assert_eq!(header.length, payload.len() as u64);
            assert_eq!(&frame[HEADER_SIZE..], payload.as_slice());
        }
    }

    #[test]
    fn empty_fields_are_allowed() {
        let login = Message::Login(Login::new(Vec::new(), Vec::new()));
        let frame = encode_frame(&login).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 4);
        assert_eq!(decode_frame(&frame).unwrap().0, login);
    }

    #[test]
    fn hello_layout() {
        let frame = encode_frame(&Message::Hello(Hello::new())).unwrap();
        assert_eq!(frame, vec![0, 1, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 3]);
    }

    #[test]
    fn login_layout() {
        let payload = encode_payload(&Message::Login(Login::new("ab", "xyz"))).unwrap();
        assert_eq!(payload, vec![0, 2, b'a', b'b', 0, 3, b'x', b'y', b'z']);
    }

    #[test]
    fn zero_block_signature_roundtrip() {
        let meta = ExtendedFileMetadata {
            file_size: 0,
            strong_len: 16,
            block_len: 10 * 1024,
            block_count: 0,
            ..Default::default()
        };
        let payload = encode_payload(&Message::ExtendedMetadata(meta.clone())).unwrap();
        assert_eq!(payload.len(), 24);
        match decode_message(kind::EXTENDED_FILE_METADATA, &payload).unwrap() {
            Message::ExtendedMetadata(decoded) => {
                assert!(decoded.weak_hashes.is_empty());
                assert!(decoded.strong_hashes.is_empty());
                assert_eq!(decoded, meta);
            }
            other => panic!("expected extended metadata, got {:?}", other),
        }
    }

    #[test]
    fn inconsistent_signature_is_not_encoded() {
        let meta = ExtendedFileMetadata {
            strong_len: 2,
            block_count: 1,
            weak_hashes: [(0, 7)].into_iter().collect(),
            ..Default::default()
        };
        assert!(matches!(
            encode_frame(&Message::ExtendedMetadata(meta)),
            Err(FrameEncodeError::Inconsistent(_))
        ));
    }

    #[test]
    fn duplicate_weak_keys_are_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u64.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(&2u64.to_be_bytes());
        for _ in 0..2 {
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(&9u64.to_be_bytes());
        }
        payload.extend_from_slice(&[1, 2]);
        assert!(matches!(
            decode_message(kind::EXTENDED_FILE_METADATA, &payload),
            Err(FrameDecodeError::Inconsistent(_))
        ));
    }

    #[test]
    fn huge_block_count_is_malformed() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&16u32.to_be_bytes());
        payload.extend_from_slice(&1024u32.to_be_bytes());
        payload.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            decode_message(kind::EXTENDED_FILE_METADATA, &payload),
            Err(FrameDecodeError::Malformed {
                field: "block_count"
            })
        ));
    }

    #[test]
    fn declared_length_beyond_payload_is_malformed() {
        // username claims 10 bytes, only 3 follow
        let payload = vec![0, 10, b'a', b'b', b'c'];
        assert!(matches!(
            decode_message(kind::LOGIN, &payload),
            Err(FrameDecodeError::Malformed { field: "username" })
        ));
        // block data claims more than present
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.push(0xaa);
        payload.extend_from_slice(&100u64.to_be_bytes());
        payload.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode_message(kind::BLOCK, &payload),
            Err(FrameDecodeError::Malformed { field: "data" })
        ));
    }

    #[test]
    fn truncated_fixed_fields_are_malformed() {
        assert!(matches!(
            decode_message(kind::HELLO, &[0, 0, 0]),
            Err(FrameDecodeError::Malformed {
                field: "capabilities"
            })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            decode_message(kind::HELLO, &[0, 0, 0, 3, 9]),
            Err(FrameDecodeError::Trailing(1))
        ));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&5u64.to_be_bytes());
        payload.extend_from_slice(b"later");
        assert!(matches!(
            decode_message(kind::SHORT_FILE_METADATA, &payload),
            Err(FrameDecodeError::InvalidTimestamp)
        ));
    }

    #[test]
    fn unknown_kind_is_unrecognized() {
        let msg = decode_message(99, &[1, 2, 3]).unwrap();
        assert_eq!(
            msg,
            Message::Unrecognized {
                kind: 99,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&Message::Hello(Hello::new())).unwrap();
        assert!(matches!(
            decode_frame(&frame[..4]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..HEADER_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = FrameHeader {
            kind: kind::BLOCK,
            length: MAX_FRAME_LEN + 1,
        };
        assert!(matches!(
            decode_frame(&header.to_bytes()),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = Message::Hello(Hello::new());
        let b = Message::RequestBlock(RequestBlock {
            checksum: vec![7; 16],
        });
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }
}
