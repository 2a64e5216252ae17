//! Binary frame codec for protocol messages.
//!
//! Each frame is a big-endian `u32` body length followed by the body. The body
//! starts with a one-byte tag:
//!
//! ```text
//! Tag  Message            Body
//! 1    PublisherRequest   str identifier, str stream_type
//! 2    SubscriberRequest  str identifier, str group, str upstream, u64 window,
//!                         policy, u32 n, n x bytes partition
//! 3    PurgeRequest       str identifier, u64 window
//! 4    BeginWindow        u64 window
//! 5    EndWindow          u64 window
//! 6    Payload            u64 window, bytes partition, bytes payload
//! ```
//!
//! `str` and `bytes` are `u32` length-prefixed. A policy is one byte
//! (0 give-all, 1 least-busy, 2 random-one, 3 round-robin, 4 custom followed by
//! a `str` name).
//!
//! Decoding is zero-copy for payloads: partition keys and payload bytes are
//! slices of the frame buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    Data, DataKind, Message, PolicyType, PublisherRequest, PurgeRequest, SubscriberRequest,
};

/// Default upper bound on a frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

const TAG_PUBLISHER_REQUEST: u8 = 1;
const TAG_SUBSCRIBER_REQUEST: u8 = 2;
const TAG_PURGE_REQUEST: u8 = 3;
const TAG_BEGIN_WINDOW: u8 = 4;
const TAG_END_WINDOW: u8 = 5;
const TAG_PAYLOAD: u8 = 6;

const POLICY_GIVE_ALL: u8 = 0;
const POLICY_LEAST_BUSY: u8 = 1;
const POLICY_RANDOM_ONE: u8 = 2;
const POLICY_ROUND_ROBIN: u8 = 3;
const POLICY_CUSTOM: u8 = 4;

/// Errors raised while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The frame ended before a field was complete.
    #[error("truncated frame")]
    Truncated,

    /// The message tag is not known.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// The policy byte is not known.
    #[error("unknown policy tag: {0}")]
    UnknownPolicy(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// The announced frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Announced body length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The body had bytes left after the message was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Returns the number of bytes [`encode_frame`] writes for `msg`, header included.
#[must_use]
pub fn encoded_len(msg: &Message) -> usize {
    let str_len = |s: &str| 4 + s.len();
    let body = match msg {
        Message::PublisherRequest(req) => str_len(&req.identifier) + str_len(&req.stream_type),
        Message::SubscriberRequest(req) => {
            let policy = match &req.policy {
                PolicyType::Custom(name) => 1 + str_len(name),
                _ => 1,
            };
            str_len(&req.identifier)
                + str_len(&req.group_type)
                + str_len(&req.upstream_identifier)
                + 8
                + policy
                + 4
                + req.partitions.iter().map(|p| 4 + p.len()).sum::<usize>()
        }
        Message::PurgeRequest(req) => str_len(&req.identifier) + 8,
        Message::Data(data) => match &data.kind {
            DataKind::BeginWindow | DataKind::EndWindow => 8,
            DataKind::Payload { partition, bytes } => 8 + 4 + partition.len() + 4 + bytes.len(),
        },
    };
    HEADER_LEN + 1 + body
}

/// Appends one frame holding `msg` to `dst`.
///
/// # Panics
///
/// Panics if a single field is longer than `u32::MAX` bytes.
pub fn encode_frame(msg: &Message, dst: &mut BytesMut) {
    let total = encoded_len(msg);
    dst.reserve(total);
    let body_len = u32::try_from(total - HEADER_LEN).expect("frame body exceeds u32::MAX");
    dst.put_u32(body_len);

    match msg {
        Message::PublisherRequest(req) => {
            dst.put_u8(TAG_PUBLISHER_REQUEST);
            put_str(dst, &req.identifier);
            put_str(dst, &req.stream_type);
        }
        Message::SubscriberRequest(req) => {
            dst.put_u8(TAG_SUBSCRIBER_REQUEST);
            put_str(dst, &req.identifier);
            put_str(dst, &req.group_type);
            put_str(dst, &req.upstream_identifier);
            dst.put_u64(req.window_id);
            match &req.policy {
                PolicyType::GiveAll => dst.put_u8(POLICY_GIVE_ALL),
                PolicyType::LeastBusy => dst.put_u8(POLICY_LEAST_BUSY),
                PolicyType::RandomOne => dst.put_u8(POLICY_RANDOM_ONE),
                PolicyType::RoundRobin => dst.put_u8(POLICY_ROUND_ROBIN),
                PolicyType::Custom(name) => {
                    dst.put_u8(POLICY_CUSTOM);
                    put_str(dst, name);
                }
            }
            put_len(dst, req.partitions.len());
            for partition in &req.partitions {
                put_bytes(dst, partition);
            }
        }
        Message::PurgeRequest(req) => {
            dst.put_u8(TAG_PURGE_REQUEST);
            put_str(dst, &req.identifier);
            dst.put_u64(req.window_id);
        }
        Message::Data(data) => match &data.kind {
            DataKind::BeginWindow => {
                dst.put_u8(TAG_BEGIN_WINDOW);
                dst.put_u64(data.window_id);
            }
            DataKind::EndWindow => {
                dst.put_u8(TAG_END_WINDOW);
                dst.put_u64(data.window_id);
            }
            DataKind::Payload { partition, bytes } => {
                dst.put_u8(TAG_PAYLOAD);
                dst.put_u64(data.window_id);
                put_bytes(dst, partition);
                put_bytes(dst, bytes);
            }
        },
    }
}

/// Decodes one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
/// buffer is left untouched in that case so the caller can read more bytes
/// and retry.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] as soon as the header announces a
/// body longer than `max_frame_len`, and any other [`CodecError`] if the body
/// is malformed.
pub fn decode_frame(src: &mut BytesMut, max_frame_len: usize) -> Result<Option<Message>, CodecError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max_frame_len {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let body = src.split_to(len).freeze();
    decode_body(body).map(Some)
}

fn decode_body(mut body: Bytes) -> Result<Message, CodecError> {
    let tag = get_u8(&mut body)?;
    let msg = match tag {
        TAG_PUBLISHER_REQUEST => Message::PublisherRequest(PublisherRequest {
            identifier: get_string(&mut body)?,
            stream_type: get_string(&mut body)?,
        }),
        TAG_SUBSCRIBER_REQUEST => {
            let identifier = get_string(&mut body)?;
            let group_type = get_string(&mut body)?;
            let upstream_identifier = get_string(&mut body)?;
            let window_id = get_u64(&mut body)?;
            let policy = match get_u8(&mut body)? {
                POLICY_GIVE_ALL => PolicyType::GiveAll,
                POLICY_LEAST_BUSY => PolicyType::LeastBusy,
                POLICY_RANDOM_ONE => PolicyType::RandomOne,
                POLICY_ROUND_ROBIN => PolicyType::RoundRobin,
                POLICY_CUSTOM => PolicyType::Custom(get_string(&mut body)?),
                other => return Err(CodecError::UnknownPolicy(other)),
            };
            let count = get_u32(&mut body)? as usize;
            // Each partition needs at least its length prefix.
            if count > body.remaining() / 4 {
                return Err(CodecError::Truncated);
            }
            let mut partitions = Vec::with_capacity(count);
            for _ in 0..count {
                partitions.push(get_bytes(&mut body)?);
            }
            Message::SubscriberRequest(SubscriberRequest {
                identifier,
                group_type,
                upstream_identifier,
                window_id,
                policy,
                partitions,
            })
        }
        TAG_PURGE_REQUEST => Message::PurgeRequest(PurgeRequest {
            identifier: get_string(&mut body)?,
            window_id: get_u64(&mut body)?,
        }),
        TAG_BEGIN_WINDOW => Message::Data(Data::begin_window(get_u64(&mut body)?)),
        TAG_END_WINDOW => Message::Data(Data::end_window(get_u64(&mut body)?)),
        TAG_PAYLOAD => {
            let window_id = get_u64(&mut body)?;
            let partition = get_bytes(&mut body)?;
            let bytes = get_bytes(&mut body)?;
            Message::Data(Data {
                window_id,
                kind: DataKind::Payload { partition, bytes },
            })
        }
        other => return Err(CodecError::UnknownTag(other)),
    };

    if body.has_remaining() {
        return Err(CodecError::TrailingBytes(body.remaining()));
    }
    Ok(msg)
}

fn put_len(dst: &mut BytesMut, len: usize) {
    dst.put_u32(u32::try_from(len).expect("field exceeds u32::MAX"));
}

fn put_str(dst: &mut BytesMut, s: &str) {
    put_bytes(dst, s.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    put_len(dst, b.len());
    dst.put_slice(b);
}

fn get_u8(src: &mut Bytes) -> Result<u8, CodecError> {
    if src.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_u8())
}

fn get_u32(src: &mut Bytes) -> Result<u32, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> Result<u64, CodecError> {
    if src.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_u64())
}

fn get_bytes(src: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(src.split_to(len))
}

fn get_string(src: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes(src)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}
