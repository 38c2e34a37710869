//! Metadata record codec.
//!
//! Container metadata files are a flat sequence of frames:
//!
//! ```text
//! +----------------+---------+----------------------+-------------+
//! | length:uvarint | kind:u8 | payload[length - 1]  | crc32c:u32  |
//! +----------------+---------+----------------------+-------------+
//! ```
//!
//! `length` counts the kind byte plus the payload. The CRC-32C covers the
//! kind byte and the payload. Payload fields are big-endian:
//!
//! ```text
//! create := block_id:u64 offset:u64 length:u64 ts_micros:u64
//! delete := block_id:u64 ts_micros:u64
//! ```
//!
//! A frame cut short by a crash mid-append is reported as `Truncated` and is
//! the only recoverable decode error; everything else that fails to parse is
//! `Error::Corruption`.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::block::BlockId;
use crate::errcorrupt;
use crate::error::Result;

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const KIND_CREATE: u8 = 1;
const KIND_DELETE: u8 = 2;

const CREATE_PAYLOAD_LEN: usize = 32;
const DELETE_PAYLOAD_LEN: usize = 16;

/// Upper bound on a frame's declared length. Real frames are tens of bytes;
/// anything claiming more is garbage rather than a torn append.
const MAX_FRAME_LEN: u64 = 4096;

/// A single entry in a container's metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRecord {
    Create {
        id: BlockId,
        offset: u64,
        length: u64,
        timestamp_micros: u64,
    },
    Delete {
        id: BlockId,
        timestamp_micros: u64,
    },
}

impl BlockRecord {
    pub fn id(&self) -> BlockId {
        match self {
            BlockRecord::Create { id, .. } => *id,
            BlockRecord::Delete { id, .. } => *id,
        }
    }

    /// Serializes the record as a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + CREATE_PAYLOAD_LEN);
        match self {
            BlockRecord::Create {
                id,
                offset,
                length,
                timestamp_micros,
            } => {
                body.push(KIND_CREATE);
                put_u64(&mut body, id.raw());
                put_u64(&mut body, *offset);
                put_u64(&mut body, *length);
                put_u64(&mut body, *timestamp_micros);
            }
            BlockRecord::Delete {
                id,
                timestamp_micros,
            } => {
                body.push(KIND_DELETE);
                put_u64(&mut body, id.raw());
                put_u64(&mut body, *timestamp_micros);
            }
        }

        let mut frame = Vec::with_capacity(body.len() + 8);
        write_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        let mut crc_buf = [0u8; 4];
        BigEndian::write_u32(&mut crc_buf, CRC32C.checksum(&body));
        frame.extend_from_slice(&crc_buf);
        frame
    }
}

/// Outcome of decoding one frame from `buf` at a given offset.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; `next` is the offset just past it.
    Record { record: BlockRecord, next: usize },
    /// The offset is exactly the end of the buffer.
    Eof,
    /// The buffer ends inside a frame: a torn append from a crash.
    Truncated,
}

/// Decodes the frame starting at `offset`. Interior damage (checksum
/// mismatch, unknown kind, malformed payload) is `Error::Corruption`.
pub fn decode_record(buf: &[u8], offset: usize) -> Result<Decoded> {
    if offset == buf.len() {
        return Ok(Decoded::Eof);
    }

    let (body_len, varint_len) = match read_uvarint(&buf[offset..])? {
        Some(v) => v,
        None => return Ok(Decoded::Truncated),
    };
    if body_len == 0 {
        return Err(errcorrupt!("record frame at offset {offset} has zero length"));
    }
    if body_len > MAX_FRAME_LEN {
        return Err(errcorrupt!(
            "record frame at offset {offset} claims implausible length {body_len}"
        ));
    }

    let body_start = offset + varint_len;
    let body_end = body_start + body_len as usize;
    let frame_end = body_end + 4;
    if frame_end > buf.len() {
        return Ok(Decoded::Truncated);
    }

    let body = &buf[body_start..body_end];
    let stored_crc = BigEndian::read_u32(&buf[body_end..frame_end]);
    let computed_crc = CRC32C.checksum(body);
    if stored_crc != computed_crc {
        return Err(errcorrupt!(
            "record frame at offset {offset} checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        ));
    }

    let kind = body[0];
    let payload = &body[1..];
    let record = match kind {
        KIND_CREATE => {
            if payload.len() != CREATE_PAYLOAD_LEN {
                return Err(errcorrupt!(
                    "create record at offset {offset} has payload length {}",
                    payload.len()
                ));
            }
            BlockRecord::Create {
                id: BlockId::new(BigEndian::read_u64(&payload[0..8])),
                offset: BigEndian::read_u64(&payload[8..16]),
                length: BigEndian::read_u64(&payload[16..24]),
                timestamp_micros: BigEndian::read_u64(&payload[24..32]),
            }
        }
        KIND_DELETE => {
            if payload.len() != DELETE_PAYLOAD_LEN {
                return Err(errcorrupt!(
                    "delete record at offset {offset} has payload length {}",
                    payload.len()
                ));
            }
            BlockRecord::Delete {
                id: BlockId::new(BigEndian::read_u64(&payload[0..8])),
                timestamp_micros: BigEndian::read_u64(&payload[8..16]),
            }
        }
        other => {
            return Err(errcorrupt!(
                "record frame at offset {offset} has unknown kind {other}"
            ))
        }
    };

    Ok(Decoded::Record {
        record,
        next: frame_end,
    })
}

/// Microseconds since the Unix epoch, for record timestamps.
pub fn timestamp_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    let mut tmp = [0u8; 8];
    BigEndian::write_u64(&mut tmp, value);
    buf.extend_from_slice(&tmp);
}

fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a uvarint from the front of `buf`. Returns `None` when the buffer
/// ends while the continuation bit is still set (a torn write).
fn read_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(errcorrupt!("uvarint longer than 10 bytes"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
