//! On-disk layout of a queue log.
//!
//! ```text
//! file   := header record*
//! header := pending_offset:i64 version:i32                      (12 bytes)
//! record := create_time:i64 dequeue_time:i64 ack_deadline:i64
//!           id:[u8; 16] header_len:u32 body_len:u32             (48 bytes)
//!           header_bytes body_bytes
//! ```
//!
//! All integers are little-endian. `dequeue_time == 0` marks a pending
//! record; a dequeued record with `ack_deadline == 0` has been acked.

use bytes::{Buf, BufMut};
use uuid::Uuid;

pub const FILE_HEADER_SIZE: u64 = 12;
pub const RECORD_HEADER_SIZE: u64 = 48;
pub const FORMAT_VERSION: i32 = 1;

const DEQUEUE_TIME_FIELD: u64 = 8;
const ACK_DEADLINE_FIELD: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub pending_offset: u64,
    pub version: i32,
}

impl FileHeader {
    pub fn new(pending_offset: u64) -> Self {
        Self {
            pending_offset,
            version: FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut out = [0u8; FILE_HEADER_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_i64_le(self.pending_offset as i64);
        buf.put_i32_le(self.version);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Self {
        let pending_offset = buf.get_i64_le().max(0) as u64;
        let version = buf.get_i32_le();
        Self {
            pending_offset,
            version,
        }
    }
}

/// Fixed-size prefix of a stored message, plus the file offset it lives at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub offset: u64,
    pub create_time: i64,
    pub dequeue_time: i64,
    pub ack_deadline: i64,
    pub id: Uuid,
    pub header_len: u32,
    pub body_len: u32,
}

impl RecordHeader {
    pub fn pending(offset: u64, id: Uuid, create_time: i64, header_len: u32, body_len: u32) -> Self {
        Self {
            offset,
            create_time,
            dequeue_time: 0,
            ack_deadline: 0,
            id,
            header_len,
            body_len,
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.header_len as u64 + self.body_len as u64
    }

    pub fn total_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    pub fn payload_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_SIZE
    }

    /// Offset of the `dequeue_time` field; `ack_deadline` follows it directly.
    pub fn dequeue_time_offset(&self) -> u64 {
        self.offset + DEQUEUE_TIME_FIELD
    }

    pub fn ack_deadline_offset(&self) -> u64 {
        self.offset + ACK_DEADLINE_FIELD
    }

    pub fn is_pending(&self) -> bool {
        self.dequeue_time == 0
    }

    pub fn is_acked(&self) -> bool {
        self.dequeue_time > 0 && self.ack_deadline == 0
    }

    pub fn is_leased(&self) -> bool {
        self.dequeue_time > 0 && self.ack_deadline > 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.create_time);
        buf.put_i64_le(self.dequeue_time);
        buf.put_i64_le(self.ack_deadline);
        buf.put_slice(self.id.as_bytes());
        buf.put_u32_le(self.header_len);
        buf.put_u32_le(self.body_len);
    }

    pub fn decode(offset: u64, mut buf: &[u8]) -> Self {
        let create_time = buf.get_i64_le();
        let dequeue_time = buf.get_i64_le();
        let ack_deadline = buf.get_i64_le();
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let header_len = buf.get_u32_le();
        let body_len = buf.get_u32_le();
        Self {
            offset,
            create_time,
            dequeue_time,
            ack_deadline,
            id: Uuid::from_bytes(id),
            header_len,
            body_len,
        }
    }
}
