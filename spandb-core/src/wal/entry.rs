//! WAL record framing

use crate::{Result, SpanError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Smallest possible framed record: length, id length, times, object length, checksum
const MIN_RECORD_LEN: usize = 4 + 2 + 8 + 8 + 4 + 4;

/// A single object appended to a WAL file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Object ID
    pub id: Vec<u8>,
    /// Start time in unix seconds, after slack clamping
    pub start: i64,
    /// End time in unix seconds, after slack clamping
    pub end: i64,
    /// Object bytes, compressed with the WAL encoding
    pub object: Vec<u8>,
}

impl WalEntry {
    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: record length (excluding this field)
    /// - 2 bytes: id length
    /// - N bytes: id
    /// - 8 bytes: start
    /// - 8 bytes: end
    /// - 4 bytes: object length
    /// - N bytes: object
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let id_len = u16::try_from(self.id.len())
            .map_err(|_| SpanError::Validation(format!("id too long: {} bytes", self.id.len())))?;
        let obj_len = u32::try_from(self.object.len())
            .map_err(|_| SpanError::Capacity(format!("object too large: {} bytes", self.object.len())))?;

        let mut buf = BytesMut::with_capacity(MIN_RECORD_LEN + self.id.len() + self.object.len());

        // Reserve space for length prefix
        buf.put_u32_le(0);

        buf.put_u16_le(id_len);
        buf.put_slice(&self.id);
        buf.put_i64_le(self.start);
        buf.put_i64_le(self.end);
        buf.put_u32_le(obj_len);
        buf.put_slice(&self.object);

        // Checksum covers everything after the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        Ok(buf.freeze())
    }

    /// Deserialize an entry from bytes, validating the checksum.
    /// Returns the entry and the number of bytes consumed.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(SpanError::InvalidFormat("Entry too short".into()));
        }

        let len = (&data[..4]).get_u32_le() as usize;
        if len < MIN_RECORD_LEN - 4 {
            return Err(SpanError::Corruption(format!("Invalid record length {}", len)));
        }
        if data.len() < 4 + len {
            return Err(SpanError::InvalidFormat("Incomplete entry".into()));
        }

        let body = &data[4..4 + len - 4];
        let expected = (&data[4 + len - 4..4 + len]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SpanError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let id_len = cursor.get_u16_le() as usize;
        if cursor.remaining() < id_len + 8 + 8 + 4 {
            return Err(SpanError::Corruption("Truncated record header".into()));
        }
        let id = cursor[..id_len].to_vec();
        cursor.advance(id_len);

        let start = cursor.get_i64_le();
        let end = cursor.get_i64_le();

        let obj_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != obj_len {
            return Err(SpanError::Corruption("Object length mismatch".into()));
        }
        let object = cursor.to_vec();

        Ok((WalEntry { id, start, end, object }, 4 + len))
    }

    /// Framed size on disk
    pub fn encoded_len(&self) -> usize {
        MIN_RECORD_LEN + self.id.len() + self.object.len()
    }
}
