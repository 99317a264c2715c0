//! On-disk layout of a block's `data` object
//!
//! ```text
//! +-------+--------+-----+--------+--------------+--------------+--------+------------+-------+
//! | MAGIC | page 0 | ... | page N | column index | offset index | footer | footer len | MAGIC |
//! +-------+--------+-----+--------+--------------+--------------+--------+------------+-------+
//! ```
//!
//! Pages hold objects in ascending ID order and are compressed with the
//! block encoding. The column index stores the ID bounds of every page, the
//! offset index where each page lives. Index sections and the footer are
//! bincode encoded; the footer length is a little-endian u32.

use crate::{BlockVersion, Encoding, Result, SpanError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Leading and trailing magic bytes
pub const MAGIC: &[u8; 4] = b"SPDB";

/// Footer length plus trailing magic
pub const TRAILER_LEN: usize = 8;

/// Byte range of a section inside `data`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub offset: u64,
    pub len: u32,
}

/// Location of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLocation {
    pub offset: u64,
    pub size: u32,
    pub num_records: u32,
}

/// ID bounds of one page, both inclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBounds {
    pub min_id: Vec<u8>,
    pub max_id: Vec<u8>,
}

/// Block footer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub version: BlockVersion,
    pub encoding: Encoding,
    pub total_objects: u64,
    pub column_index: Section,
    pub offset_index: Section,
}

/// Serialize and compress one page
pub fn encode_page(version: BlockVersion, encoding: Encoding, records: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u8>> {
    let raw_len: usize = records.iter().map(|(id, obj)| 6 + id.len() + obj.len()).sum();
    let mut buf = Vec::with_capacity(4 + raw_len);
    buf.put_u32_le(records.len() as u32);

    match version {
        BlockVersion::V1 => {
            for (id, obj) in records {
                put_id(&mut buf, id)?;
                buf.put_u32_le(obj.len() as u32);
                buf.put_slice(obj);
            }
        }
        BlockVersion::V2 => {
            for (id, _) in records {
                put_id(&mut buf, id)?;
            }
            for (_, obj) in records {
                buf.put_u32_le(obj.len() as u32);
                buf.put_slice(obj);
            }
        }
    }

    Ok(encoding.compress(&buf))
}

/// Decompress and parse one page
pub fn decode_page(version: BlockVersion, encoding: Encoding, data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let raw = encoding.decompress(data)?;
    let mut cursor = raw.as_slice();
    let count = take_u32(&mut cursor)? as usize;

    let mut records = Vec::with_capacity(count.min(raw.len()));
    match version {
        BlockVersion::V1 => {
            for _ in 0..count {
                let id = take_id(&mut cursor)?;
                let obj = take_object(&mut cursor)?;
                records.push((id, obj));
            }
        }
        BlockVersion::V2 => {
            let mut ids = Vec::with_capacity(count.min(raw.len()));
            for _ in 0..count {
                ids.push(take_id(&mut cursor)?);
            }
            for id in ids {
                let obj = take_object(&mut cursor)?;
                records.push((id, obj));
            }
        }
    }

    if cursor.has_remaining() {
        return Err(SpanError::InvalidFormat(format!(
            "{} trailing bytes after page records",
            cursor.remaining()
        )));
    }
    Ok(records)
}

fn put_id(buf: &mut Vec<u8>, id: &[u8]) -> Result<()> {
    let len = u16::try_from(id.len())
        .map_err(|_| SpanError::Validation(format!("id too long: {} bytes", id.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(id);
    Ok(())
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(SpanError::InvalidFormat("truncated page".into()));
    }
    Ok(cursor.get_u32_le())
}

fn take_bytes(cursor: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if cursor.remaining() < len {
        return Err(SpanError::InvalidFormat("truncated page".into()));
    }
    let bytes = cursor[..len].to_vec();
    cursor.advance(len);
    Ok(bytes)
}

fn take_id(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.remaining() < 2 {
        return Err(SpanError::InvalidFormat("truncated page".into()));
    }
    let len = cursor.get_u16_le() as usize;
    take_bytes(cursor, len)
}

fn take_object(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(cursor)? as usize;
    take_bytes(cursor, len)
}

/// Check the 8-byte trailer and return the footer length
pub fn parse_trailer(trailer: &[u8]) -> Result<u32> {
    if trailer.len() != TRAILER_LEN || &trailer[4..] != MAGIC {
        return Err(SpanError::InvalidFormat("bad block trailer".into()));
    }
    Ok((&trailer[..4]).get_u32_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..20u8).map(|i| (vec![i; 16], vec![i; i as usize * 3])).collect()
    }

    #[test]
    fn test_page_versions() {
        for version in BlockVersion::all() {
            for encoding in Encoding::all() {
                let page = encode_page(*version, *encoding, &records()).unwrap();
                let decoded = decode_page(*version, *encoding, &page).unwrap();
                assert_eq!(decoded, records(), "{} {}", version, encoding);
            }
        }
    }

    #[test]
    fn test_layouts_differ() {
        let v1 = encode_page(BlockVersion::V1, Encoding::None, &records()).unwrap();
        let v2 = encode_page(BlockVersion::V2, Encoding::None, &records()).unwrap();
        assert_eq!(v1.len(), v2.len());
        assert_ne!(v1, v2);
        // reading with the wrong layout never yields the original records
        assert_ne!(decode_page(BlockVersion::V2, Encoding::None, &v1).ok(), Some(records()));
    }

    #[test]
    fn test_truncated_page() {
        let page = encode_page(BlockVersion::V2, Encoding::None, &records()).unwrap();
        let err = decode_page(BlockVersion::V2, Encoding::None, &page[..page.len() - 5]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_trailer() {
        let mut trailer = Vec::new();
        trailer.put_u32_le(77);
        trailer.put_slice(MAGIC);
        assert_eq!(parse_trailer(&trailer).unwrap(), 77);

        trailer[7] = b'X';
        assert!(parse_trailer(&trailer).is_err());
    }
}
