//! WAL file naming and replay

use super::WalEntry;
use crate::{BlockVersion, Encoding, Result, SpanError};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity of a WAL file, encoded in its name as
/// `<block_id>+<tenant>+<version>+<encoding>+<data_encoding>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub block_id: Uuid,
    pub tenant_id: String,
    pub version: BlockVersion,
    pub encoding: Encoding,
    pub data_encoding: String,
}

impl ParsedFileName {
    pub fn file_name(&self) -> String {
        format!(
            "{}+{}+{}+{}+{}",
            self.block_id, self.tenant_id, self.version, self.encoding, self.data_encoding
        )
    }
}

/// Parse a WAL file name, `None` if it is not one
pub fn parse_file_name(name: &str) -> Option<ParsedFileName> {
    let parts: Vec<&str> = name.split('+').collect();
    let [block_id, tenant_id, version, encoding, data_encoding] = parts.as_slice() else {
        return None;
    };
    if tenant_id.is_empty() || data_encoding.is_empty() {
        return None;
    }

    Some(ParsedFileName {
        block_id: Uuid::parse_str(block_id).ok()?,
        tenant_id: tenant_id.to_string(),
        version: version.parse().ok()?,
        encoding: encoding.parse().ok()?,
        data_encoding: data_encoding.to_string(),
    })
}

/// A record recovered from a WAL file
pub(crate) struct ReplayedRecord {
    pub entry: WalEntry,
    pub offset: u64,
    pub len: u32,
}

/// Read every valid record of a WAL file
///
/// Reading stops at the first incomplete or corrupt record; the file is
/// truncated there so later appends continue after the last good record.
pub(crate) fn read_records(path: &Path) -> Result<Vec<ReplayedRecord>> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match WalEntry::deserialize_with_checksum(&data[offset..]) {
            Ok((entry, bytes_read)) => {
                records.push(ReplayedRecord {
                    entry,
                    offset: offset as u64,
                    len: bytes_read as u32,
                });
                offset += bytes_read;
            }
            Err(SpanError::ChecksumMismatch { .. }) | Err(SpanError::Corruption(_)) => {
                warn!("Corrupt record at offset {} in {:?}, truncating", offset, path);
                break;
            }
            Err(SpanError::InvalidFormat(_)) => {
                // Incomplete record at end (crash during write)
                warn!("Incomplete record at offset {} in {:?}, truncating", offset, path);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if offset < data.len() {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
        info!("Truncated {:?} from {} to {} bytes", path, data.len(), offset);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_roundtrip() {
        let parsed = ParsedFileName {
            block_id: Uuid::new_v4(),
            tenant_id: "tenant-1".into(),
            version: BlockVersion::V1,
            encoding: Encoding::Lz4,
            data_encoding: "v1".into(),
        };
        assert_eq!(parse_file_name(&parsed.file_name()), Some(parsed));
    }

    #[test]
    fn test_bad_file_names() {
        let id = Uuid::new_v4();
        assert!(parse_file_name("wal_00000000000000000001.log").is_none());
        assert!(parse_file_name(&format!("{}+t+v1+lz4", id)).is_none());
        assert!(parse_file_name(&format!("{}+t+v7+lz4+v1", id)).is_none());
        assert!(parse_file_name(&format!("{}+t+v1+gzip+v1", id)).is_none());
        assert!(parse_file_name(&format!("{}++v1+lz4+v1", id)).is_none());
        assert!(parse_file_name("nope+t+v1+lz4+v1").is_none());
    }

    #[test]
    fn test_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal");

        let mut file = fs::File::create(&path).unwrap();
        let mut good_len = 0;
        for i in 0..3u8 {
            let entry = WalEntry { id: vec![i], start: 1, end: 2, object: vec![i; 8] };
            let bytes = entry.serialize_with_checksum().unwrap();
            good_len += bytes.len();
            file.write_all(&bytes).unwrap();
        }
        let torn = WalEntry { id: vec![9], start: 1, end: 2, object: vec![9; 8] }
            .serialize_with_checksum()
            .unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].entry.id, vec![2]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len as u64);
    }
}
