//! Write-Ahead Log (WAL)
//!
//! Every head block is one append-only WAL file. Appends are durable once
//! they return (subject to [`SyncPolicy`]). On restart the directory is
//! rescanned and each file is replayed into an [`AppendBlock`] that can be
//! completed like any other block.

mod append_block;
mod entry;
mod reader;

pub use append_block::AppendBlock;
pub use entry::WalEntry;
pub use reader::{parse_file_name, ParsedFileName};

use crate::util::duration_format;
use crate::{BlockVersion, Encoding, Result, SpanError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Compression of objects inside WAL records
    pub encoding: Encoding,
    /// Block version recorded for new head blocks
    pub version: BlockVersion,
    /// Clamp window for object start/end times around wall-clock time
    #[serde(with = "duration_format")]
    pub ingestion_slack: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            encoding: Encoding::None,
            version: BlockVersion::default(),
            ingestion_slack: crate::config::INGESTION_SLACK,
        }
    }
}

/// Directory of WAL files
#[derive(Debug, Clone)]
pub struct Wal {
    config: WalConfig,
}

impl Wal {
    /// Open the WAL directory, creating it if needed
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Start a new head block file
    pub fn new_block(&self, block_id: Uuid, tenant_id: &str, data_encoding: &str) -> Result<AppendBlock> {
        AppendBlock::create(
            &self.config.dir,
            block_id,
            tenant_id,
            self.config.version,
            self.config.encoding,
            data_encoding,
            self.config.ingestion_slack,
            self.config.sync_policy,
        )
    }

    /// Replay every WAL file in the directory
    ///
    /// Zero-length files are deleted and produce no block. Files whose name
    /// cannot be parsed are skipped. `additional_start_slack` widens the
    /// ingestion slack for the start time of replayed objects, since they
    /// were written some time before the restart.
    pub fn rescan_blocks(&self, additional_start_slack: Duration) -> Result<Vec<AppendBlock>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut blocks = Vec::new();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(parsed) = parse_file_name(name) else {
                warn!(file = %path.display(), "skipping unrecognised file in wal directory");
                continue;
            };

            if fs::metadata(&path)?.len() == 0 {
                warn!(file = %path.display(), "removing zero length wal file");
                fs::remove_file(&path)?;
                continue;
            }

            let block = AppendBlock::replay(
                &path,
                parsed,
                self.config.ingestion_slack,
                additional_start_slack,
                self.config.sync_policy,
            )
            .map_err(|e| SpanError::WalRecovery(format!("{}: {}", path.display(), e)))?;
            if block.length() == 0 {
                // Only a corrupt first record was present
                warn!(file = %path.display(), "removing wal file without valid records");
                block.clear()?;
                continue;
            }

            info!(
                block_id = %block.block_id(),
                tenant = %block.meta().tenant_id,
                objects = block.length(),
                "replayed wal block"
            );
            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Remove every file in the WAL directory
    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wal(dir: &TempDir) -> Wal {
        Wal::new(WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_wal_drops_zero_length() {
        let dir = TempDir::new().unwrap();
        let wal = wal(&dir);

        let block = wal.new_block(Uuid::new_v4(), "test", "v1").unwrap();
        let path = block.full_path().to_path_buf();
        drop(block);
        assert!(path.exists());

        let blocks = wal.rescan_blocks(Duration::ZERO).unwrap();
        assert!(blocks.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_rescan_replays_appends() {
        let dir = TempDir::new().unwrap();
        let wal = wal(&dir);
        let id = Uuid::new_v4();

        let mut block = wal.new_block(id, "test", "v1").unwrap();
        let now = chrono::Utc::now().timestamp();
        for i in 0..10u8 {
            block.append(&[i], &[i; 32], now, now).unwrap();
        }
        block.flush().unwrap();
        drop(block);

        // junk files are ignored
        fs::write(dir.path().join("not-a-wal"), b"junk").unwrap();

        let blocks = wal.rescan_blocks(Duration::ZERO).unwrap();
        assert_eq!(blocks.len(), 1);
        let replayed = &blocks[0];
        assert_eq!(replayed.block_id(), id);
        assert_eq!(replayed.meta().tenant_id, "test");
        assert_eq!(replayed.length(), 10);
        assert_eq!(replayed.find_by_id(&[3]).unwrap(), Some(vec![3; 32]));
    }

    #[test]
    fn test_replay_start_slack_widens_start_only() {
        let dir = TempDir::new().unwrap();
        let hour = 3600;
        let writer = Wal::new(WalConfig {
            dir: dir.path().to_path_buf(),
            ingestion_slack: Duration::from_secs(10 * hour as u64),
            ..Default::default()
        })
        .unwrap();
        let now = chrono::Utc::now().timestamp();
        let mut block = writer.new_block(Uuid::new_v4(), "test", "v1").unwrap();
        block.append(&[1], b"x", now - 3 * hour, now + 3 * hour).unwrap();
        block.flush().unwrap();
        drop(block);

        let reader = Wal::new(WalConfig {
            dir: dir.path().to_path_buf(),
            ingestion_slack: Duration::from_secs(60),
            ..Default::default()
        })
        .unwrap();
        let blocks = reader.rescan_blocks(Duration::from_secs(4 * hour as u64)).unwrap();
        let meta = blocks[0].meta();
        // the start is inside the widened window and kept
        assert_eq!(meta.start_time.timestamp(), now - 3 * hour);
        // the end is outside the plain window and clamped
        assert!((meta.end_time.timestamp() - now).abs() <= 1);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let wal = wal(&dir);
        wal.new_block(Uuid::new_v4(), "a", "v1").unwrap();
        wal.new_block(Uuid::new_v4(), "b", "v1").unwrap();
        wal.clear().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
