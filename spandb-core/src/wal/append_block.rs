//! Head block backed by a single WAL file

use super::reader::{read_records, ParsedFileName};
use super::{SyncPolicy, WalEntry};
use crate::{BlockMeta, BlockVersion, Encoding, Result, SpanError};
use chrono::Utc;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

/// Location of one record inside the WAL file
#[derive(Debug, Clone)]
struct Record {
    id: Vec<u8>,
    offset: u64,
    len: u32,
}

/// Append-only block stored as one WAL file
///
/// Appends are serialized by `&mut self`; reads take `&self` and may run
/// concurrently with each other.
pub struct AppendBlock {
    meta: BlockMeta,
    path: PathBuf,
    writer: Mutex<WriterState>,
    reader: Mutex<File>,
    /// Records in append order
    records: Vec<Record>,
    data_len: u64,
    ingestion_slack: Duration,
    /// Widens only the lower bound of the slack window
    additional_start_slack: Duration,
    sync_policy: SyncPolicy,
    created_at: Instant,
    last_append: Instant,
    clamped: Option<IntCounter>,
}

struct WriterState {
    file: BufWriter<File>,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl AppendBlock {
    /// Create an empty WAL file for a new head block
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        dir: &Path,
        block_id: Uuid,
        tenant_id: &str,
        version: BlockVersion,
        encoding: Encoding,
        data_encoding: &str,
        ingestion_slack: Duration,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let name = ParsedFileName {
            block_id,
            tenant_id: tenant_id.to_string(),
            version,
            encoding,
            data_encoding: data_encoding.to_string(),
        };
        let path = dir.join(name.file_name());
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;

        Self::open(path, name, file, ingestion_slack, sync_policy)
    }

    /// Rebuild a block from an existing WAL file
    ///
    /// Replayed start times may be up to `ingestion_slack +
    /// additional_start_slack` in the past; end times keep the plain slack.
    pub(crate) fn replay(
        path: &Path,
        name: ParsedFileName,
        ingestion_slack: Duration,
        additional_start_slack: Duration,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let replayed = read_records(path)?;
        let file = OpenOptions::new().append(true).open(path)?;
        let mut block = Self::open(path.to_path_buf(), name, file, ingestion_slack, sync_policy)?;
        block.additional_start_slack = additional_start_slack;

        for record in replayed {
            let (start, end) = block.adjust_time_range_for_slack(record.entry.start, record.entry.end);
            block.meta.object_added(&record.entry.id, start, end);
            block.data_len = record.offset + record.len as u64;
            block.records.push(Record {
                id: record.entry.id,
                offset: record.offset,
                len: record.len,
            });
        }

        Ok(block)
    }

    fn open(
        path: PathBuf,
        name: ParsedFileName,
        file: File,
        ingestion_slack: Duration,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let reader = File::open(&path)?;
        let meta = BlockMeta::new(
            name.tenant_id,
            name.block_id,
            name.version,
            name.encoding,
            name.data_encoding,
        );
        let now = Instant::now();

        Ok(Self {
            meta,
            path,
            writer: Mutex::new(WriterState {
                file: BufWriter::new(file),
                writes_since_sync: 0,
                last_sync: now,
            }),
            reader: Mutex::new(reader),
            records: Vec::new(),
            data_len: 0,
            ingestion_slack,
            additional_start_slack: Duration::ZERO,
            sync_policy,
            created_at: now,
            last_append: now,
            clamped: None,
        })
    }

    /// Count objects whose times were clamped into the slack window
    pub fn with_clamp_counter(mut self, counter: IntCounter) -> Self {
        self.clamped = Some(counter);
        self
    }

    /// Append an object. The object is durable once this returns, as far as
    /// the sync policy allows. On failure nothing is indexed.
    pub fn append(&mut self, id: &[u8], object: &[u8], start: i64, end: i64) -> Result<()> {
        if id.is_empty() {
            return Err(SpanError::Validation("empty object id".into()));
        }

        let (start, end) = self.adjust_time_range_for_slack(start, end);
        let entry = WalEntry {
            id: id.to_vec(),
            start,
            end,
            object: self.meta.encoding.compress(object),
        };
        let serialized = entry.serialize_with_checksum()?;

        {
            let mut writer = self.writer.lock();
            if let Err(e) = Self::write_record(&mut writer, &serialized, self.sync_policy) {
                if let Err(rollback) = self.rollback(&mut writer) {
                    error!(file = %self.path.display(), error = %rollback, "failed to roll back wal file");
                }
                return Err(e);
            }
        }

        self.records.push(Record {
            id: id.to_vec(),
            offset: self.data_len,
            len: serialized.len() as u32,
        });
        self.data_len += serialized.len() as u64;
        self.meta.object_added(id, start, end);
        self.last_append = Instant::now();
        Ok(())
    }

    fn write_record(writer: &mut WriterState, serialized: &[u8], policy: SyncPolicy) -> Result<()> {
        writer.file.write_all(serialized)?;
        writer.writes_since_sync += 1;

        let sync = match policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => writer.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => writer.last_sync.elapsed().as_millis() >= millis as u128,
            SyncPolicy::None => false,
        };
        if sync {
            writer.file.flush()?;
            writer.file.get_ref().sync_data()?;
            writer.writes_since_sync = 0;
            writer.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Cut the file back to the last indexed record and drop buffered bytes
    fn rollback(&self, writer: &mut WriterState) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.data_len)?;
        let old = std::mem::replace(&mut writer.file, BufWriter::new(file));
        // into_parts discards the buffer instead of flushing it on drop
        let _ = old.into_parts();
        Ok(())
    }

    /// Force buffered records to disk without sealing the block
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;
        writer.writes_since_sync = 0;
        writer.last_sync = Instant::now();
        Ok(())
    }

    /// Clamp object times to `[now - slack - additional_start_slack, now +
    /// slack]`; out of range values become now
    fn adjust_time_range_for_slack(&self, start: i64, end: i64) -> (i64, i64) {
        let now = Utc::now().timestamp();
        let slack = self.ingestion_slack.as_secs() as i64;
        let start_slack = slack.saturating_add(self.additional_start_slack.as_secs() as i64);
        let (mut start, mut end) = (start, end);
        let mut clamped = false;

        if start < now - start_slack || start > end {
            clamped |= start != 0;
            start = now;
        }
        if end > now + slack || end < start {
            clamped |= end != 0;
            end = now;
        }

        if clamped {
            warn!(
                tenant = %self.meta.tenant_id,
                block_id = %self.meta.block_id,
                "object time range outside ingestion slack, clamped to now"
            );
            if let Some(counter) = &self.clamped {
                counter.inc();
            }
        }
        (start, end)
    }

    /// Latest appended object for `id`
    pub fn find_by_id(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(record) = self.records.iter().rev().find(|r| r.id == id) else {
            return Ok(None);
        };

        self.writer.lock().file.flush()?;

        let mut buf = vec![0u8; record.len as usize];
        {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(record.offset))?;
            reader.read_exact(&mut buf)?;
        }
        let (entry, _) = WalEntry::deserialize_with_checksum(&buf)?;
        Ok(Some(self.meta.encoding.decompress(&entry.object)?))
    }

    /// Every object ordered by ID, latest append winning for duplicate IDs
    pub fn objects(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.writer.lock().file.flush()?;
        let data = fs::read(&self.path)?;

        let mut latest: BTreeMap<&[u8], &Record> = BTreeMap::new();
        for record in &self.records {
            latest.insert(&record.id, record);
        }

        let mut objects = Vec::with_capacity(latest.len());
        for (id, record) in latest {
            let start = record.offset as usize;
            let end = start + record.len as usize;
            if end > data.len() {
                return Err(SpanError::Corruption(format!(
                    "record beyond end of {:?}",
                    self.path
                )));
            }
            let (entry, _) = WalEntry::deserialize_with_checksum(&data[start..end])?;
            objects.push((id.to_vec(), self.meta.encoding.decompress(&entry.object)?));
        }
        Ok(objects)
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn block_id(&self) -> Uuid {
        self.meta.block_id
    }

    /// Bytes appended so far
    pub fn data_length(&self) -> u64 {
        self.data_len
    }

    /// Records appended so far, duplicates included
    pub fn length(&self) -> usize {
        self.records.len()
    }

    pub fn full_path(&self) -> &Path {
        &self.path
    }

    /// Time since the block was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last successful append
    pub fn idle(&self) -> Duration {
        self.last_append.elapsed()
    }

    /// Delete the WAL file
    pub fn clear(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
