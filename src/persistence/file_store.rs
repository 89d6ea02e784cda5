//! Durable single-file log backing one queue destination.
//!
//! Records are appended in send order and never reordered. Dequeueing walks
//! forward from `pending_offset` and marks each record in place; acking
//! zeroes the record's ack deadline in place. Space is reclaimed only by
//! [`MessageStore::compact`], which rewrites the live records into a fresh
//! file and atomically swaps it in.
//!
//! Concurrency: a store owns its file handle exclusively and every method
//! takes `&mut self`, so callers serialize access (the broker holds stores
//! behind its own lock).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::record::{FILE_HEADER_SIZE, FORMAT_VERSION, FileHeader, RECORD_HEADER_SIZE, RecordHeader};
use super::validate_destination_name;
use crate::utils::error::{StoreError, StoreResult};
use crate::utils::now_millis;

/// What to do when a store file ends in the middle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Drop the incomplete tail and keep every complete record.
    Truncate,
    /// Refuse to open the store.
    Fail,
}

/// When an ack is allowed to trigger a rewrite of the log.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Compact once `(pending + in_use) / total` drops below this ratio.
    pub active_ratio: f64,
    /// Minimum time between two compactions of the same store.
    pub rewrite_interval: Duration,
    /// Also compact when the file grows past this many bytes.
    pub max_file_bytes: Option<u64>,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            active_ratio: 0.1,
            rewrite_interval: Duration::from_secs(300),
            max_file_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// Minimum spacing between fsyncs; zero syncs on every write.
    pub fsync_interval: Duration,
    /// Lease granted to a consumer for a message received without auto-ack.
    pub ack_timeout: Duration,
    pub compaction: CompactionPolicy,
    pub recovery: RecoveryPolicy,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fsync_interval: Duration::ZERO,
            ack_timeout: Duration::from_secs(120),
            compaction: CompactionPolicy::default(),
            recovery: RecoveryPolicy::Truncate,
        }
    }
}

/// A message handed out by [`MessageStore::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: Uuid,
    pub headers: Bytes,
    pub body: Bytes,
}

/// Outcome of a single compaction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub kept: u64,
    pub requeued: u64,
    pub removed: u64,
    pub old_size: u64,
    pub new_size: u64,
}

pub struct MessageStore {
    name: String,
    path: PathBuf,
    file: File,
    config: StoreConfig,
    pending_offset: u64,
    pending_count: u64,
    total_count: u64,
    in_use: HashMap<Uuid, RecordHeader>,
    last_fsync: Option<Instant>,
    last_rewrite: Option<Instant>,
}

impl MessageStore {
    /// Open the log for `name`, creating it if needed and otherwise
    /// rebuilding all counters from what is on disk.
    pub fn open(name: &str, config: StoreConfig) -> StoreResult<Self> {
        validate_destination_name(name)?;
        fs::create_dir_all(&config.dir)?;
        let path = store_path(&config.dir, name);

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut store = Self {
            name: name.to_string(),
            path,
            file,
            config,
            pending_offset: FILE_HEADER_SIZE,
            pending_count: 0,
            total_count: 0,
            in_use: HashMap::new(),
            last_fsync: None,
            last_rewrite: None,
        };

        if existed {
            store.load()?;
        } else {
            store.init_header()?;
        }
        store.total_count = store.pending_count + store.in_use.len() as u64;

        info!(
            queue = %store.name,
            path = %store.path.display(),
            pending = store.pending_count,
            in_use = store.in_use.len(),
            "opened message store"
        );
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending_count(&self) -> u64 {
        self.pending_count
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn is_in_use(&self, id: &Uuid) -> bool {
        self.in_use.contains_key(id)
    }

    pub fn file_len(&self) -> StoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Append a message with an empty header segment.
    pub fn send(&mut self, body: &[u8]) -> StoreResult<Uuid> {
        self.send_with_headers(&[], body)
    }

    pub fn send_with_headers(&mut self, headers: &[u8], body: &[u8]) -> StoreResult<Uuid> {
        let header_len = segment_len(headers)?;
        let body_len = segment_len(body)?;

        let id = Uuid::new_v4();
        let offset = self.file.seek(SeekFrom::End(0))?;
        let record = RecordHeader::pending(offset, id, now_millis(), header_len, body_len);

        let mut buf = BytesMut::with_capacity(record.total_size() as usize);
        record.encode(&mut buf);
        buf.put_slice(headers);
        buf.put_slice(body);
        append_record(&mut self.file, offset, &buf)?;
        self.sync(false)?;

        self.pending_count += 1;
        self.total_count += 1;
        debug!(queue = %self.name, id = %id.simple(), offset, "send");
        Ok(id)
    }

    /// Dequeue the oldest pending message.
    ///
    /// The record is leased for `ack_timeout`; with `auto_ack` it is acked
    /// before this returns.
    pub fn receive(&mut self, auto_ack: bool) -> StoreResult<Option<ReceivedMessage>> {
        if self.pending_count == 0 {
            return Ok(None);
        }

        let file_len = self.file_len()?;
        let mut record = loop {
            if self.pending_offset + RECORD_HEADER_SIZE > file_len {
                error!(
                    queue = %self.name,
                    pending = self.pending_count,
                    offset = self.pending_offset,
                    "pending count disagrees with log contents; resetting"
                );
                self.pending_count = 0;
                return Ok(None);
            }
            let record = self.read_header_at(self.pending_offset)?;
            if record.is_pending() {
                break record;
            }
            self.pending_offset += record.total_size();
        };

        let mut headers = vec![0u8; record.header_len as usize];
        let mut body = vec![0u8; record.body_len as usize];
        self.file.read_exact(&mut headers)?;
        self.file.read_exact(&mut body)?;

        self.pending_offset += record.total_size();
        let header = FileHeader::new(self.pending_offset).encode();
        self.write_at(0, &header[..8])?;

        let now = now_millis();
        let deadline = now + self.config.ack_timeout.as_millis() as i64;
        let mut lease = [0u8; 16];
        {
            let mut buf = &mut lease[..];
            buf.put_i64_le(now);
            buf.put_i64_le(deadline);
        }
        self.write_at(record.dequeue_time_offset(), &lease)?;
        self.sync(false)?;

        record.dequeue_time = now;
        record.ack_deadline = deadline;
        let id = record.id;
        self.pending_count -= 1;
        self.in_use.insert(id, record);
        debug!(queue = %self.name, id = %id.simple(), "receive");

        if auto_ack {
            self.ack(&id)?;
        }

        Ok(Some(ReceivedMessage {
            id,
            headers: Bytes::from(headers),
            body: Bytes::from(body),
        }))
    }

    /// Acknowledge a leased message. Returns `false` (and logs) when `id`
    /// is not currently in use.
    pub fn ack(&mut self, id: &Uuid) -> StoreResult<bool> {
        let Some(record) = self.in_use.remove(id) else {
            warn!(queue = %self.name, id = %id.simple(), "ack: no message in use with this id");
            return Ok(false);
        };

        self.write_at(record.ack_deadline_offset(), &0i64.to_le_bytes())?;
        self.sync(false)?;
        debug!(queue = %self.name, id = %id.simple(), "ack");

        if self.should_compact()? {
            self.compact()?;
        }
        Ok(true)
    }

    fn should_compact(&self) -> StoreResult<bool> {
        let policy = &self.config.compaction;
        let cooled_down = self
            .last_rewrite
            .is_none_or(|at| at.elapsed() >= policy.rewrite_interval);
        if !cooled_down || self.total_count == 0 {
            return Ok(false);
        }

        let active = self.pending_count + self.in_use.len() as u64;
        let ratio = active as f64 / self.total_count as f64;
        if ratio < policy.active_ratio {
            return Ok(true);
        }
        match policy.max_file_bytes {
            Some(max) => Ok(self.file_len()? > max),
            None => Ok(false),
        }
    }

    /// Rewrite the log keeping only live records.
    ///
    /// Acked records are dropped, records whose lease expired are reset to
    /// pending and moved to the tail, and everything else is copied in order.
    pub fn compact(&mut self) -> StoreResult<CompactionStats> {
        let started = Instant::now();
        self.last_rewrite = Some(started);
        let now = now_millis();
        let old_size = self.file_len()?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.config.dir)?;
        let mut stats = CompactionStats {
            old_size,
            ..Default::default()
        };
        let mut in_use = HashMap::new();
        let mut pending_count = 0u64;
        let mut first_pending = None;
        let mut requeue = Vec::new();

        {
            let mut reader = BufReader::new(&self.file);
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writer.write_all(&FileHeader::new(FILE_HEADER_SIZE).encode())?;
            let mut written = FILE_HEADER_SIZE;

            reader.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
            let mut pos = FILE_HEADER_SIZE;
            let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
            while pos + RECORD_HEADER_SIZE <= old_size {
                reader.read_exact(&mut raw)?;
                let mut record = RecordHeader::decode(pos, &raw);
                pos += record.total_size();

                if record.is_pending() {
                    first_pending.get_or_insert(written);
                    pending_count += 1;
                } else if record.is_acked() {
                    stats.removed += 1;
                    reader.seek_relative(record.payload_len() as i64)?;
                    continue;
                } else if record.ack_deadline < now {
                    reader.seek_relative(record.payload_len() as i64)?;
                    requeue.push(record);
                    continue;
                } else {
                    in_use.insert(record.id, RecordHeader { offset: written, ..record.clone() });
                }

                record.offset = written;
                written += copy_record(&record, &mut reader, &mut writer)?;
                stats.kept += 1;
            }

            for mut record in requeue {
                reader.seek(SeekFrom::Start(record.payload_offset()))?;
                record.dequeue_time = 0;
                record.ack_deadline = 0;
                record.offset = written;
                first_pending.get_or_insert(written);
                pending_count += 1;
                written += copy_record(&record, &mut reader, &mut writer)?;
                stats.requeued += 1;
            }

            self.pending_offset = first_pending.unwrap_or(written);
            stats.new_size = written;
            writer.flush()?;
        }

        let out = tmp.as_file_mut();
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&FileHeader::new(self.pending_offset).encode())?;
        out.sync_all()?;

        self.file = tmp.persist(&self.path).map_err(|e| e.error)?;
        self.last_fsync = Some(Instant::now());
        self.pending_count = pending_count;
        self.in_use = in_use;
        self.total_count = self.pending_count + self.in_use.len() as u64;

        info!(
            queue = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            old_size = stats.old_size,
            new_size = stats.new_size,
            kept = stats.kept,
            requeued = stats.requeued,
            removed = stats.removed,
            "compacted message store"
        );
        Ok(stats)
    }

    /// Close the store and delete its backing file.
    pub fn destroy(self) -> StoreResult<()> {
        let Self { name, path, file, .. } = self;
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(queue = %name, path = %path.display(), "destroyed message store");
        Ok(())
    }

    fn init_header(&mut self) -> StoreResult<()> {
        self.file.set_len(0)?;
        self.pending_offset = FILE_HEADER_SIZE;
        self.write_at(0, &FileHeader::new(FILE_HEADER_SIZE).encode())?;
        self.sync(true)
    }

    /// Rebuild counters and the in-use index by scanning every record.
    fn load(&mut self) -> StoreResult<()> {
        let mut file_len = self.file_len()?;
        if file_len < FILE_HEADER_SIZE {
            self.recover_truncated(0, "file shorter than its header")?;
            return self.init_header();
        }

        let mut raw = [0u8; FILE_HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut raw)?;
        let header = FileHeader::decode(&raw);
        if header.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: header.version,
            });
        }

        let mut first_pending = None;
        let mut pos = FILE_HEADER_SIZE;
        {
            let mut reader = BufReader::new(&self.file);
            let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
            while pos < file_len {
                if pos + RECORD_HEADER_SIZE > file_len {
                    break;
                }
                reader.read_exact(&mut raw)?;
                let record = RecordHeader::decode(pos, &raw);
                if pos + record.total_size() > file_len {
                    break;
                }
                reader.seek_relative(record.payload_len() as i64)?;

                if record.is_pending() {
                    first_pending.get_or_insert(pos);
                    self.pending_count += 1;
                } else if record.is_leased() {
                    self.in_use.insert(record.id, record.clone());
                }
                pos += record.total_size();
            }
        }

        if pos < file_len {
            self.recover_truncated(pos, "incomplete record at end of file")?;
            self.file.set_len(pos)?;
            file_len = pos;
        }

        self.pending_offset = first_pending.unwrap_or(file_len);
        if self.pending_offset != header.pending_offset {
            if self.pending_offset < header.pending_offset {
                warn!(
                    queue = %self.name,
                    stored = header.pending_offset,
                    recovered = self.pending_offset,
                    "pending record found behind stored offset; it will be redelivered"
                );
            }
            let header = FileHeader::new(self.pending_offset).encode();
            self.write_at(0, &header[..8])?;
            self.sync(true)?;
        }
        Ok(())
    }

    fn recover_truncated(&self, offset: u64, reason: &str) -> StoreResult<()> {
        match self.config.recovery {
            RecoveryPolicy::Truncate => {
                warn!(queue = %self.name, offset, reason, "truncating damaged store file");
                Ok(())
            }
            RecoveryPolicy::Fail => Err(StoreError::Corrupt {
                offset,
                reason: reason.to_string(),
            }),
        }
    }

    fn read_header_at(&mut self, offset: u64) -> StoreResult<RecordHeader> {
        let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;
        Ok(RecordHeader::decode(offset, &raw))
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Flush to the OS and fsync when the interval has elapsed (or `force`).
    fn sync(&mut self, force: bool) -> StoreResult<()> {
        self.file.flush()?;
        let due = self
            .last_fsync
            .is_none_or(|at| at.elapsed() >= self.config.fsync_interval);
        if force || due {
            self.file.sync_data()?;
            self.last_fsync = Some(Instant::now());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("pending_offset", &self.pending_offset)
            .field("pending_count", &self.pending_count)
            .field("in_use", &self.in_use.len())
            .field("total_count", &self.total_count)
            .finish()
    }
}

/// `<dir>/<urlsafe-base64(name)>.msg.dat`
pub fn store_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.msg.dat", URL_SAFE.encode(name)))
}

/// End of a log that can be cut back to a known length.
pub(crate) trait AppendLog: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendLog for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append one encoded record at `offset`, the current end of the log. A
/// failed write is cut back to `offset` so no partial record is left behind.
pub(crate) fn append_record(log: &mut impl AppendLog, offset: u64, record: &[u8]) -> io::Result<()> {
    if let Err(e) = log.write_all(record) {
        if let Err(trunc) = log.truncate_to(offset) {
            error!(offset, "failed to roll back a partial record: {}", trunc);
        }
        return Err(e);
    }
    Ok(())
}

fn segment_len(segment: &[u8]) -> StoreResult<u32> {
    u32::try_from(segment.len()).map_err(|_| StoreError::MessageTooLarge {
        size: segment.len(),
    })
}

/// Write `record` followed by its payload, read from `reader`'s current
/// position. Returns the number of bytes written.
fn copy_record(
    record: &RecordHeader,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> io::Result<u64> {
    let mut raw = BytesMut::with_capacity(RECORD_HEADER_SIZE as usize);
    record.encode(&mut raw);
    writer.write_all(&raw)?;
    let copied = io::copy(&mut reader.take(record.payload_len()), writer)?;
    if copied != record.payload_len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "record payload shorter than its header claims",
        ));
    }
    Ok(record.total_size())
}
