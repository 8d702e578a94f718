//! On-disk layout and the file-backed event log.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;

use crate::error::LogError;
use crate::event::{ProposedEvent, RecordedEvent};
use crate::log::{Epoch, EventLog, check_epoch};

/// File holding one stream's records, one JSON object per line.
const EVENTS_FILE: &str = "events.jsonl";

/// Manages the on-disk directory layout for event streams.
///
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate_type>/
///             <instance_id>/
///                 events.jsonl    -- append-only, one record per line
///     meta/
///         streams.jsonl           -- stream registry
///         fence.json              -- current fencing epoch
///         log.lock                -- advisory lock held by writers
/// ```
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>`
    pub fn stream_dir(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(aggregate_type)
            .join(instance_id)
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>/events.jsonl`
    pub fn events_path(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.stream_dir(aggregate_type, instance_id).join(EVENTS_FILE)
    }

    /// `<base_dir>/meta`
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// `<base_dir>/meta/fence.json`
    pub fn fence_path(&self) -> PathBuf {
        self.meta_dir().join("fence.json")
    }

    /// `<base_dir>/meta/log.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.meta_dir().join("log.lock")
    }

    /// Ensures that the stream directory and registry entry exist.
    ///
    /// Idempotent: repeated calls neither duplicate directories nor
    /// registry lines.
    ///
    /// # Arguments
    ///
    /// * `aggregate_type` - Aggregate type name, e.g. `"todo"`.
    /// * `instance_id` - Entity id within that type.
    ///
    /// # Returns
    ///
    /// The stream directory path.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directory creation or file I/O fails.
    pub fn ensure_stream(
        &self,
        aggregate_type: &str,
        instance_id: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self.stream_dir(aggregate_type, instance_id);
        fs::create_dir_all(&dir)?;

        let meta = self.meta_dir();
        fs::create_dir_all(&meta)?;
        let registry_path = meta.join("streams.jsonl");

        let already_registered = match fs::File::open(&registry_path) {
            Ok(file) => {
                let mut found = false;
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line)
                        && entry.get("type").and_then(|v| v.as_str()) == Some(aggregate_type)
                        && entry.get("id").and_then(|v| v.as_str()) == Some(instance_id)
                    {
                        found = true;
                        break;
                    }
                }
                found
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        if !already_registered {
            let ts = SystemTime::UNIX_EPOCH
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let entry = serde_json::json!({
                "type": aggregate_type,
                "id": instance_id,
                "ts": ts,
            });
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)?;
            writeln!(file, "{entry}")?;
        }

        Ok(dir)
    }

    /// Lists all instance ids that have a stream directory, sorted.
    ///
    /// # Returns
    ///
    /// An empty list if no stream of `aggregate_type` was ever created.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_streams(&self, aggregate_type: &str) -> std::io::Result<Vec<String>> {
        let type_dir = self.base_dir.join("streams").join(aggregate_type);

        let entries = match fs::read_dir(&type_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry
                    .file_type()
                    .ok()?
                    .is_dir()
                    .then(|| entry.file_name().to_string_lossy().into_owned())
            })
            .collect();

        ids.sort();
        Ok(ids)
    }

    fn load_fence(&self) -> Result<Epoch, LogError> {
        match fs::read(self.fence_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Epoch::ZERO),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the fence through a temp file and rename so readers never see
    /// a torn value.
    fn store_fence(&self, epoch: Epoch) -> Result<(), LogError> {
        fs::create_dir_all(self.meta_dir())?;
        let path = self.fence_path();
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(&epoch)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// Reject identifiers that would escape or collide in the directory layout.
fn validate_component(value: &str) -> Result<(), LogError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(LogError::InvalidStreamId(value.to_owned()));
    }
    Ok(())
}

/// Truncate a torn trailing line left by a crash mid-append and return the
/// last committed sequence number.
fn recover_tail(path: &Path) -> Result<u64, LogError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let committed = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    if committed < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - committed,
            "truncating torn record at end of stream"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(committed as u64)?;
    }

    let last_line = bytes[..committed]
        .split(|b| *b == b'\n')
        .rev()
        .find(|line| !line.is_empty());
    match last_line {
        Some(line) => Ok(serde_json::from_slice::<RecordedEvent>(line)?.sequence),
        None => Ok(0),
    }
}

/// Read every committed record of a stream, checking sequence continuity.
///
/// Works on raw bytes: a torn tail may end inside a multi-byte character
/// and must not poison the committed lines before it.
fn read_stream(path: &Path) -> Result<Vec<RecordedEvent>, LogError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // A line without its newline is an append that never completed.
    let committed = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);

    let mut records = Vec::new();
    for line in bytes[..committed]
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
    {
        let record: RecordedEvent = serde_json::from_slice(line)?;
        let expected = records.len() as u64 + 1;
        if record.sequence != expected {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: expected sequence {expected}, found {}",
                    path.display(),
                    record.sequence
                ),
            )));
        }
        records.push(record);
    }
    Ok(records)
}

/// Run blocking file I/O off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T, LogError>
where
    F: FnOnce() -> Result<T, LogError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LogError::Io(io::Error::other(e)))?
}

/// Exclusive advisory lock on `meta/log.lock`, released on drop.
///
/// Serializes appends and fence updates across every `FileLog` opened on
/// the same directory, in this process or another.
struct WriterLock {
    file: File,
}

impl WriterLock {
    fn acquire(layout: &StreamLayout) -> io::Result<Self> {
        fs::create_dir_all(layout.meta_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(layout.lock_path())?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Tail of a stream file as last observed by this handle.
#[derive(Debug, Clone, Copy)]
struct StreamTail {
    /// File length right after the last append we made or scanned.
    len: u64,
    /// Sequence of the last committed record at that length.
    sequence: u64,
}

/// Event log persisted as one JSONL file per stream.
///
/// Each append writes one complete line and syncs it before returning, so
/// an acknowledged record survives a crash. A line torn by a crash is
/// skipped by reads and cut off by the next append. Writers on the same
/// directory, including other `FileLog` handles, are serialized by an
/// advisory lock; the fence and the stream tail are re-checked under that
/// lock on every append.
#[derive(Debug, Clone)]
pub struct FileLog {
    layout: StreamLayout,
    /// Last observed tail per stream file. Trusted only while the file
    /// length still matches.
    tails: Arc<Mutex<HashMap<PathBuf, StreamTail>>>,
}

impl FileLog {
    /// Open (or lazily create) a log rooted at `base_dir`.
    ///
    /// No I/O happens until the first append or read.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory holding `streams/` and `meta/`.
    ///
    /// # Returns
    ///
    /// A cheaply cloneable log handle.
    pub fn open(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            tails: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The directory layout backing this log.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    /// Last committed sequence of `path`, rescanning the file unless its
    /// length still matches what this handle last saw.
    fn current_tail(
        &self,
        tails: &HashMap<PathBuf, StreamTail>,
        path: &Path,
    ) -> Result<u64, LogError> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        match tails.get(path) {
            Some(tail) if tail.len == len => Ok(tail.sequence),
            Some(_) => {
                tracing::debug!(path = %path.display(), "stream changed by another writer, rescanning");
                recover_tail(path)
            }
            None => recover_tail(path),
        }
    }

    fn append_blocking(
        &self,
        aggregate_type: &str,
        instance_id: &str,
        event: ProposedEvent,
        epoch: Epoch,
    ) -> Result<RecordedEvent, LogError> {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        let _writer = WriterLock::acquire(&self.layout)?;
        check_epoch(epoch, self.layout.load_fence()?)?;

        let path = self.layout.events_path(aggregate_type, instance_id);
        if !tails.contains_key(&path) {
            self.layout.ensure_stream(aggregate_type, instance_id)?;
        }
        let last = self.current_tail(&tails, &path)?;

        let record = RecordedEvent::from_proposed(event, last + 1, epoch);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(&line)?;
                file.sync_data()?;
                Ok(file.metadata()?.len())
            });
        match written {
            Ok(len) => {
                tails.insert(
                    path,
                    StreamTail {
                        len,
                        sequence: record.sequence,
                    },
                );
                Ok(record)
            }
            Err(e) => {
                // Force a tail scan before the next append.
                tails.remove(&path);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl EventLog for FileLog {
    async fn append(
        &self,
        aggregate_type: &str,
        instance_id: &str,
        event: ProposedEvent,
        epoch: Epoch,
    ) -> Result<RecordedEvent, LogError> {
        validate_component(aggregate_type)?;
        validate_component(instance_id)?;
        let this = self.clone();
        let (aggregate_type, instance_id) = (aggregate_type.to_owned(), instance_id.to_owned());
        blocking(move || this.append_blocking(&aggregate_type, &instance_id, event, epoch)).await
    }

    async fn read(
        &self,
        aggregate_type: &str,
        instance_id: &str,
    ) -> Result<Vec<RecordedEvent>, LogError> {
        validate_component(aggregate_type)?;
        validate_component(instance_id)?;
        let path = self.layout.events_path(aggregate_type, instance_id);
        blocking(move || read_stream(&path)).await
    }

    async fn fence(&self, epoch: Epoch) -> Result<(), LogError> {
        let this = self.clone();
        blocking(move || {
            let _guard = this.tails.lock().unwrap_or_else(PoisonError::into_inner);
            let _writer = WriterLock::acquire(&this.layout)?;
            check_epoch(epoch, this.layout.load_fence()?)?;
            this.layout.store_fence(epoch)
        })
        .await
    }

    async fn current_epoch(&self) -> Result<Epoch, LogError> {
        let layout = self.layout.clone();
        blocking(move || layout.load_fence()).await
    }
}
