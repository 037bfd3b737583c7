//! On-disk layout and the shared JSON-lines append log.
//!
//! Every durable structure in the crate is an append-only file holding one
//! JSON record per line. [`AppendLog`] owns the write side of such a file
//! (serialised behind an async mutex), hands out the exact byte position of
//! each record it writes, and replays records lazily in append order.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::stream::{self, BoxStream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{LedgerError, Result};

/// Manages the directory layout under a single base directory.
///
/// ```text
/// <base_dir>/
///     events/
///         events.jsonl            -- EventStore
///     commands/
///         attempts.jsonl          -- CommandLog attempts
///         outcomes.jsonl          -- CommandLog final outcomes
///     snapshots/
///         <name>/snapshot.json    -- optional replay snapshots
///     trajectories/
///         steps.jsonl
///         outcomes.jsonl
///         index.sqlite            -- rebuildable secondary index
/// ```
///
/// `DataLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct DataLayout {
    base_dir: PathBuf,
}

impl DataLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/events/events.jsonl`
    pub fn events_log(&self) -> PathBuf {
        self.base_dir.join("events").join("events.jsonl")
    }

    /// `<base_dir>/commands/attempts.jsonl`
    pub fn attempts_log(&self) -> PathBuf {
        self.base_dir.join("commands").join("attempts.jsonl")
    }

    /// `<base_dir>/commands/outcomes.jsonl`
    pub fn command_outcomes_log(&self) -> PathBuf {
        self.base_dir.join("commands").join("outcomes.jsonl")
    }

    /// `<base_dir>/snapshots/<name>/snapshot.json`
    pub fn snapshot_file(&self, name: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(name)
            .join("snapshot.json")
    }

    /// `<base_dir>/trajectories`
    pub fn trajectories_dir(&self) -> PathBuf {
        self.base_dir.join("trajectories")
    }

    /// `<base_dir>/trajectories/steps.jsonl`
    pub fn steps_log(&self) -> PathBuf {
        self.trajectories_dir().join("steps.jsonl")
    }

    /// `<base_dir>/trajectories/outcomes.jsonl`
    pub fn trajectory_outcomes_log(&self) -> PathBuf {
        self.trajectories_dir().join("outcomes.jsonl")
    }

    /// `<base_dir>/trajectories/index.sqlite`
    pub fn trajectory_index(&self) -> PathBuf {
        self.trajectories_dir().join("index.sqlite")
    }
}

/// Exact location of one record inside an append log.
///
/// `length` includes the trailing newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordPos {
    /// Byte offset of the first byte of the record.
    pub offset: u64,
    /// Number of bytes, newline included.
    pub length: u64,
}

/// A cheap change detector for a log file: its size and modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceProbe {
    /// File length in bytes.
    pub len: u64,
    /// Last modification time, when the platform reports one.
    pub modified: Option<SystemTime>,
}

struct LogWriter {
    file: File,
    /// Bytes of whole records written so far.
    len: u64,
    /// Bytes past `len` may be on disk from a failed append.
    dirty: bool,
}

impl LogWriter {
    /// Cut the file back to the last committed record.
    async fn rollback(&mut self) -> Result<()> {
        self.file.set_len(self.len).await?;
        self.dirty = false;
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    if fsync {
        file.sync_data().await?;
    }
    Ok(())
}

/// Append-only JSON-lines file.
///
/// Appends are serialised by an internal `tokio::sync::Mutex`, so concurrent
/// callers on the same log never interleave bytes. Reads open independent
/// file handles and never block appends for longer than it takes to read
/// the current length.
pub(crate) struct AppendLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    fsync: bool,
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("path", &self.path)
            .field("fsync", &self.fsync)
            .finish()
    }
}

/// Size of the window scanned backwards when looking for the last newline.
const TAIL_SCAN_CHUNK: u64 = 4096;

impl AppendLog {
    /// Open (or create) the log at `path`.
    ///
    /// A torn trailing record left by a crash mid-write is truncated so the
    /// next append starts on a line boundary.
    pub(crate) async fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let len = repair_torn_tail(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                len,
                dirty: false,
            }),
            fsync,
        })
    }

    /// Path of the underlying file.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Current committed length in bytes.
    pub(crate) async fn len(&self) -> u64 {
        self.writer.lock().await.len
    }

    /// Serialise `record` as one line and append it.
    ///
    /// A write that fails part way is cut back off the file before the error
    /// is returned, so the next record still starts at the committed length.
    /// If that truncation fails too, it is retried before the next append.
    ///
    /// # Returns
    ///
    /// The byte range the record occupies.
    pub(crate) async fn append<T: Serialize>(&self, record: &T) -> Result<RecordPos> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.dirty {
            writer.rollback().await?;
        }
        let offset = writer.len;
        writer.dirty = true;
        if let Err(err) = write_line(&mut writer.file, &line, self.fsync).await {
            if let Err(rollback) = writer.rollback().await {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "could not discard partial record"
                );
            }
            return Err(err.into());
        }
        writer.dirty = false;
        let length = line.len() as u64;
        writer.len += length;
        Ok(RecordPos { offset, length })
    }

    /// Read and decode the record stored at `pos`.
    pub(crate) async fn read_at<T: DeserializeOwned>(&self, pos: RecordPos) -> Result<T> {
        let mut file = File::open(&self.path).await?;
        read_record(&mut file, pos).await
    }

    /// Lazily replay every record currently in the log, in append order.
    ///
    /// The stream is bounded by the log length at call time, so it is finite
    /// even while other tasks keep appending. Calling this again restarts
    /// from the beginning.
    pub(crate) async fn records<T>(&self) -> Result<BoxStream<'static, Result<(RecordPos, T)>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.records_from(0).await
    }

    /// Like [`records`](AppendLog::records) but starting at byte `offset`,
    /// which must be a record boundary.
    pub(crate) async fn records_from<T>(
        &self,
        offset: u64,
    ) -> Result<BoxStream<'static, Result<(RecordPos, T)>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let end = self.len().await;
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let reader = BufReader::new(file);
        let path = self.path.clone();

        let stream = stream::try_unfold((reader, offset, Vec::new()), move |state| {
            next_record::<T>(state, end, path.clone())
        });
        Ok(Box::pin(stream))
    }

    /// Size and modification time of the log file.
    pub(crate) async fn probe(&self) -> Result<SourceProbe> {
        let meta = tokio::fs::metadata(&self.path).await?;
        Ok(SourceProbe {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

type UnfoldState = (BufReader<File>, u64, Vec<u8>);

/// Decode the next complete record, skipping blank lines.
///
/// Stops at `end` or at a trailing line without a newline (a torn write).
async fn next_record<T: DeserializeOwned>(
    (mut reader, mut pos, mut buf): UnfoldState,
    end: u64,
    path: PathBuf,
) -> Result<Option<((RecordPos, T), UnfoldState)>> {
    loop {
        if pos >= end {
            return Ok(None);
        }
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            tracing::warn!(
                path = %path.display(),
                offset = pos,
                "ignoring partial trailing record"
            );
            return Ok(None);
        }
        let record_pos = RecordPos {
            offset: pos,
            length: n as u64,
        };
        pos += n as u64;
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: T = serde_json::from_slice(&buf)?;
        return Ok(Some(((record_pos, record), (reader, pos, buf))));
    }
}

/// Seek to `pos`, read exactly `pos.length` bytes and decode one record.
pub(crate) async fn read_record<T: DeserializeOwned>(file: &mut File, pos: RecordPos) -> Result<T> {
    let length = usize::try_from(pos.length)
        .map_err(|_| LedgerError::Corrupt(format!("record length {} too large", pos.length)))?;
    file.seek(SeekFrom::Start(pos.offset)).await?;
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LedgerError::Corrupt(format!(
                "record at offset {} (length {}) extends past end of log",
                pos.offset, pos.length
            ))
        } else {
            LedgerError::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Truncate any bytes after the last newline in `path`.
///
/// Returns the resulting file length (0 when the file does not exist).
async fn repair_torn_tail(path: &Path) -> Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut end = len;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];
    let keep = loop {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let window = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf[..window]).await?;
        if let Some(idx) = buf[..window].iter().rposition(|b| *b == b'\n') {
            break start + idx as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    if keep < len {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = len - keep,
            "truncating torn trailing record"
        );
        file.set_len(keep).await?;
        file.sync_data().await?;
    }
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    async fn collect(log: &AppendLog) -> Vec<(RecordPos, Rec)> {
        let mut out = Vec::new();
        let mut stream = log.records::<Rec>().await.expect("records should open");
        while let Some(item) = stream.next().await {
            out.push(item.expect("record should decode"));
        }
        out
    }

    #[test]
    fn path_helpers_correct() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = DataLayout::new(tmp.path());

        assert_eq!(layout.base_dir(), tmp.path());
        assert_eq!(layout.events_log(), tmp.path().join("events/events.jsonl"));
        assert_eq!(
            layout.attempts_log(),
            tmp.path().join("commands/attempts.jsonl")
        );
        assert_eq!(
            layout.snapshot_file("workspace"),
            tmp.path().join("snapshots/workspace/snapshot.json")
        );
        assert_eq!(
            layout.trajectory_index(),
            tmp.path().join("trajectories/index.sqlite")
        );
    }

    #[tokio::test]
    async fn append_returns_contiguous_positions() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = AppendLog::open(tmp.path().join("a.jsonl"), false)
            .await
            .expect("open should succeed");

        let p1 = log.append(&Rec { n: 1 }).await.expect("append should succeed");
        let p2 = log.append(&Rec { n: 22 }).await.expect("append should succeed");

        assert_eq!(p1.offset, 0);
        assert_eq!(p2.offset, p1.length);
        assert_eq!(log.len().await, p1.length + p2.length);

        let back: Rec = log.read_at(p2).await.expect("read_at should succeed");
        assert_eq!(back, Rec { n: 22 });
    }

    #[tokio::test]
    async fn records_replay_in_append_order_and_restart() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = AppendLog::open(tmp.path().join("a.jsonl"), false)
            .await
            .expect("open should succeed");
        for n in 0..5 {
            log.append(&Rec { n }).await.expect("append should succeed");
        }

        let first: Vec<u32> = collect(&log).await.into_iter().map(|(_, r)| r.n).collect();
        let second: Vec<u32> = collect(&log).await.into_iter().map(|(_, r)| r.n).collect();
        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn open_truncates_torn_tail() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("a.jsonl");
        std::fs::write(&path, b"{\"n\":1}\n{\"n\":2}\n{\"n\":").expect("write should succeed");

        let log = AppendLog::open(&path, false).await.expect("open should succeed");
        log.append(&Rec { n: 3 }).await.expect("append should succeed");

        let all: Vec<u32> = collect(&log).await.into_iter().map(|(_, r)| r.n).collect();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reader_ignores_partial_line_written_after_open() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("a.jsonl");
        let log = AppendLog::open(&path, false).await.expect("open should succeed");
        log.append(&Rec { n: 1 }).await.expect("append should succeed");

        // Simulate a foreign torn write: bytes beyond the committed length
        // are never surfaced.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for raw append");
            f.write_all(b"{\"n\":9").expect("raw write");
        }

        let all: Vec<u32> = collect(&log).await.into_iter().map(|(_, r)| r.n).collect();
        assert_eq!(all, vec![1]);
    }

    #[tokio::test]
    async fn append_after_failed_write_starts_at_committed_length() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("a.jsonl");
        let log = AppendLog::open(&path, false).await.expect("open should succeed");
        let p1 = log.append(&Rec { n: 1 }).await.expect("append should succeed");

        // Bytes of a write that failed part way and could not be cut back.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for raw append");
            f.write_all(b"{\"n\":").expect("raw write");
        }
        log.writer.lock().await.dirty = true;

        let p2 = log.append(&Rec { n: 2 }).await.expect("append should succeed");
        assert_eq!(p2.offset, p1.length);
        let back: Rec = log.read_at(p2).await.expect("read_at should succeed");
        assert_eq!(back, Rec { n: 2 });

        let all: Vec<u32> = collect(&log).await.into_iter().map(|(_, r)| r.n).collect();
        assert_eq!(all, vec![1, 2]);
        let on_disk = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(on_disk, p1.length + p2.length);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_write_leaves_length_unchanged() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let log = AppendLog::open(full, false).await.expect("open should succeed");
        let err = log
            .append(&Rec { n: 1 })
            .await
            .expect_err("writing to a full device must fail");
        assert!(matches!(err, LedgerError::Io(_)), "got: {err:?}");
        assert_eq!(log.len().await, 0);
    }

    #[tokio::test]
    async fn read_at_past_end_is_corrupt() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = AppendLog::open(tmp.path().join("a.jsonl"), false)
            .await
            .expect("open should succeed");
        log.append(&Rec { n: 1 }).await.expect("append should succeed");

        let err = log
            .read_at::<Rec>(RecordPos {
                offset: 0,
                length: 400,
            })
            .await
            .expect_err("read past end should fail");
        assert!(matches!(err, LedgerError::Corrupt(_)), "got: {err:?}");
    }
}
