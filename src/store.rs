//! Durable, append-only storage for raw OpenAlex records.
//!
//! Layout for a log at `collected_data.jsonl`:
//! - `collected_data.jsonl` - one raw record per line
//! - `collected_data.jsonl.checkpoints` - one [`Checkpoint`] per committed page
//! - `collected_data.jsonl.lock` - present while a writer owns the log
//!
//! A page is committed once its checkpoint line is synced. Bytes past the last
//! checkpoint belong to a page that never committed and are cut on resume.

use crate::error::{PipelineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default file name of the raw record log inside a search folder
pub const RECORDS_FILE: &str = "collected_data.jsonl";

fn sibling(log: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = log.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    log.with_file_name(name)
}

/// Path of the checkpoint log that belongs to `log`
pub fn checkpoint_path(log: &Path) -> PathBuf {
    sibling(log, ".checkpoints")
}

/// Path of the writer lock that belongs to `log`
pub fn lock_path(log: &Path) -> PathBuf {
    sibling(log, ".lock")
}

/// State after one committed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 1-based page number
    pub page: usize,
    /// Records committed so far, all pages
    pub records: usize,
    /// Committed length of the record log in bytes
    pub bytes: u64,
    /// Cursor for the next page; `None` once the end of results was reached
    pub next_cursor: Option<String>,
    /// Filter of the query that produced the log
    pub filter: String,
    /// RFC 3339 timestamp
    pub recorded_at: String,
}

impl Checkpoint {
    pub fn is_final(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Exclusive ownership of a log for the lifetime of the writer.
#[derive(Debug)]
struct DestinationLock {
    path: PathBuf,
}

impl DestinationLock {
    fn acquire(log: &Path) -> Result<Self> {
        let path = lock_path(log);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(path = ?path, "Acquired destination lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::Validation(format!(
                "{} is in use by another fetch (remove {} if that fetch is gone)",
                log.display(),
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Failed to release destination lock");
        }
    }
}

/// Append-only writer for raw records.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    records: File,
    checkpoints: File,
    filter: String,
    pages: usize,
    total_records: usize,
    bytes: u64,
    _lock: DestinationLock,
}

impl RecordLog {
    /// Start a new log. Fails if `path` already exists.
    pub fn create(path: &Path, filter: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let lock = DestinationLock::acquire(path)?;

        let records = match OpenOptions::new().append(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::Validation(format!(
                    "{} already exists; resume it or pick a fresh destination",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        // A checkpoint file without its record log belongs to no crawl.
        let checkpoints = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(checkpoint_path(path))?;

        info!(path = ?path, "Created record log");
        Ok(Self {
            path: path.to_path_buf(),
            records,
            checkpoints,
            filter: filter.to_string(),
            pages: 0,
            total_records: 0,
            bytes: 0,
            _lock: lock,
        })
    }

    /// Reopen an existing log after its last committed page.
    ///
    /// Returns the last checkpoint, or `None` when no page was committed.
    /// Falls back to [`RecordLog::create`] if the log does not exist yet.
    pub fn resume(path: &Path, filter: &str) -> Result<(Self, Option<Checkpoint>)> {
        if !path.exists() {
            return Ok((Self::create(path, filter)?, None));
        }
        let lock = DestinationLock::acquire(path)?;

        let last = read_checkpoints(path)?.pop();
        if let Some(cp) = &last {
            if cp.filter != filter {
                return Err(PipelineError::Validation(format!(
                    "{} was written by a different search (filter {:?})",
                    path.display(),
                    cp.filter
                )));
            }
        }

        let committed = last.as_ref().map(|cp| cp.bytes).unwrap_or(0);
        let records = OpenOptions::new().append(true).open(path)?;
        let len = records.metadata()?.len();
        if len < committed {
            return Err(PipelineError::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "{} is shorter ({} bytes) than its last checkpoint ({} bytes)",
                    path.display(),
                    len,
                    committed
                ),
            )));
        }
        if len > committed {
            warn!(
                path = ?path,
                discarded_bytes = len - committed,
                "Discarding uncommitted tail of record log"
            );
            records.set_len(committed)?;
            records.sync_data()?;
        }

        let checkpoints = OpenOptions::new()
            .append(true)
            .create(true)
            .open(checkpoint_path(path))?;

        let log = Self {
            path: path.to_path_buf(),
            records,
            checkpoints,
            filter: filter.to_string(),
            pages: last.as_ref().map(|cp| cp.page).unwrap_or(0),
            total_records: last.as_ref().map(|cp| cp.records).unwrap_or(0),
            bytes: committed,
            _lock: lock,
        };
        info!(
            path = ?path,
            pages = log.pages,
            records = log.total_records,
            "Resumed record log"
        );
        Ok((log, last))
    }

    /// Append one page and commit it. Returns once both files are synced.
    pub fn append_page(&mut self, page: &[Value], next_cursor: Option<&str>) -> Result<Checkpoint> {
        let mut buf = Vec::new();
        for record in page {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.records.write_all(&buf)?;
        self.records.sync_data()?;

        let checkpoint = Checkpoint {
            page: self.pages + 1,
            records: self.total_records + page.len(),
            bytes: self.bytes + buf.len() as u64,
            next_cursor: next_cursor.map(str::to_string),
            filter: self.filter.clone(),
            recorded_at: Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_vec(&checkpoint)?;
        line.push(b'\n');
        self.checkpoints.write_all(&line)?;
        self.checkpoints.sync_data()?;

        // Counters only move once the page is committed.
        self.pages = checkpoint.page;
        self.total_records = checkpoint.records;
        self.bytes = checkpoint.bytes;

        debug!(page = self.pages, records = page.len(), total = self.total_records, "Committed page");
        Ok(checkpoint)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages committed, including pages from before a resume
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Records committed, including records from before a resume
    pub fn records(&self) -> usize {
        self.total_records
    }
}

/// Read every complete checkpoint of `log`. Torn lines are skipped.
pub fn read_checkpoints(log: &Path) -> Result<Vec<Checkpoint>> {
    let path = checkpoint_path(log);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for line in BufReader::new(File::open(&path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Checkpoint>(&line) {
            Ok(cp) => checkpoints.push(cp),
            Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable checkpoint line"),
        }
    }
    Ok(checkpoints)
}

/// One line of the record log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Record(Value),
    /// Not valid JSON, e.g. a torn trailing write
    Malformed { line: usize, reason: String },
}

/// Streaming reader over a record log. Blank lines are skipped.
pub struct RecordReader<R> {
    reader: R,
    line: usize,
    buf: Vec<u8>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line += 1;
                    let text = String::from_utf8_lossy(&self.buf);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let entry = match serde_json::from_str::<Value>(text) {
                        Ok(value) => LogEntry::Record(value),
                        Err(e) => LogEntry::Malformed {
                            line: self.line,
                            reason: e.to_string(),
                        },
                    };
                    return Some(Ok(entry));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Open a record log for reading from the start.
pub fn open_records(path: &Path) -> Result<RecordReader<BufReader<File>>> {
    Ok(RecordReader::new(BufReader::new(File::open(path)?)))
}
