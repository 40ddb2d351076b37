//! Append-only JSONL event log, one file per job.
//!
//! Logs live in a central store (`{central_dir}/{job_id}.jsonl`) and each job's
//! output directory carries an `events.jsonl` alias pointing back at its log,
//! so a reader that only knows the output folders can still find every job.
//!
//! ## Crash consistency
//!
//! [`EventLog::append`] encodes the event to one line and hands it to the
//! kernel in a single `write_all` on a file opened with `O_APPEND`. Two
//! appenders (the job runner and the heartbeat task) therefore never
//! interleave bytes, and a process killed mid-write leaves at most one torn
//! line at the end of the file. The reader skips lines that fail to parse, and
//! the next append starts on a fresh line when the file does not end in `\n`.

use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::events::Event;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the per-job alias placed in the job's output directory.
pub const ALIAS_FILE_NAME: &str = "events.jsonl";

const LOG_EXTENSION: &str = "jsonl";

/// Derive a stable job id from an output directory or paper name.
///
/// Lowercases, maps spaces and dots to `-`, drops anything outside
/// `[a-z0-9_-]` and collapses repeated dashes.
pub fn job_id_for(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let c = c.to_ascii_lowercase();
        let mapped = match c {
            'a'..='z' | '0'..='9' | '_' => Some(c),
            ' ' | '.' | '-' => Some('-'),
            _ => None,
        };
        if let Some(m) = mapped {
            if m == '-' && id.ends_with('-') {
                continue;
            }
            id.push(m);
        }
    }
    let id = id.trim_matches('-').to_string();
    if id.is_empty() {
        "job".to_string()
    } else {
        id
    }
}

/// The central directory of job logs.
#[derive(Debug, Clone)]
pub struct EventStore {
    central_dir: PathBuf,
}

impl EventStore {
    pub fn new(central_dir: impl Into<PathBuf>) -> Self {
        Self {
            central_dir: central_dir.into(),
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(config.central_dir.clone())
    }

    pub fn central_dir(&self) -> &Path {
        &self.central_dir
    }

    /// Canonical log location for a job.
    pub fn locate(&self, job_id: &str) -> PathBuf {
        self.central_dir.join(format!("{job_id}.{LOG_EXTENSION}"))
    }

    /// Open the log for a job, creating the store directory and the alias
    /// inside `output_dir` when given.
    pub fn open(&self, job_id: &str, output_dir: Option<&Path>) -> Result<EventLog, TelemetryError> {
        fs::create_dir_all(&self.central_dir).map_err(|source| TelemetryError::StoreUnavailable {
            path: self.central_dir.clone(),
            source,
        })?;
        let log = EventLog {
            job_id: job_id.to_string(),
            path: self.locate(job_id),
        };
        if let Some(dir) = output_dir {
            create_alias(&log.path, &alias_path(dir));
        }
        Ok(log)
    }

    /// Every `(job_id, path)` log in the store, sorted by job id.
    ///
    /// A missing store directory simply has no logs.
    pub fn list_logs(&self) -> Result<Vec<(String, PathBuf)>, TelemetryError> {
        let entries = match fs::read_dir(&self.central_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(TelemetryError::ReadFailed {
                    path: self.central_dir.clone(),
                    source,
                })
            }
        };

        let mut logs: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|e| e == LOG_EXTENSION))
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?.to_string();
                Some((stem, path))
            })
            .collect();
        logs.sort();
        Ok(logs)
    }
}

/// Alias location inside a job's output directory.
pub fn alias_path(output_dir: &Path) -> PathBuf {
    output_dir.join(ALIAS_FILE_NAME)
}

#[cfg(unix)]
fn create_alias(target: &Path, alias: &Path) {
    match fs::read_link(alias) {
        Ok(existing) if existing == target => return,
        Ok(existing) => {
            warn!(
                "Alias {} points at {}, not {}; leaving it in place",
                alias.display(),
                existing.display(),
                target.display()
            );
            return;
        }
        Err(_) if alias.exists() => {
            warn!("{} exists and is not a link; alias not created", alias.display());
            return;
        }
        Err(_) => {}
    }
    if let Some(parent) = alias.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Cannot create {}: {}", parent.display(), e);
            return;
        }
    }
    match std::os::unix::fs::symlink(target, alias) {
        Ok(()) => debug!("Linked {} → {}", alias.display(), target.display()),
        Err(e) => warn!("Failed to create alias {}: {}", alias.display(), e),
    }
}

#[cfg(not(unix))]
fn create_alias(target: &Path, alias: &Path) {
    warn!(
        "Symlinks unavailable on this platform; {} will not alias {}",
        alias.display(),
        target.display()
    );
}

/// Write handle for one job's log.
///
/// Cheap to clone; each clone appends independently.
#[derive(Debug, Clone)]
pub struct EventLog {
    job_id: String,
    path: PathBuf,
}

impl EventLog {
    /// Handle on an existing path, without touching the store or aliases.
    pub fn at(job_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            path: path.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as one line.
    pub fn append(&self, event: &Event) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.open_for_append()?;
        let torn_tail = ends_without_newline(&mut file).map_err(|source| self.append_err(source))?;
        if torn_tail {
            warn!("{} ends with a partial line; starting a new one", self.path.display());
            line.insert(0, b'\n');
        }
        file.write_all(&line).map_err(|source| self.append_err(source))?;
        debug!("{} ← {}", self.job_id, event.kind());
        Ok(())
    }

    fn open_for_append(&self) -> Result<File, TelemetryError> {
        let open = || {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.path)
        };
        match open() {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent).map_err(|source| TelemetryError::StoreUnavailable {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                open().map_err(|source| self.append_err(source))
            }
            Err(source) => Err(self.append_err(source)),
        }
    }

    fn append_err(&self, source: io::Error) -> TelemetryError {
        TelemetryError::AppendFailed {
            path: self.path.clone(),
            source,
        }
    }
}

fn ends_without_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Lazily parse every event of the log at `path`.
///
/// Returns `Ok(None)` when no log exists.
pub fn read_events(path: &Path) -> Result<Option<EventReader<BufReader<File>>>, TelemetryError> {
    match File::open(path) {
        Ok(file) => Ok(Some(EventReader::new(BufReader::new(file), path))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(TelemetryError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Line-by-line event parser.
///
/// Lines that do not decode as an [`Event`] are skipped with a warning and
/// counted in [`EventReader::skipped`]. Blank lines are ignored silently.
pub struct EventReader<R> {
    reader: R,
    path: PathBuf,
    buf: Vec<u8>,
    line_no: usize,
    skipped: usize,
}

impl<R: BufRead> EventReader<R> {
    pub fn new(reader: R, path: &Path) -> Self {
        Self {
            reader,
            path: path.to_path_buf(),
            buf: Vec::new(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Corrupt lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!("Stopped reading {}: {}", self.path.display(), e);
                    return None;
                }
            }
            self.line_no += 1;

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Event>(line) {
                Ok(event) => return Some(event),
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        "Skipping corrupt line {} in {}: {}",
                        self.line_no,
                        self.path.display(),
                        e
                    );
                }
            }
        }
    }
}

/// Incremental reader yielding only events appended since the previous poll.
///
/// Only complete (`\n`-terminated) lines are consumed; a line still being
/// written is picked up on a later poll.
#[derive(Debug)]
pub struct EventTail {
    path: PathBuf,
    offset: u64,
}

impl EventTail {
    /// Start at the current end of the log, so only future events are seen.
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }

    pub fn poll(&mut self) -> Result<Vec<Event>, TelemetryError> {
        let read_err = |source| TelemetryError::ReadFailed {
            path: self.path.clone(),
            source,
        };
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(e)),
        };
        let len = file.metadata().map_err(read_err)?.len();
        if len < self.offset {
            warn!("{} shrank to {} bytes; tailing from the start", self.path.display(), len);
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset)).map_err(read_err)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(read_err)?;

        let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &bytes[..=last_newline];
        self.offset += complete.len() as u64;
        Ok(EventReader::new(complete, &self.path).collect())
    }
}
