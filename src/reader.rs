//! Tails a single inode.
//!
//! A reader holds its file open for its whole life, so after the path has
//! been rotated away it keeps draining the old inode from the same handle
//! until the lifetimer expires.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::fileid;
use crate::lifetimer::LifeTimer;
use crate::metrics::{ReaderSnapshot, WatcherMetrics};
use crate::payload::Chunk;
use crate::sender::RECORD_SIZE_MAX;
use crate::state::{FileState, ReadRange, ReaderState, SendInfo};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a chunk body; a chunk must fit in one sink record.
const CHUNK_SIZE_MAX: usize = RECORD_SIZE_MAX as usize;

#[derive(Debug)]
pub enum ReaderError {
    Open {
        path: PathBuf,
        source: io::Error,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
    InodeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// A replayed range ended before its recorded end.
    ShortRead {
        path: PathBuf,
        range: ReadRange,
        read: u64,
    },
    Closed {
        path: PathBuf,
    },
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::Open { path, source } => {
                write!(f, "failed to open {}: {}", path.display(), source)
            }
            ReaderError::Io { path, source } => {
                write!(f, "I/O error reading {}: {}", path.display(), source)
            }
            ReaderError::InodeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "{} is inode {}, expected {}",
                path.display(),
                actual,
                expected
            ),
            ReaderError::ShortRead { path, range, read } => write!(
                f,
                "short read of {} [{}, {}): got {} bytes",
                path.display(),
                range.begin,
                range.end,
                read
            ),
            ReaderError::Closed { path } => write!(f, "reader for {} is closed", path.display()),
        }
    }
}

impl std::error::Error for ReaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReaderError::Open { source, .. } | ReaderError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Append-only destination for lines too long to ship, shared by all readers.
#[derive(Debug, Clone)]
pub struct BackupFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl BackupFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `len` bytes at `begin` of `src` without moving its cursor.
    fn append_from(&self, src: &File, begin: u64, len: u64) -> io::Result<()> {
        let mut out = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = vec![0u8; (len as usize).min(READ_BUFFER_SIZE)];
        let end = begin + len;
        let mut at = begin;
        while at < end {
            let want = ((end - at) as usize).min(buf.len());
            let n = src.read_at(&mut buf[..want], at)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            out.write_all(&buf[..n])?;
            at += n as u64;
        }
        out.flush()
    }
}

enum Line {
    Eof,
    /// Bytes without a terminating newline yet.
    Partial,
    Complete(u64),
    /// A line longer than the limit; only its length is reported.
    Oversized(u64),
}

/// Read the next line into `line`, buffering at most `limit` bytes of it.
fn next_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> io::Result<Line> {
    line.clear();
    let mut total = 0u64;
    let mut oversized = false;
    loop {
        let (used, done) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(if total == 0 { Line::Eof } else { Line::Partial });
            }
            let (used, done) = match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), false),
            };
            if !oversized {
                if line.len() + used > limit {
                    oversized = true;
                    line.clear();
                } else {
                    line.extend_from_slice(&buf[..used]);
                }
            }
            (used, done)
        };
        reader.consume(used);
        total += used as u64;
        if done {
            return Ok(if oversized {
                Line::Oversized(total)
            } else {
                Line::Complete(total)
            });
        }
    }
}

struct Scan {
    consumed: u64,
    body: Vec<u8>,
}

pub struct FileReader {
    path: PathBuf,
    inode: u64,
    file: Option<File>,
    pos: u64,
    /// Includes the trailing newline.
    max_line_bytes: u64,
    backup: Option<BackupFile>,
    lifetimer: LifeTimer,
    truncated: bool,
    /// Stamped on every chunk; see `ReaderState::generation`.
    generation: u32,
}

impl FileReader {
    /// Open `path` and check that it still is `inode`.
    pub fn open(path: &Path, inode: u64) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|e| ReaderError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let actual = fileid::inode_of_file(&file).map_err(|e| ReaderError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        if actual != inode {
            return Err(ReaderError::InodeMismatch {
                path: path.to_path_buf(),
                expected: inode,
                actual,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            inode,
            file: Some(file),
            pos: 0,
            max_line_bytes: RECORD_SIZE_MAX,
            backup: None,
            lifetimer: LifeTimer::new(path, inode),
            truncated: false,
            generation: 0,
        })
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetimer = self.lifetimer.with_lifetime(lifetime);
        self
    }

    pub fn with_backup(mut self, backup: Option<BackupFile>) -> Self {
        self.backup = backup;
        self
    }

    /// Capped at the record size max: a shipped line must fit in one record.
    pub fn with_max_line_bytes(mut self, max_line_bytes: u64) -> Self {
        self.max_line_bytes = max_line_bytes.clamp(1, RECORD_SIZE_MAX);
        self
    }

    /// The path no longer names this reader's inode.
    pub fn rotated(&self) -> bool {
        fileid::moved(&self.path, self.inode)
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// True once after a read noticed the file shrank below the read position.
    pub fn take_truncated(&mut self) -> bool {
        std::mem::take(&mut self.truncated)
    }

    fn file(&self) -> Result<&File, ReaderError> {
        self.file.as_ref().ok_or_else(|| ReaderError::Closed {
            path: self.path.clone(),
        })
    }

    fn io_err(&self, source: io::Error) -> ReaderError {
        ReaderError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn chunk(&self, begin: u64, scan: Scan) -> Chunk {
        Chunk {
            send_info: SendInfo {
                inode: self.inode,
                range: ReadRange::new(begin, begin + scan.consumed),
                succeeded: false,
                generation: self.generation,
            },
            body: scan.body,
        }
    }

    /// Read complete lines starting at `begin`, looking at no more than
    /// `limit` bytes and collecting at most one chunk's worth of body.
    fn scan(&self, begin: u64, limit: u64) -> Result<Scan, ReaderError> {
        let mut handle = self.file()?;
        handle
            .seek(SeekFrom::Start(begin))
            .map_err(|e| self.io_err(e))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, handle.take(limit));

        let max_line = self.max_line_bytes as usize;
        let mut body = Vec::new();
        let mut consumed = 0u64;
        let mut line = Vec::new();
        loop {
            match next_line(&mut reader, &mut line, max_line).map_err(|e| self.io_err(e))? {
                Line::Eof | Line::Partial => break,
                Line::Complete(len) => {
                    if body.len() + line.len() > CHUNK_SIZE_MAX {
                        break;
                    }
                    body.extend_from_slice(&line);
                    consumed += len;
                }
                Line::Oversized(len) => {
                    self.divert(begin + consumed, len)?;
                    consumed += len;
                }
            }
        }
        Ok(Scan { consumed, body })
    }

    fn divert(&self, begin: u64, len: u64) -> Result<(), ReaderError> {
        warn!(
            inode = self.inode,
            path = %self.path.display(),
            offset = begin,
            bytes = len,
            max_line_bytes = self.max_line_bytes,
            "line too long, not shipping it"
        );
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.append_from(self.file()?, begin, len) {
                error!(
                    backup = %backup.path().display(),
                    error = %e,
                    "failed to write oversized line to backup"
                );
            }
        }
        Ok(())
    }

    /// Read the complete lines appended since the last call.
    ///
    /// A trailing line without its newline is left for the next call.
    pub fn read_lines(&mut self) -> Result<Option<Chunk>, ReaderError> {
        let len = self
            .file()?
            .metadata()
            .map_err(|e| self.io_err(e))?
            .len();
        if len < self.pos {
            warn!(
                inode = self.inode,
                path = %self.path.display(),
                pos = self.pos,
                len,
                "file truncated, reading from the start"
            );
            self.pos = 0;
            self.truncated = true;
            self.generation = self.generation.wrapping_add(1);
        }
        if len == self.pos {
            return Ok(None);
        }

        let begin = self.pos;
        let scan = self.scan(begin, len - begin)?;
        if scan.consumed == 0 {
            return Ok(None);
        }
        self.pos = begin + scan.consumed;
        Ok(Some(self.chunk(begin, scan)))
    }

    /// Re-send every range of `state` that was read but never acknowledged,
    /// then continue from `state.pos`.
    pub async fn initial_read(
        &mut self,
        state: &ReaderState,
        chunk_tx: &mpsc::Sender<Chunk>,
    ) -> Result<(), ReaderError> {
        let mut state = state.clone();
        state.compact();
        self.generation = state.generation;

        for range in state.leaked_ranges() {
            info!(
                inode = self.inode,
                path = %self.path.display(),
                begin = range.begin,
                end = range.end,
                "replaying unacknowledged range"
            );
            let mut at = range.begin;
            while at < range.end {
                let scan = self.scan(at, range.end - at)?;
                if scan.consumed == 0 {
                    return Err(ReaderError::ShortRead {
                        path: self.path.clone(),
                        range,
                        read: at - range.begin,
                    });
                }
                let chunk = self.chunk(at, scan);
                at = chunk.send_info.range.end;
                if chunk_tx.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
        }

        self.pos = state.pos;
        Ok(())
    }

    /// Tail the file until it has been rotated away and drained, shutdown is
    /// signalled, or the chunk channel closes.
    pub async fn run(
        mut self,
        state: ReaderState,
        file_state: Arc<FileState>,
        interval: Duration,
        chunk_tx: mpsc::Sender<Chunk>,
        mut shutdown: watch::Receiver<bool>,
        metrics: WatcherMetrics,
    ) {
        let inode = self.inode;
        if let Err(e) = self.initial_read(&state, &chunk_tx).await {
            error!(inode, path = %self.path.display(), error = %e, "replay failed, reader exiting");
            metrics.remove_reader(inode);
            return;
        }
        info!(inode, path = %self.path.display(), pos = self.pos, "reader started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let (chunk, failed) = match self.read_lines() {
                Ok(chunk) => (chunk, false),
                Err(e) => {
                    warn!(inode, path = %self.path.display(), error = %e, "read failed");
                    (None, true)
                }
            };
            if self.take_truncated() {
                file_state.put(
                    inode,
                    ReaderState {
                        generation: self.generation,
                        ..ReaderState::new(&self.path)
                    },
                );
            }

            let rotated = self.rotated();
            if (failed || rotated) && self.lifetimer.should_die() && chunk.is_none() {
                info!(inode, path = %self.path.display(), pos = self.pos, "rotated file drained, reader exiting");
                break;
            }

            metrics.set_reader(
                inode,
                ReaderSnapshot {
                    pos: self.pos,
                    path: self.path.clone(),
                    rotated,
                },
            );

            if let Some(chunk) = chunk {
                debug!(
                    inode,
                    begin = chunk.send_info.range.begin,
                    end = chunk.send_info.range.end,
                    bytes = chunk.size(),
                    "read chunk"
                );
                if chunk_tx.send(chunk).await.is_err() {
                    debug!(inode, "chunk channel closed, reader exiting");
                    break;
                }
            }
        }

        self.close();
        metrics.remove_reader(inode);
    }
}
