//! Persistent read/send progress, keyed by inode.
//!
//! For every inode a reader has touched we keep the highest read position and
//! the byte ranges the sink acknowledged. Anything between them that was read
//! but never acknowledged is a "leaked" range and is replayed on startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::fileid;

/// Half-open byte range `[begin, end)` within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRange {
    pub begin: u64,
    pub end: u64,
}

impl ReadRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a chunk came from, and whether the sink accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    pub inode: u64,
    pub range: ReadRange,
    pub succeeded: bool,
    /// The inode's state generation when the chunk was read.
    pub generation: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderState {
    pub pos: u64,
    pub path: PathBuf,
    pub send_ranges: Vec<ReadRange>,
    /// Bumped whenever progress is discarded; updates from an older
    /// generation are ignored.
    #[serde(default)]
    pub generation: u32,
}

impl ReaderState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            pos: 0,
            path: path.into(),
            send_ranges: Vec::new(),
            generation: 0,
        }
    }

    pub fn add_send_range(&mut self, range: ReadRange) {
        self.send_ranges.push(range);
    }

    /// Advance the read position; it never moves backwards.
    pub fn update_pos(&mut self, range: &ReadRange) {
        if self.pos < range.end {
            self.pos = range.end;
        }
    }

    /// Sort send ranges and merge the ones that touch.
    pub fn compact(&mut self) {
        self.send_ranges.sort_by_key(|r| r.begin);
        if self.send_ranges.len() <= 1 {
            return;
        }

        let mut merged: Vec<ReadRange> = Vec::with_capacity(self.send_ranges.len());
        for range in self.send_ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end == range.begin => last.end = range.end,
                _ => merged.push(range),
            }
        }
        self.send_ranges = merged;
    }

    /// Ranges below `pos` that are not covered by a send range.
    ///
    /// Expects `send_ranges` to be compacted.
    pub fn leaked_ranges(&self) -> Vec<ReadRange> {
        let mut leaked = Vec::new();

        let (first, last) = match (self.send_ranges.first(), self.send_ranges.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                if self.pos != 0 {
                    leaked.push(ReadRange::new(0, self.pos));
                }
                return leaked;
            }
        };

        if first.begin != 0 {
            leaked.push(ReadRange::new(0, first.begin));
        }
        for pair in self.send_ranges.windows(2) {
            if pair[0].end != pair[1].begin {
                leaked.push(ReadRange::new(pair[0].end, pair[1].begin));
            }
        }
        if last.end < self.pos {
            leaked.push(ReadRange::new(last.end, self.pos));
        }

        leaked
    }

    /// Everything read has been acknowledged.
    pub fn fully_sent(&self) -> bool {
        self.leaked_ranges().is_empty()
    }

    /// Forget all progress (the inode now names a different file, or it was truncated).
    pub fn reset(&mut self) {
        self.pos = 0;
        self.send_ranges.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Errors from loading or persisting state.
#[derive(Debug)]
pub enum StateError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize { source: serde_json::Error },
    Locked { path: PathBuf },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Io { path, source } => {
                write!(f, "state file I/O error at {}: {}", path.display(), source)
            }
            StateError::Parse { path, source } => {
                write!(f, "failed to parse state file {}: {}", path.display(), source)
            }
            StateError::Serialize { source } => {
                write!(f, "failed to serialize state: {}", source)
            }
            StateError::Locked { path } => {
                write!(
                    f,
                    "state file {} is locked by another logship process",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Io { source, .. } => Some(source),
            StateError::Parse { source, .. } => Some(source),
            StateError::Serialize { source } => Some(source),
            StateError::Locked { .. } => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |e| StateError::Io {
        path: path.to_path_buf(),
        source: e,
    }
}

#[derive(Debug, Default)]
struct Inner {
    readers: BTreeMap<u64, ReaderState>,
    /// Inodes with a running reader; never compacted away.
    live: BTreeSet<u64>,
}

/// All reader states, persisted as pretty JSON keyed by inode.
#[derive(Debug)]
pub struct FileState {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileState {
    /// An empty, unpersisted state bound to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Load state from `path`, creating an empty state file if none exists.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "creating state file");
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(io_err(path))?;
            }
            let state = Self::new(path);
            state.dump()?;
            return Ok(state);
        }

        let contents = std::fs::read_to_string(path).map_err(io_err(path))?;
        let readers: BTreeMap<u64, ReaderState> = if contents.trim().is_empty() {
            tracing::warn!(path = %path.display(), "state file is empty, starting fresh");
            BTreeMap::new()
        } else {
            serde_json::from_str(&contents).map_err(|e| StateError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?
        };

        tracing::info!(
            path = %path.display(),
            readers = readers.len(),
            "loaded state"
        );
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                readers,
                live: BTreeSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoning is ignored: no critical section leaves the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compact and atomically write the state file (temp file + rename).
    pub fn dump(&self) -> Result<(), StateError> {
        let json = {
            let mut inner = self.lock();
            inner.compact();
            serde_json::to_string_pretty(&inner.readers)
                .map_err(|e| StateError::Serialize { source: e })?
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(&self.path))?;
        tmp.write_all(json.as_bytes()).map_err(io_err(&self.path))?;
        tmp.as_file().sync_all().map_err(io_err(&self.path))?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(&self.path)(e.error))?;
        Ok(())
    }

    /// Record the outcome of sending one chunk. Chunks read before the
    /// inode's progress was discarded are ignored.
    pub fn update(&self, info: &SendInfo) {
        let mut inner = self.lock();
        let state = inner.readers.entry(info.inode).or_insert_with(|| ReaderState {
            generation: info.generation,
            ..ReaderState::default()
        });
        if state.generation != info.generation {
            tracing::debug!(
                inode = info.inode,
                begin = info.range.begin,
                end = info.range.end,
                stale = info.generation,
                current = state.generation,
                "ignoring update from before a reset"
            );
            return;
        }
        if info.succeeded {
            state.add_send_range(info.range);
            state.compact();
        }
        state.update_pos(&info.range);
    }

    pub fn get(&self, inode: u64) -> Option<ReaderState> {
        self.lock().readers.get(&inode).cloned()
    }

    /// Fetch the state for `inode`, creating it for `path` if missing.
    pub fn get_or_create(&self, inode: u64, path: &Path) -> ReaderState {
        let mut inner = self.lock();
        let state = inner
            .readers
            .entry(inode)
            .or_insert_with(|| ReaderState::new(path));
        if state.path.as_os_str().is_empty() {
            state.path = path.to_path_buf();
        }
        state.clone()
    }

    /// Like `get_or_create`, and pins the entry until `release` is called.
    pub fn acquire(&self, inode: u64, path: &Path) -> ReaderState {
        let state = self.get_or_create(inode, path);
        self.lock().live.insert(inode);
        state
    }

    pub fn release(&self, inode: u64) {
        self.lock().live.remove(&inode);
    }

    /// Replace the state for `inode`.
    pub fn put(&self, inode: u64, state: ReaderState) {
        self.lock().readers.insert(inode, state);
    }

    pub fn len(&self) -> usize {
        self.lock().readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Drop entries that are fully sent, not being read, and whose path now
    /// names another file.
    fn compact(&mut self) {
        let live = &self.live;
        self.readers.retain(|inode, state| {
            if live.contains(inode) || !state.fully_sent() {
                return true;
            }
            let keep = fileid::inode_of(&state.path) == Some(*inode);
            if !keep {
                tracing::debug!(
                    inode,
                    path = %state.path.display(),
                    "dropping state for fully sent rotated file"
                );
            }
            keep
        });
    }
}

/// Exclusive advisory lock on `<state>.lock`, held for the agent's lifetime.
#[derive(Debug)]
pub struct StateLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(state_path: &Path) -> Result<Self, StateError> {
        use fs2::FileExt;

        let mut lock_name = state_path.as_os_str().to_os_string();
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(&path))?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.try_lock_exclusive()
            .map_err(|_| StateError::Locked { path: path.clone() })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn r(begin: u64, end: u64) -> ReadRange {
        ReadRange::new(begin, end)
    }

    fn rstate(pos: u64, ranges: &[ReadRange]) -> ReaderState {
        ReaderState {
            pos,
            path: PathBuf::new(),
            send_ranges: ranges.to_vec(),
            generation: 0,
        }
    }

    #[test]
    fn test_load_creates_missing_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.state");
        let state = FileState::load(&path).unwrap();
        assert!(state.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_load_and_dump_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state");
        let log1 = dir.path().join("test1.log").display().to_string();
        let log2 = dir.path().join("test2.log").display().to_string();
        let content = format!(
            r#"{{
  "6406163": {{"path": "{log1}", "pos": 5119, "send_ranges": [{{"begin": 0, "end": 5119}}]}},
  "6421632": {{"path": "{log1}", "pos": 3071,
               "send_ranges": [{{"begin": 0, "end": 1023}}, {{"begin": 2048, "end": 3071}}]}},
  "6414379": {{"path": "{log2}", "pos": 3071, "send_ranges": [{{"begin": 1024, "end": 2047}}]}}
}}"#
        );
        std::fs::write(&path, content).unwrap();

        let state = FileState::load(&path).unwrap();
        let partial = state.get(6421632).unwrap();
        assert_eq!(partial.send_ranges, vec![r(0, 1023), r(2048, 3071)]);
        state.dump().unwrap();

        let reloaded = FileState::load(&path).unwrap();
        // 6406163 is fully sent and its path does not resolve to that inode;
        // the other two still have unacknowledged ranges.
        assert_eq!(reloaded.get(6406163), None);
        assert_eq!(reloaded.get(6421632), state.get(6421632));
        assert_eq!(reloaded.get(6414379), state.get(6414379));
    }

    #[test]
    fn test_load_empty_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state");
        std::fs::write(&path, "").unwrap();
        assert!(FileState::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileState::load(&path).unwrap_err(),
            StateError::Parse { .. }
        ));
    }

    #[test]
    fn test_get_and_create_reader_state() {
        let state = FileState::new("unused");
        assert_eq!(state.get(1_000_000), None);
        let rs = state.get_or_create(1_000_000, Path::new("hoge.log"));
        assert_eq!(rs.path, PathBuf::from("hoge.log"));
        assert_eq!(state.get(1_000_000), Some(rs));
    }

    #[test]
    fn test_update_tracks_pos_and_send_ranges() {
        let state = FileState::new("unused");
        let inode = 10_000;
        let info = |begin, end, succeeded| SendInfo {
            inode,
            range: r(begin, end),
            succeeded,
            generation: 0,
        };

        state.update(&info(0, 10, true));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.pos, 10);
        assert_eq!(rs.send_ranges, vec![r(0, 10)]);

        state.update(&info(10, 20, false));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.pos, 20);
        assert_eq!(rs.send_ranges, vec![r(0, 10)]);

        state.update(&info(20, 30, true));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.pos, 30);
        assert_eq!(rs.send_ranges, vec![r(0, 10), r(20, 30)]);
        assert_eq!(rs.leaked_ranges(), vec![r(10, 20)]);

        // The retried chunk fills the hole.
        state.update(&info(10, 20, true));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.pos, 30);
        assert_eq!(rs.send_ranges, vec![r(0, 30)]);
        assert!(rs.leaked_ranges().is_empty());
    }

    #[test]
    fn test_update_pos_never_moves_backwards() {
        let mut rs = ReaderState::new("a.log");
        rs.update_pos(&r(0, 50));
        rs.update_pos(&r(10, 20));
        assert_eq!(rs.pos, 50);
    }

    #[test]
    fn test_reader_state_compact() {
        let mut rs = ReaderState::new("a.log");
        rs.add_send_range(r(0, 10));
        rs.compact();
        assert_eq!(rs.send_ranges, vec![r(0, 10)]);

        rs.add_send_range(r(20, 30));
        rs.compact();
        assert_eq!(rs.send_ranges, vec![r(0, 10), r(20, 30)]);

        rs.add_send_range(r(10, 20));
        rs.compact();
        assert_eq!(rs.send_ranges, vec![r(0, 30)]);
    }

    #[test]
    fn test_leaked_ranges() {
        let cases: Vec<(ReaderState, Vec<ReadRange>)> = vec![
            (rstate(0, &[]), vec![]),
            (rstate(4, &[]), vec![r(0, 4)]),
            (rstate(4, &[r(0, 4)]), vec![]),
            (rstate(4, &[r(2, 4)]), vec![r(0, 2)]),
            (rstate(6, &[r(0, 2), r(4, 6)]), vec![r(2, 4)]),
            (rstate(6, &[r(0, 4)]), vec![r(4, 6)]),
            (rstate(9, &[r(1, 2), r(4, 6)]), vec![r(0, 1), r(2, 4), r(6, 9)]),
        ];

        for (rs, expected) in cases {
            assert_eq!(rs.leaked_ranges(), expected, "state: {rs:?}");
        }
    }

    #[test]
    fn test_compact_keeps_live_file_state() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("live.log");
        std::fs::write(&log, "abc\n").unwrap();
        let inode = fileid::inode_of(&log).unwrap();

        let state = FileState::new(dir.path().join("s.json"));
        state.get_or_create(inode, &log);
        state.update(&SendInfo {
            inode,
            range: r(0, 4),
            succeeded: true,
            generation: 0,
        });
        state.lock().compact();
        assert!(state.get(inode).is_some());

        std::fs::rename(&log, dir.path().join("live.log.1")).unwrap();
        state.lock().compact();
        assert!(state.get(inode).is_none());
    }

    #[test]
    fn test_compact_skips_acquired_inodes() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("live.log");
        std::fs::write(&log, "abc\n").unwrap();
        let inode = fileid::inode_of(&log).unwrap();

        let state = FileState::new(dir.path().join("s.json"));
        state.acquire(inode, &log);
        state.update(&SendInfo {
            inode,
            range: r(0, 4),
            succeeded: true,
            generation: 0,
        });
        std::fs::remove_file(&log).unwrap();

        state.lock().compact();
        assert!(state.get(inode).is_some());

        state.release(inode);
        state.lock().compact();
        assert!(state.get(inode).is_none());
    }

    #[test]
    fn test_update_ignores_chunks_from_before_reset() {
        let state = FileState::new("unused");
        let inode = 7;
        let info = |begin, end, generation| SendInfo {
            inode,
            range: r(begin, end),
            succeeded: true,
            generation,
        };

        state.update(&info(0, 10, 0));
        let mut truncated = state.get(inode).unwrap();
        truncated.reset();
        state.put(inode, truncated);

        state.update(&info(10, 20, 0));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.generation, 1);
        assert_eq!(rs.pos, 0);
        assert!(rs.send_ranges.is_empty());

        state.update(&info(0, 2, 1));
        let rs = state.get(inode).unwrap();
        assert_eq!(rs.pos, 2);
        assert_eq!(rs.send_ranges, vec![r(0, 2)]);
    }

    #[test]
    fn test_state_without_generation_loads_as_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.state");
        std::fs::write(
            &path,
            r#"{"42": {"pos": 5, "path": "/tmp/a.log", "send_ranges": [{"begin": 0, "end": 5}]}}"#,
        )
        .unwrap();
        let rs = FileState::load(&path).unwrap().get(42).unwrap();
        assert_eq!(rs.generation, 0);
        assert_eq!(rs.pos, 5);
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut rs = rstate(100, &[r(0, 100)]);
        rs.reset();
        assert_eq!(rs.pos, 0);
        assert!(rs.send_ranges.is_empty());
    }

    #[test]
    fn test_state_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let first = StateLock::acquire(&path).unwrap();
        assert!(first.path().ends_with("state.json.lock"));
        let err = StateLock::acquire(&path).unwrap_err();
        assert!(matches!(err, StateError::Locked { .. }));
        drop(first);
        assert!(StateLock::acquire(&path).is_ok());
    }
}
