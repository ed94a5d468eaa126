//! Finds files to tail and keeps one reader running per inode.
//!
//! Parent directories are watched with `notify` so a freshly rotated-in file
//! is picked up promptly; a rescan on every tick covers missed events.

use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher as _};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::fileid;
use crate::metrics::WatcherMetrics;
use crate::payload::Chunk;
use crate::reader::{BackupFile, FileReader};
use crate::state::FileState;

/// Expand watch patterns to the regular files they currently match.
///
/// A directory stands for every file directly inside it.
pub fn expand_paths(patterns: &[String]) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        let pattern = if Path::new(pattern).is_dir() {
            Path::new(pattern).join("*").to_string_lossy().into_owned()
        } else {
            pattern.clone()
        };
        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid watch pattern");
                continue;
            }
        };
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => {
                    found.insert(path);
                }
                Ok(_) => {}
                Err(e) => debug!(pattern = %pattern, error = %e, "skipping unreadable path"),
            }
        }
    }
    found.into_iter().collect()
}

/// Closest directory above `pattern` that contains no glob metacharacters.
fn watch_dir(pattern: &str) -> Option<PathBuf> {
    let path = Path::new(pattern);
    if path.is_dir() {
        return Some(path.to_path_buf());
    }
    let mut dir = path.parent()?;
    while dir.to_string_lossy().contains(&['*', '?', '['][..]) {
        dir = dir.parent()?;
    }
    if dir.as_os_str().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(dir.to_path_buf())
    }
}

fn wants_rescan(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Other
            | EventKind::Any
    )
}

struct ReaderHandle {
    path: PathBuf,
    handle: JoinHandle<()>,
}

pub struct FileWatcher {
    patterns: Vec<String>,
    read_interval: Duration,
    lifetime: Duration,
    max_line_bytes: u64,
    backup: Option<BackupFile>,
    state: Arc<FileState>,
    chunk_tx: mpsc::Sender<Chunk>,
    metrics: WatcherMetrics,
    readers: HashMap<u64, ReaderHandle>,
}

impl FileWatcher {
    pub fn new(
        config: &WatcherConfig,
        backup: Option<BackupFile>,
        state: Arc<FileState>,
        chunk_tx: mpsc::Sender<Chunk>,
        metrics: WatcherMetrics,
    ) -> Self {
        Self {
            patterns: config.watch_paths.clone(),
            read_interval: config.read_interval(),
            lifetime: config.lifetime_after_moved(),
            max_line_bytes: config.max_line_bytes,
            backup,
            state,
            chunk_tx,
            metrics,
            readers: HashMap::new(),
        }
    }

    fn watch_dirs(&self, wake: Arc<Notify>) -> Option<notify::RecommendedWatcher> {
        let mut fs_watcher =
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) if wants_rescan(&event.kind) => wake.notify_one(),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "file watcher error");
                        wake.notify_one();
                    }
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failed to initialize file watcher, relying on rescans");
                    return None;
                }
            };

        let dirs: BTreeSet<PathBuf> = self.patterns.iter().filter_map(|p| watch_dir(p)).collect();
        for dir in dirs {
            match fs_watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => debug!(path = %dir.display(), "watching directory"),
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to watch directory"),
            }
        }
        Some(fs_watcher)
    }

    /// Drop finished readers and start one for every new inode.
    fn scan(&mut self, shutdown: &watch::Receiver<bool>) {
        let state = &self.state;
        self.readers.retain(|inode, reader| {
            if !reader.handle.is_finished() {
                return true;
            }
            let pos = state.get(*inode).map(|s| s.pos);
            debug!(inode, path = %reader.path.display(), ?pos, "reader finished");
            state.release(*inode);
            false
        });

        for path in expand_paths(&self.patterns) {
            let Some(inode) = fileid::inode_of(&path) else {
                continue;
            };
            if !self.readers.contains_key(&inode) {
                self.start_reader(&path, inode, shutdown);
            }
        }
    }

    fn start_reader(&mut self, path: &Path, inode: u64, shutdown: &watch::Receiver<bool>) {
        let mut reader_state = self.state.acquire(inode, path);
        let len = fileid::file_len(path).unwrap_or(0);
        if reader_state.pos > len {
            warn!(
                inode,
                path = %path.display(),
                pos = reader_state.pos,
                len,
                "stored position is past end of file, inode was reused"
            );
            reader_state.reset();
        }
        if reader_state.path.as_path() != path {
            reader_state.path = path.to_path_buf();
        }
        self.state.put(inode, reader_state.clone());

        let reader = match FileReader::open(path, inode) {
            Ok(reader) => reader
                .with_lifetime(self.lifetime)
                .with_max_line_bytes(self.max_line_bytes)
                .with_backup(self.backup.clone()),
            Err(e) => {
                warn!(inode, path = %path.display(), error = %e, "failed to start reader");
                self.state.release(inode);
                return;
            }
        };

        info!(inode, path = %path.display(), pos = reader_state.pos, "starting reader");
        let handle = tokio::spawn(reader.run(
            reader_state,
            Arc::clone(&self.state),
            self.read_interval,
            self.chunk_tx.clone(),
            shutdown.clone(),
            self.metrics.clone(),
        ));
        self.readers.insert(
            inode,
            ReaderHandle {
                path: path.to_path_buf(),
                handle,
            },
        );
    }

    /// Run until shutdown, then wait for every reader to stop. The chunk
    /// channel closes once this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let wake = Arc::new(Notify::new());
        let _fs_watcher = self.watch_dirs(Arc::clone(&wake));

        let mut ticker = tokio::time::interval(self.read_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.scan(&shutdown);
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(readers = self.readers.len(), "stopping readers");
        for (inode, reader) in self.readers.drain() {
            if let Err(e) = reader.handle.await {
                error!(inode, path = %reader.path.display(), error = %e, "reader task failed");
            }
            self.state.release(inode);
        }
        debug!("file watcher stopped");
    }
}
