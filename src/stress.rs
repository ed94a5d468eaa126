//! Rotation stress harness.
//!
//! Appends numbered JSON records to a log file, reopening it for every
//! record, while a rotation task rotates the file out from under the writer
//! at evenly spaced points. Run the agent against the same file and check
//! the result with `logship verify`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::fileid;

pub const DEFAULT_KEY: &str = "logrotate_test";
pub const DEFAULT_COUNT: u64 = 500;
pub const DEFAULT_ROTATIONS: u32 = 3;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_WARMUP: u64 = 100;
pub const DEFAULT_KEEP: u32 = 5;

/// One line written by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressRecord {
    pub i: u64,
    pub key: String,
}

#[derive(Debug)]
pub enum StressError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Rotate {
        reason: String,
    },
    Task(tokio::task::JoinError),
}

impl std::fmt::Display for StressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StressError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StressError::Rotate { reason } => write!(f, "rotation failed: {reason}"),
            StressError::Task(e) => write!(f, "rotation task failed: {e}"),
        }
    }
}

impl std::error::Error for StressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StressError::Io { source, .. } => Some(source),
            StressError::Task(e) => Some(e),
            StressError::Rotate { .. } => None,
        }
    }
}

impl From<tokio::task::JoinError> for StressError {
    fn from(e: tokio::task::JoinError) -> Self {
        StressError::Task(e)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StressError + '_ {
    move |source| StressError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Moves the active log file aside.
#[async_trait]
pub trait Rotator: Send {
    async fn rotate(&mut self, log: &Path) -> Result<(), StressError>;
}

/// Runs `logrotate -f <conf>`.
#[derive(Debug, Clone)]
pub struct Logrotate {
    pub conf: PathBuf,
}

#[async_trait]
impl Rotator for Logrotate {
    async fn rotate(&mut self, _log: &Path) -> Result<(), StressError> {
        let status = tokio::process::Command::new("logrotate")
            .arg("-f")
            .arg(&self.conf)
            .status()
            .await
            .map_err(|e| StressError::Rotate {
                reason: format!("failed to run logrotate: {e}"),
            })?;
        if !status.success() {
            return Err(StressError::Rotate {
                reason: format!("logrotate -f {} exited with {status}", self.conf.display()),
            });
        }
        Ok(())
    }
}

/// Built-in `create`-style rotation: `log.N` becomes `log.N+1`, `log`
/// becomes `log.1`, and an empty `log` is created. At most `keep` rotated
/// files are retained.
#[derive(Debug, Clone)]
pub struct RenameRotator {
    pub keep: u32,
}

impl Default for RenameRotator {
    fn default() -> Self {
        Self { keep: DEFAULT_KEEP }
    }
}

/// `app.log` -> `app.log.3`.
pub fn rotated_path(log: &Path, n: u32) -> PathBuf {
    let mut name = log.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[async_trait]
impl Rotator for RenameRotator {
    async fn rotate(&mut self, log: &Path) -> Result<(), StressError> {
        let keep = self.keep.max(1);
        let oldest = rotated_path(log, keep);
        if oldest.exists() {
            std::fs::remove_file(&oldest).map_err(io_err(&oldest))?;
        }
        for n in (1..keep).rev() {
            let from = rotated_path(log, n);
            if from.exists() {
                std::fs::rename(&from, rotated_path(log, n + 1)).map_err(io_err(&from))?;
            }
        }
        std::fs::rename(log, rotated_path(log, 1)).map_err(io_err(log))?;
        touch(log)?;
        Ok(())
    }
}

fn touch(path: &Path) -> Result<(), StressError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err(path))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub log: PathBuf,
    pub count: u64,
    pub rotations: u32,
    pub interval: Duration,
    pub warmup: u64,
    pub key: String,
}

impl StressOptions {
    pub fn new(log: impl Into<PathBuf>) -> Self {
        Self {
            log: log.into(),
            count: DEFAULT_COUNT,
            rotations: DEFAULT_ROTATIONS,
            interval: DEFAULT_INTERVAL,
            warmup: DEFAULT_WARMUP,
            key: DEFAULT_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StressReport {
    pub records_written: u64,
    pub rotations: u32,
    /// Every inode a record was written to.
    pub inodes: BTreeSet<u64>,
}

impl std::fmt::Display for StressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wrote {} records across {} inode(s), {} rotation(s)",
            self.records_written,
            self.inodes.len(),
            self.rotations
        )
    }
}

/// Sequence numbers before which a rotation is requested: the first at
/// `warmup`, the rest spread evenly over the remaining records.
pub fn rotation_points(count: u64, warmup: u64, rotations: u32) -> Vec<u64> {
    if rotations == 0 || warmup >= count {
        return Vec::new();
    }
    let span = count - warmup;
    (0..u64::from(rotations))
        .map(|k| warmup + k * span / u64::from(rotations))
        .collect()
}

fn write_record(log: &Path, record: &StressRecord) -> Result<u64, StressError> {
    let line = serde_json::to_string(record).map_err(|e| StressError::Io {
        path: log.to_path_buf(),
        source: e.into(),
    })?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(io_err(log))?;
    let inode = fileid::inode_of_file(&file).map_err(io_err(log))?;
    file.write_all(format!("{line}\n").as_bytes())
        .map_err(io_err(log))?;
    debug!("{inode} -> {line}");
    Ok(inode)
}

/// Write `opts.count` records while `rotator` rotates the log `opts.rotations` times.
pub async fn run<R>(opts: &StressOptions, mut rotator: R) -> Result<StressReport, StressError>
where
    R: Rotator + 'static,
{
    touch(&opts.log)?;
    let points: BTreeSet<u64> = rotation_points(opts.count, opts.warmup, opts.rotations)
        .into_iter()
        .collect();

    let capacity = points.len().max(1);
    let (request_tx, mut request_rx) = mpsc::channel::<u64>(capacity);
    let (done_tx, mut done_rx) = mpsc::channel::<Option<u64>>(capacity);

    let log = opts.log.clone();
    let rotation = tokio::spawn(async move {
        let mut completed = 0u32;
        while let Some(at) = request_rx.recv().await {
            rotator.rotate(&log).await?;
            let inode = fileid::inode_of(&log);
            info!(at, inode = ?inode, "rotated");
            completed += 1;
            if done_tx.send(inode).await.is_err() {
                break;
            }
        }
        Ok::<u32, StressError>(completed)
    });

    let mut report = StressReport::default();
    for i in 0..opts.count {
        if points.contains(&i) {
            // A closed channel means the rotation task failed; its error
            // surfaces below.
            if request_tx.send(i).await.is_err() {
                break;
            }
            match done_rx.recv().await {
                Some(inode) => debug!(at = i, inode = ?inode, "rotation completed"),
                None => break,
            }
        }
        let record = StressRecord {
            i,
            key: opts.key.clone(),
        };
        let inode = write_record(&opts.log, &record)?;
        report.inodes.insert(inode);
        report.records_written += 1;
        tokio::time::sleep(opts.interval).await;
    }

    drop(request_tx);
    report.rotations = rotation.await??;
    info!(%report, "stress run finished");
    Ok(report)
}
