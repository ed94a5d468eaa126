/// Point-in-time snapshots of the running pipeline, exported as JSON by the API.
///
/// Each component owns a cloneable handle and overwrites its snapshot as it
/// works; the API only ever reads.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// A component whose state can be exported at an HTTP endpoint.
pub trait Exporter: Send + Sync {
    /// Route path, e.g. `/sender`.
    fn endpoint(&self) -> &'static str;

    fn export(&self) -> Result<serde_json::Value, serde_json::Error>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSnapshot {
    pub pos: u64,
    pub path: PathBuf,
    pub rotated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WatcherMetrics {
    readers: Arc<Mutex<BTreeMap<u64, ReaderSnapshot>>>,
}

impl WatcherMetrics {
    pub fn set_reader(&self, inode: u64, snapshot: ReaderSnapshot) {
        lock(&self.readers).insert(inode, snapshot);
    }

    pub fn remove_reader(&self, inode: u64) {
        lock(&self.readers).remove(&inode);
    }

    pub fn readers(&self) -> BTreeMap<u64, ReaderSnapshot> {
        lock(&self.readers).clone()
    }
}

impl Exporter for WatcherMetrics {
    fn endpoint(&self) -> &'static str {
        "/file_watcher"
    }

    fn export(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(serde_json::json!({ "readers": serde_json::to_value(self.readers())? }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferSnapshot {
    pub total_size: u64,
    pub record_count: u64,
    pub payloads_emitted: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorMetrics {
    inner: Arc<Mutex<BufferSnapshot>>,
}

impl AggregatorMetrics {
    pub fn set_buffer(&self, total_size: u64, record_count: u64) {
        let mut inner = lock(&self.inner);
        inner.total_size = total_size;
        inner.record_count = record_count;
    }

    pub fn payload_emitted(&self) {
        lock(&self.inner).payloads_emitted += 1;
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        *lock(&self.inner)
    }
}

impl Exporter for AggregatorMetrics {
    fn endpoint(&self) -> &'static str {
        "/aggregator"
    }

    fn export(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(serde_json::json!({ "payload": serde_json::to_value(self.snapshot())? }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SenderSnapshot {
    pub retry_records_count: usize,
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub failed_attempts: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SenderMetrics {
    inner: Arc<Mutex<SenderSnapshot>>,
}

impl SenderMetrics {
    pub fn set_retry_records(&self, count: usize) {
        lock(&self.inner).retry_records_count = count;
    }

    pub fn record_success(&self, records: u64, bytes: u64) {
        let mut inner = lock(&self.inner);
        inner.records_sent += records;
        inner.bytes_sent += bytes;
        inner.last_success_at = Some(Utc::now());
    }

    pub fn record_failed_attempt(&self) {
        lock(&self.inner).failed_attempts += 1;
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        lock(&self.inner).clone()
    }
}

impl Exporter for SenderMetrics {
    fn endpoint(&self) -> &'static str {
        "/sender"
    }

    fn export(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.snapshot())
    }
}
