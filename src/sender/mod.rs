//! Ships payloads to the sink and records what was acknowledged.
//!
//! Every chunk's outcome is written back to [`FileState`] after each put,
//! successful or not, so that a restart can tell which byte ranges still
//! need sending.

pub mod file_writer;
#[cfg(feature = "kinesis")]
pub mod kinesis;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{SenderConfig, SinkKind};
use crate::metrics::SenderMetrics;
use crate::payload::{Payload, Record};
use crate::retry::{retry, ExpBackoff};
use crate::state::{FileState, StateError};

pub const RECORD_COUNT_MAX: u64 = 500;
pub const RECORD_SIZE_MAX: u64 = 1024 * 1024;
pub const PAYLOAD_SIZE_MAX: u64 = 5 * 1024 * 1024;
pub const RECORD_UNIT_SIZE: u64 = 25 * 1024;

pub const DEFAULT_RETRY_COUNT_MAX: u32 = 10;

#[derive(Debug)]
pub enum SendError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The sink client failed as a whole (transport, auth, throttling of the call).
    Client {
        message: String,
    },
    Config {
        reason: String,
    },
    /// Some records came back with an error code.
    Rejected {
        count: usize,
        code: String,
    },
    State(StateError),
    RetriesExhausted {
        attempts: u32,
        remaining: usize,
        last: Box<SendError>,
    },
}

impl SendError {
    /// Error code stamped on records when the whole put failed.
    fn record_code(&self) -> &'static str {
        match self {
            SendError::Io { .. } => "IoError",
            SendError::Client { .. } => "ClientError",
            _ => "SendError",
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Io { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            SendError::Client { message } => write!(f, "sink client error: {message}"),
            SendError::Config { reason } => write!(f, "invalid sender configuration: {reason}"),
            SendError::Rejected { count, code } => {
                write!(f, "{count} record(s) rejected (first error: {code})")
            }
            SendError::State(e) => write!(f, "failed to persist state: {e}"),
            SendError::RetriesExhausted {
                attempts,
                remaining,
                last,
            } => write!(
                f,
                "giving up after {attempts} attempts with {remaining} record(s) unsent: {last}"
            ),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Io { source, .. } => Some(source),
            SendError::State(e) => Some(e),
            SendError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<StateError> for SendError {
    fn from(e: StateError) -> Self {
        SendError::State(e)
    }
}

/// A sink that accepts batches of records.
#[async_trait]
pub trait SendClient: Send + Sync {
    /// Put `records`, setting `error_code` on each record the sink rejected.
    ///
    /// An `Err` means nothing is known to have been accepted.
    async fn put_records(&self, records: &mut [Record]) -> Result<(), SendError>;
}

/// Build the client selected by `config.kind`.
pub async fn client_from_config(config: &SenderConfig) -> Result<Box<dyn SendClient>, SendError> {
    match config.kind {
        SinkKind::Local => {
            let path = config.output_path.as_deref().ok_or_else(|| SendError::Config {
                reason: "sender.output_path is required for the local sink".to_string(),
            })?;
            let writer = file_writer::FileWriter::open(path)?;
            info!(path = %writer.path().display(), "shipping to local file");
            Ok(Box::new(writer))
        }
        #[cfg(feature = "kinesis")]
        SinkKind::Kinesis => Ok(Box::new(kinesis::KinesisClient::from_config(config).await?)),
        #[cfg(not(feature = "kinesis"))]
        SinkKind::Kinesis => Err(SendError::Config {
            reason: "built without the `kinesis` feature".to_string(),
        }),
    }
}

/// Outcome of one put: the records to retry and whether state was persisted.
///
/// A failed dump never drops `failed`; the caller still owns those records.
pub struct Sent {
    pub failed: Vec<Record>,
    pub dumped: Result<(), StateError>,
}

pub struct Sender {
    client: Box<dyn SendClient>,
    state: Arc<FileState>,
    backoff: ExpBackoff,
    retry_count_max: u32,
    metrics: SenderMetrics,
}

impl Sender {
    pub fn new(client: Box<dyn SendClient>, state: Arc<FileState>, metrics: SenderMetrics) -> Self {
        Self {
            client,
            state,
            backoff: ExpBackoff::default(),
            retry_count_max: DEFAULT_RETRY_COUNT_MAX,
            metrics,
        }
    }

    pub fn from_config(
        config: &SenderConfig,
        client: Box<dyn SendClient>,
        state: Arc<FileState>,
        metrics: SenderMetrics,
    ) -> Self {
        Self::new(client, state, metrics)
            .with_backoff(ExpBackoff::new(
                std::time::Duration::from_millis(config.initial_backoff_ms),
                config.backoff_multiplier,
                config.randomization_factor,
            )
            .with_max_interval(std::time::Duration::from_millis(config.max_backoff_ms)))
            .with_retry_count_max(config.retry_count_max)
    }

    pub fn with_backoff(mut self, backoff: ExpBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_count_max(mut self, retry_count_max: u32) -> Self {
        self.retry_count_max = retry_count_max.max(1);
        self
    }

    /// Put `records` once and record every chunk's outcome in state.
    ///
    /// Zero-size records carry only diverted lines; they are acknowledged
    /// without reaching the client.
    pub async fn send(&self, records: Vec<Record>) -> Sent {
        let (empty, mut outgoing): (Vec<Record>, Vec<Record>) =
            records.into_iter().partition(|r| r.size == 0);

        for record in &mut outgoing {
            record.error_code = None;
            record.error_message = None;
        }
        if !outgoing.is_empty() {
            if let Err(e) = self.client.put_records(&mut outgoing).await {
                warn!(records = outgoing.len(), error = %e, "put failed");
                for record in &mut outgoing {
                    record.error_code = Some(e.record_code().to_string());
                    record.error_message = Some(e.to_string());
                }
            }
        }

        let mut failed = Vec::new();
        let mut sent_records = 0u64;
        let mut sent_bytes = 0u64;
        for mut record in outgoing.into_iter().chain(empty) {
            if !record.failed() {
                record.mark_succeeded();
                sent_records += 1;
                sent_bytes += record.size;
            }
            for chunk in &record.chunks {
                self.state.update(&chunk.send_info);
            }
            if record.failed() {
                failed.push(record);
            }
        }

        if sent_records > 0 {
            self.metrics.record_success(sent_records, sent_bytes);
        }
        self.metrics.set_retry_records(failed.len());
        let dumped = self.state.dump();
        if let Err(e) = &dumped {
            warn!(error = %e, "failed to persist state after put");
        }
        Sent { failed, dumped }
    }

    /// Send `records`, re-sending only the failed ones with backoff until
    /// all are accepted or attempts run out.
    pub async fn send_with_retry(&self, records: Vec<Record>) -> Result<(), SendError> {
        let pending = Mutex::new(records);
        let pending = &pending;
        let mut backoff = self.backoff.clone();

        let result = retry(self.retry_count_max, &mut backoff, move |attempt| async move {
            let batch = std::mem::take(&mut *pending.lock().unwrap_or_else(|e| e.into_inner()));
            debug!(attempt, records = batch.len(), "sending records");
            let Sent { failed, dumped } = self.send(batch).await;
            let rejected = failed.first().map(|r| SendError::Rejected {
                count: failed.len(),
                code: r.error_code.clone().unwrap_or_default(),
            });
            *pending.lock().unwrap_or_else(|e| e.into_inner()) = failed;

            // An unpersisted outcome is retried even if every record was accepted.
            let err = match (dumped, rejected) {
                (Err(e), _) => SendError::State(e),
                (Ok(()), Some(rejected)) => rejected,
                (Ok(()), None) => return Ok(()),
            };
            self.metrics.record_failed_attempt();
            Err(err)
        })
        .await;

        result.map_err(|last| SendError::RetriesExhausted {
            attempts: self.retry_count_max,
            remaining: pending.lock().map(|p| p.len()).unwrap_or(0),
            last: Box::new(last),
        })
    }

    /// Send payloads until the channel closes. Exhausting retries is fatal.
    pub async fn run(self, mut payload_rx: mpsc::Receiver<Payload>) -> Result<(), SendError> {
        while let Some(payload) = payload_rx.recv().await {
            debug!(records = payload.count, bytes = payload.size, "payload received");
            if let Err(e) = self.send_with_retry(payload.records).await {
                error!(error = %e, "sender giving up");
                return Err(e);
            }
        }
        info!("sender drained");
        Ok(())
    }
}
