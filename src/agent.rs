//! Wires the pipeline together and owns its shutdown sequence:
//! watcher -> aggregator -> sender, with state shared by readers and sender.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::metrics::{AggregatorMetrics, SenderMetrics, WatcherMetrics};
use crate::reader::BackupFile;
use crate::sender::{self, SendError, Sender};
use crate::state::{FileState, StateError, StateLock};
use crate::watcher::FileWatcher;

const CHUNK_CHANNEL_CAPACITY: usize = 256;
const PAYLOAD_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug)]
pub enum AgentError {
    State(StateError),
    Send(SendError),
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },
    Task(tokio::task::JoinError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::State(e) => write!(f, "{e}"),
            AgentError::Send(e) => write!(f, "{e}"),
            AgentError::Backup { path, source } => {
                write!(f, "failed to open backup file {}: {}", path.display(), source)
            }
            AgentError::Task(e) => write!(f, "pipeline task failed: {e}"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::State(e) => Some(e),
            AgentError::Send(e) => Some(e),
            AgentError::Backup { source, .. } => Some(source),
            AgentError::Task(e) => Some(e),
        }
    }
}

impl From<StateError> for AgentError {
    fn from(e: StateError) -> Self {
        AgentError::State(e)
    }
}

impl From<SendError> for AgentError {
    fn from(e: SendError) -> Self {
        AgentError::Send(e)
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(e: tokio::task::JoinError) -> Self {
        AgentError::Task(e)
    }
}

/// Run the agent until `stop` resolves or the sender fails.
///
/// On stop, readers are halted, the aggregator flushes what it holds, the
/// sender drains it, and state is dumped one last time.
pub async fn run<F>(config: &Config, stop: F) -> Result<(), AgentError>
where
    F: Future<Output = ()>,
{
    let lock = StateLock::acquire(&config.state.path)?;
    let state = Arc::new(FileState::load(&config.state.path)?);
    debug!(lock = %lock.path().display(), readers = state.len(), "state loaded");

    let backup = match &config.watcher.backup_path {
        Some(path) => Some(BackupFile::open(path).map_err(|e| AgentError::Backup {
            path: path.clone(),
            source: e,
        })?),
        None => None,
    };
    let client = sender::client_from_config(&config.sender).await?;

    let watcher_metrics = WatcherMetrics::default();
    let aggregator_metrics = AggregatorMetrics::default();
    let sender_metrics = SenderMetrics::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);

    let sender = Sender::from_config(
        &config.sender,
        client,
        Arc::clone(&state),
        sender_metrics.clone(),
    );
    let mut sender_task = tokio::spawn(sender.run(payload_rx));

    let aggregator = Aggregator::new(config.aggregator.flush_interval(), aggregator_metrics.clone());
    let aggregator_task = tokio::spawn(aggregator.run(chunk_rx, payload_tx));

    let watcher = FileWatcher::new(
        &config.watcher,
        backup,
        Arc::clone(&state),
        chunk_tx,
        watcher_metrics.clone(),
    );
    let watcher_task = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let api_task = spawn_api(
        config,
        watcher_metrics,
        aggregator_metrics,
        sender_metrics,
        shutdown_rx,
    );

    info!(
        paths = ?config.watcher.watch_paths,
        state = %state.path().display(),
        "agent started"
    );

    let early = tokio::select! {
        _ = stop => None,
        result = &mut sender_task => Some(result),
    };

    let _ = shutdown_tx.send(true);
    watcher_task.await?;
    aggregator_task.await?;
    let sent = match early {
        Some(result) => result?,
        None => sender_task.await?,
    };
    if let Some(api_task) = api_task {
        if let Err(e) = api_task.await {
            warn!(error = %e, "api task failed");
        }
    }

    let dumped = state.dump();
    if let Err(e) = &sent {
        error!(error = %e, "sender failed, unsent ranges will be replayed on restart");
    }
    sent?;
    dumped?;
    drop(lock);
    info!("agent stopped");
    Ok(())
}

#[cfg(feature = "serve")]
fn spawn_api(
    config: &Config,
    watcher: WatcherMetrics,
    aggregator: AggregatorMetrics,
    sender: SenderMetrics,
    shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    use crate::metrics::Exporter;

    if !config.api.enabled {
        return None;
    }
    let exporters: Vec<Arc<dyn Exporter>> =
        vec![Arc::new(watcher), Arc::new(aggregator), Arc::new(sender)];
    let address = config.api.address.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = crate::api::serve(&address, exporters, shutdown).await {
            error!(address = %address, error = %e, "api server failed");
        }
    }))
}

#[cfg(not(feature = "serve"))]
fn spawn_api(
    config: &Config,
    _watcher: WatcherMetrics,
    _aggregator: AggregatorMetrics,
    _sender: SenderMetrics,
    _shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.api.enabled {
        warn!("api.enabled is set but logship was built without the `serve` feature");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkKind;
    use crate::stress::{self, RenameRotator, StressOptions};
    use crate::verify;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.watcher.watch_paths = vec![dir.join("app.log").to_string_lossy().into_owned()];
        config.watcher.read_interval_ms = 10;
        config.watcher.lifetime_after_moved_ms = 200;
        config.aggregator.flush_interval_ms = 20;
        config.sender.kind = SinkKind::Local;
        config.sender.output_path = Some(dir.join("out/sink.log"));
        config.sender.initial_backoff_ms = 1;
        config.state.path = dir.join("state/logship.state.json");
        config.api.enabled = false;
        config
    }

    async fn wait_for_lines(path: &Path, lines: u64) {
        for _ in 0..500 {
            if verify::count_lines(path).unwrap_or(0) >= lines {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_loss_or_duplication_across_rotations() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, b"").unwrap();
        let config = test_config(dir.path());
        let output = config.sender.output_path.clone().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let agent_config = config.clone();
        let agent = tokio::spawn(async move {
            run(&agent_config, async {
                let _ = stop_rx.await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let opts = StressOptions {
            count: 200,
            rotations: 3,
            interval: Duration::from_millis(2),
            warmup: 20,
            ..StressOptions::new(&log)
        };
        let written = stress::run(&opts, RenameRotator::default()).await.unwrap();
        assert_eq!(written.records_written, 200);
        assert_eq!(written.rotations, 3);

        wait_for_lines(&output, 200).await;
        stop_tx.send(()).unwrap();
        agent.await.unwrap().unwrap();

        let report = verify::verify(&log, &output, 200, stress::DEFAULT_KEY).unwrap();
        assert!(report.passed(), "{report}");
    }

    #[tokio::test]
    async fn test_restart_resumes_without_resending() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, b"{\"i\":0,\"key\":\"logrotate_test\"}\n").unwrap();
        let config = test_config(dir.path());
        let output = config.sender.output_path.clone().unwrap();

        for expected in [1, 2] {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let agent_config = config.clone();
            let agent = tokio::spawn(async move {
                run(&agent_config, async {
                    let _ = stop_rx.await;
                })
                .await
            });
            wait_for_lines(&output, expected).await;
            stop_tx.send(()).unwrap();
            agent.await.unwrap().unwrap();
            assert_eq!(verify::count_lines(&output).unwrap(), expected);

            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            std::io::Write::write_all(&mut f, b"{\"i\":1,\"key\":\"logrotate_test\"}\n").unwrap();
        }

        assert_eq!(
            verify::collect_sequence(&output, stress::DEFAULT_KEY).unwrap(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_second_agent_is_locked_out() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.state.path.parent().unwrap()).unwrap();
        let _held = StateLock::acquire(&config.state.path).unwrap();

        let err = run(&config, async {}).await.unwrap_err();
        assert!(matches!(err, AgentError::State(StateError::Locked { .. })));
    }
}
