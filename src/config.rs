use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sender::RECORD_SIZE_MAX;

/// Top-level configuration loaded from logship.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub aggregator: AggregatorConfig,
    pub sender: SenderConfig,
    pub state: StateConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Files, directories, or glob patterns to tail.
    pub watch_paths: Vec<String>,
    pub read_interval_ms: u64,
    /// How long a reader keeps draining a file after it was moved or removed.
    pub lifetime_after_moved_ms: u64,
    /// Lines longer than `max_line_bytes` are appended here instead of shipped.
    pub backup_path: Option<PathBuf>,
    pub max_line_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Local,
    Kinesis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub kind: SinkKind,
    /// Output file for the local sink.
    pub output_path: Option<PathBuf>,
    pub stream_name: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub retry_count_max: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub randomization_factor: f64,
    /// Ceiling for the backoff interval.
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Full,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

// --- Default implementations ---

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            read_interval_ms: 1000,
            lifetime_after_moved_ms: 5000,
            backup_path: None,
            max_line_bytes: RECORD_SIZE_MAX,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Local,
            output_path: None,
            stream_name: None,
            region: None,
            endpoint_url: None,
            retry_count_max: 10,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            randomization_factor: 0.1,
            max_backoff_ms: 60_000,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logship.state.json"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:8900".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
        }
    }
}

impl WatcherConfig {
    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    pub fn lifetime_after_moved(&self) -> Duration {
        Duration::from_millis(self.lifetime_after_moved_ms)
    }
}

impl AggregatorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Errors that can occur while loading the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        key: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { key, reason } => {
                write!(f, "invalid config value for {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

impl Config {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let watcher = &self.watcher;
        if watcher.watch_paths.is_empty() {
            return Err(invalid("watcher.watch_paths", "at least one path is required"));
        }
        if watcher.watch_paths.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("watcher.watch_paths", "paths must not be empty"));
        }
        if watcher.read_interval_ms == 0 {
            return Err(invalid("watcher.read_interval_ms", "must be greater than 0"));
        }
        if watcher.lifetime_after_moved_ms == 0 {
            return Err(invalid(
                "watcher.lifetime_after_moved_ms",
                "must be greater than 0",
            ));
        }
        if watcher.max_line_bytes == 0 || watcher.max_line_bytes > RECORD_SIZE_MAX {
            return Err(invalid(
                "watcher.max_line_bytes",
                format!("must be between 1 and {RECORD_SIZE_MAX}"),
            ));
        }
        if self.aggregator.flush_interval_ms == 0 {
            return Err(invalid("aggregator.flush_interval_ms", "must be greater than 0"));
        }

        let sender = &self.sender;
        match sender.kind {
            SinkKind::Local => {
                if sender.output_path.is_none() {
                    return Err(invalid(
                        "sender.output_path",
                        "required when sender.kind = \"local\"",
                    ));
                }
            }
            SinkKind::Kinesis => {
                if sender.stream_name.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid(
                        "sender.stream_name",
                        "required when sender.kind = \"kinesis\"",
                    ));
                }
            }
        }
        if sender.retry_count_max == 0 {
            return Err(invalid("sender.retry_count_max", "must be at least 1"));
        }
        if !sender.backoff_multiplier.is_finite() || sender.backoff_multiplier < 1.0 {
            return Err(invalid("sender.backoff_multiplier", "must be a finite number >= 1.0"));
        }
        if sender.max_backoff_ms < sender.initial_backoff_ms {
            return Err(invalid(
                "sender.max_backoff_ms",
                "must be >= sender.initial_backoff_ms",
            ));
        }
        if !(0.0..1.0).contains(&sender.randomization_factor) {
            return Err(invalid(
                "sender.randomization_factor",
                "must be in [0.0, 1.0)",
            ));
        }

        if self.state.path.as_os_str().is_empty() {
            return Err(invalid("state.path", "must not be empty"));
        }
        if self.api.enabled && self.api.address.trim().is_empty() {
            return Err(invalid("api.address", "required when api.enabled = true"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[watcher]
watch_paths = ["/var/log/app/test.log"]

[sender]
kind = "local"
output_path = "/tmp/out.log"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.watcher.watch_paths, vec!["/var/log/app/test.log"]);
        assert_eq!(config.watcher.read_interval(), Duration::from_secs(1));
        assert_eq!(config.watcher.lifetime_after_moved(), Duration::from_secs(5));
        assert_eq!(config.watcher.max_line_bytes, RECORD_SIZE_MAX);
        assert_eq!(config.aggregator.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.sender.kind, SinkKind::Local);
        assert_eq!(config.sender.retry_count_max, 10);
        assert_eq!(config.state.path, PathBuf::from("logship.state.json"));
        assert!(config.api.enabled);
        assert_eq!(config.logging.format, LogFormat::Full);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
[watcher]
watch_paths = ["/var/log/app/*.log", "/var/log/other"]
read_interval_ms = 250
lifetime_after_moved_ms = 2000
backup_path = "/var/log/logship/oversized.log"
max_line_bytes = 4096

[aggregator]
flush_interval_ms = 500

[sender]
kind = "kinesis"
stream_name = "app-logs"
region = "ap-northeast-1"
retry_count_max = 3

[state]
path = "/var/lib/logship/state.json"

[api]
enabled = false

[logging]
level = "debug"
format = "json"
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.watcher.watch_paths.len(), 2);
        assert_eq!(config.watcher.read_interval(), Duration::from_millis(250));
        assert_eq!(
            config.watcher.backup_path,
            Some(PathBuf::from("/var/log/logship/oversized.log"))
        );
        assert_eq!(config.sender.kind, SinkKind::Kinesis);
        assert_eq!(config.sender.stream_name.as_deref(), Some("app-logs"));
        assert_eq!(config.sender.retry_count_max, 3);
        assert!(!config.api.enabled);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_watch_paths_rejected() {
        let text = r#"
[sender]
output_path = "/tmp/out.log"
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("watcher.watch_paths"));
    }

    #[test]
    fn test_local_sink_requires_output_path() {
        let text = r#"
[watcher]
watch_paths = ["/tmp/a.log"]
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("sender.output_path"));
    }

    #[test]
    fn test_kinesis_sink_requires_stream_name() {
        let text = r#"
[watcher]
watch_paths = ["/tmp/a.log"]

[sender]
kind = "kinesis"
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("sender.stream_name"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let text = format!("{MINIMAL}\n[aggregator]\nflush_interval_ms = 0\n");
        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("aggregator.flush_interval_ms"));
    }

    #[test]
    fn test_non_finite_multiplier_rejected() {
        for value in ["inf", "nan", "-inf"] {
            let text = format!("{MINIMAL}backoff_multiplier = {value}\n");
            let err = Config::parse(&text).unwrap_err();
            assert!(
                err.to_string().contains("sender.backoff_multiplier"),
                "{value}: {err}"
            );
        }
    }

    #[test]
    fn test_max_backoff_below_initial_rejected() {
        let text = format!("{MINIMAL}initial_backoff_ms = 500\nmax_backoff_ms = 100\n");
        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("sender.max_backoff_ms"));
    }

    #[test]
    fn test_oversized_max_line_rejected() {
        let text = r#"
[watcher]
watch_paths = ["/tmp/a.log"]
max_line_bytes = 2000000

[sender]
output_path = "/tmp/out.log"
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("watcher.max_line_bytes"));
    }

    #[test]
    fn test_unknown_sink_kind_is_parse_error() {
        let text = r#"
[watcher]
watch_paths = ["/tmp/a.log"]

[sender]
kind = "carrier_pigeon"
"#;
        assert!(matches!(
            Config::parse(text).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/logship.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logship.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sender.output_path, Some(PathBuf::from("/tmp/out.log")));
    }
}
