mod agent;
mod aggregator;
#[cfg(feature = "serve")]
mod api;
mod config;
mod fileid;
mod lifetimer;
mod metrics;
mod payload;
mod reader;
mod retry;
mod sender;
mod signals;
mod state;
mod stress;
mod verify;
mod watcher;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Tails rotating log files and ships complete lines to a sink, resuming
/// exactly where it left off after a restart.
#[derive(Parser, Debug)]
#[command(name = "logship", version, about)]
pub struct Cli {
    /// Extra logging (reader and sender decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent until signalled
    Run {
        /// Config file path
        #[arg(short, long, default_value = "logship.toml")]
        config: PathBuf,

        /// State file path (overrides config)
        #[arg(long)]
        state: Option<PathBuf>,

        /// API listen address (overrides config, enables the API)
        #[arg(long)]
        api: Option<String>,
    },

    /// Append numbered records to a log file while rotating it
    Stress(StressArgs),

    /// Check that every record of a stress run was delivered exactly once
    Verify {
        /// Log file the stress run wrote to
        #[arg(long)]
        log: PathBuf,

        /// Sink output file
        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value_t = stress::DEFAULT_COUNT)]
        count: u64,

        #[arg(long, default_value = stress::DEFAULT_KEY)]
        key: String,
    },

    /// Validate a config file and print the resolved settings
    CheckConfig {
        #[arg(short, long, default_value = "logship.toml")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct StressArgs {
    /// Log file to write
    #[arg(long)]
    log: PathBuf,

    #[arg(long, default_value_t = stress::DEFAULT_COUNT)]
    count: u64,

    #[arg(long, default_value_t = stress::DEFAULT_ROTATIONS)]
    rotations: u32,

    /// Pause between records
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Records written before the first rotation
    #[arg(long, default_value_t = stress::DEFAULT_WARMUP)]
    warmup: u64,

    /// Rotate with `logrotate -f <conf>` instead of renaming
    #[arg(long, conflicts_with = "keep")]
    logrotate_conf: Option<PathBuf>,

    /// Rotated files kept by the built-in rotation
    #[arg(long, default_value_t = stress::DEFAULT_KEEP)]
    keep: u32,
}

fn init_logging(level: &str, format: LogFormat, verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Full => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, state, api } => {
            let mut resolved = match Config::load(&config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(state) = state {
                resolved.state.path = state;
            }
            if let Some(address) = api {
                resolved.api.enabled = true;
                resolved.api.address = address;
            }

            init_logging(
                &resolved.logging.level,
                resolved.logging.format,
                cli.verbose,
                cli.quiet,
            );
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                config = %config.display(),
                "logship starting"
            );

            match agent::run(&resolved, signals::shutdown_requested()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "agent failed");
                    ExitCode::FAILURE
                }
            }
        }

        Command::Stress(args) => {
            init_logging("info", LogFormat::Full, cli.verbose, cli.quiet);
            let opts = stress::StressOptions {
                count: args.count,
                rotations: args.rotations,
                interval: Duration::from_millis(args.interval_ms),
                warmup: args.warmup,
                ..stress::StressOptions::new(args.log)
            };
            let result = match args.logrotate_conf {
                Some(conf) => stress::run(&opts, stress::Logrotate { conf }).await,
                None => stress::run(&opts, stress::RenameRotator { keep: args.keep }).await,
            };
            match result {
                Ok(report) => {
                    println!("{report}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "stress run failed");
                    ExitCode::FAILURE
                }
            }
        }

        Command::Verify {
            log,
            output,
            count,
            key,
        } => {
            init_logging("warn", LogFormat::Full, cli.verbose, cli.quiet);
            match verify::verify(&log, &output, count, &key) {
                Ok(report) => {
                    println!("{report}");
                    if report.passed() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        Command::CheckConfig { config } => match Config::load(&config) {
            Ok(resolved) => {
                println!("{resolved:#?}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}
