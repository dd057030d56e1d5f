//! Log Sentinel - tail growing log files and alert on found or missing patterns.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use log_sentinel::alert::{self, AlertSink};
use log_sentinel::config::{Config, ConfigError, ConfigLoader};
use log_sentinel::watcher::{
    LinePredicate, PollScheduler, SessionId, SystemClock, WatchEvent, WatchSet, WatcherError,
};

#[derive(Parser)]
#[command(
    name = "log-sentinel",
    about = "Tail growing log files and alert on found or missing patterns",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ./.log-sentinel.toml, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured log files until interrupted.
    Watch,
    /// Load and validate the config, then print the files it would watch.
    Check,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error("Failed to listen for Ctrl-C: {0}")]
    Signal(#[from] std::io::Error),
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let config = loader.load()?;
    config.validate()?;
    Ok(config)
}

/// Register the found rule and every missing rule on one file.
fn register_rules(
    set: &WatchSet,
    config: &Config,
    sink: &AlertSink,
    id: SessionId,
    path: &Path,
) -> Result<broadcast::Receiver<WatchEvent>, RunError> {
    let found = LinePredicate::regex(config.found_regex()?);
    let (found_sink, found_alert, found_path) =
        (sink.clone(), config.found.alert.clone(), path.to_path_buf());
    set.register_match(id, found, move |line| {
        found_sink.found(&found_path, line, found_alert.as_ref())?;
        Ok(())
    })?;

    for (missing, regex) in config.missing_regexes()? {
        let (missing_sink, missing_alert, missing_path) =
            (sink.clone(), missing.alert.clone(), path.to_path_buf());
        let label = missing.label().to_string();
        set.register_missing_pattern_timeout(
            id,
            LinePredicate::regex(regex),
            missing.timeout(),
            move || {
                missing_sink.missing(&missing_path, &label, missing_alert.as_ref())?;
                Ok(())
            },
        )?;
    }

    Ok(set.subscribe(id)?)
}

/// Surface session events the alert reactions do not cover.
async fn report_events(mut events: broadcast::Receiver<WatchEvent>, warn_after: u32) {
    loop {
        match events.recv().await {
            Ok(WatchEvent::Unavailable {
                path,
                consecutive_failures,
            }) => {
                if warn_after > 0 && consecutive_failures % warn_after == 0 {
                    alert::print_unavailable(&path, consecutive_failures);
                }
            }
            Ok(WatchEvent::Rotated { path, .. }) => alert::print_rotated(&path),
            Ok(WatchEvent::LinesAdded { path, lines }) => {
                tracing::trace!(path = %path.display(), lines = lines.len(), "Lines added");
            }
            Ok(WatchEvent::TimeoutFired { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn watch(config: Config) -> Result<(), RunError> {
    let scheduler = PollScheduler::with_poll_timeout(config.poll_timeout());
    let mut set = WatchSet::with_scheduler(scheduler, Arc::new(SystemClock));
    let sink = AlertSink::new();
    let mut reporters = JoinSet::new();

    alert::print_watch_list(&config.log_files);

    for path in &config.log_files {
        let id = set.start_watching(path, config.check_interval())?;
        let events = register_rules(&set, &config, &sink, id, path)?;
        reporters.spawn(report_events(events, config.unavailable_warn_after));
    }

    tracing::info!(files = set.len(), "Log sentinel running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    set.shutdown().await;
    reporters.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "ERROR:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Check => {
            alert::print_watch_list(&config.log_files);
            ExitCode::SUCCESS
        }
        Commands::Watch => match watch(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} {e}", "ERROR:".red().bold());
                ExitCode::FAILURE
            }
        },
    }
}
