//! Alert output: colored status lines and optional alert commands.

use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::config::AlertCommand;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Error type for alert commands.
#[derive(thiserror::Error, Debug)]
pub enum AlertError {
    /// The alert program was not found.
    #[error("Alert command not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied running alert command: {0}")]
    PermissionDenied(String),
    /// The alert program ran but failed.
    #[error("Alert command {command} exited with {status}")]
    Failed { command: String, status: ExitStatus },
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AlertError {
    /// Create an `AlertError` from an I/O error, classifying common cases.
    fn from_io(command: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(command.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(command.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Shared sink for alerts raised by any watch session.
///
/// Clones share one lock, so at most one alert command runs at a time even
/// when several files alert together.
#[derive(Debug, Clone, Default)]
pub struct AlertSink {
    playback: Arc<Mutex<()>>,
}

impl AlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a line that matched the found pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert command cannot run or fails.
    pub fn found(&self, path: &Path, line: &str, command: Option<&AlertCommand>) -> Result<(), AlertError> {
        println!(
            "{} {} {} {}",
            timestamp().dimmed(),
            "[FOUND]".green().bold(),
            line,
            path.display().dimmed()
        );
        let _ = io::stdout().flush();
        self.run(command)
    }

    /// Report that an expected pattern stopped appearing.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert command cannot run or fails.
    pub fn missing(&self, path: &Path, label: &str, command: Option<&AlertCommand>) -> Result<(), AlertError> {
        println!(
            "{} {} No \"{}\" in {}",
            timestamp().dimmed(),
            "[MISSING]".red().bold(),
            label.yellow(),
            path.display()
        );
        let _ = io::stdout().flush();
        self.run(command)
    }

    /// Run the alert command, if any, waiting for it to finish.
    fn run(&self, command: Option<&AlertCommand>) -> Result<(), AlertError> {
        let Some(alert) = command else {
            return Ok(());
        };
        let _playing = self.playback.lock().unwrap_or_else(PoisonError::into_inner);

        tracing::debug!(command = %alert.command, args = ?alert.args, "Running alert command");
        let status = Command::new(&alert.command)
            .args(&alert.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| AlertError::from_io(&alert.command, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(AlertError::Failed {
                command: alert.command.clone(),
                status,
            })
        }
    }
}

/// Print the list of watched files at startup.
pub fn print_watch_list(paths: &[impl AsRef<Path>]) {
    println!(
        "{} {} Watching {} log file(s):",
        timestamp().dimmed(),
        "[WATCH]".blue().bold(),
        paths.len()
    );
    for path in paths {
        println!("  - {}", path.as_ref().display().cyan());
    }
    let _ = io::stdout().flush();
}

/// Warn that a file has been unreadable for a while.
pub fn print_unavailable(path: &Path, consecutive_failures: u32) {
    println!(
        "{} {} {} unreadable for {} consecutive polls",
        timestamp().dimmed(),
        "[WARN]".yellow().bold(),
        path.display(),
        consecutive_failures
    );
    let _ = io::stdout().flush();
}

/// Note that a file was recreated or truncated.
pub fn print_rotated(path: &Path) {
    println!(
        "{} {} {} shrank, reading from the start",
        timestamp().dimmed(),
        "[ROTATED]".magenta().bold(),
        path.display()
    );
    let _ = io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(program: &str, args: &[&str]) -> AlertCommand {
        AlertCommand {
            command: program.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_no_command_is_ok() {
        let sink = AlertSink::new();
        assert!(sink.found(Path::new("/tmp/a.log"), "Found 1 proofs.", None).is_ok());
        assert!(sink.missing(Path::new("/tmp/a.log"), "heartbeat", None).is_ok());
    }

    #[test]
    fn test_missing_program() {
        let sink = AlertSink::new();
        let alert = command("log-sentinel-no-such-player", &[]);
        let result = sink.found(Path::new("/tmp/a.log"), "line", Some(&alert));
        assert!(matches!(result, Err(AlertError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_success() {
        let sink = AlertSink::new();
        let alert = command("true", &[]);
        assert!(sink.missing(Path::new("/tmp/a.log"), "heartbeat", Some(&alert)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure() {
        let sink = AlertSink::new();
        let alert = command("false", &[]);
        let result = sink.missing(Path::new("/tmp/a.log"), "heartbeat", Some(&alert));
        assert!(matches!(result, Err(AlertError::Failed { .. })));
    }

    #[test]
    fn test_error_display() {
        let err = AlertError::NotFound("aplay".to_string());
        assert_eq!(err.to_string(), "Alert command not found: aplay");
    }
}
