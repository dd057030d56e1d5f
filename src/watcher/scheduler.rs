//! Concurrent polling of watch sessions.
//!
//! Every session gets its own tokio task and its own interval. A tick moves
//! the session onto the blocking pool for the poll (file I/O and user
//! reactions may block) and waits for it, bounded by the poll timeout.
//!
//! Ticks never overlap: if the previous cycle is still running when the next
//! tick is due, that tick is skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::WatcherError;
use super::session::{FileWatchSession, PollReport, SessionCommand, SessionId, WatchEvent};

/// Default upper bound on a single poll cycle.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Control handle for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<WatchEvent>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Deliver a registration change. Every command sent before a poll starts
    /// is applied before that poll reads the file.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::SessionClosed`] if the session task has exited.
    pub fn send(&self, command: SessionCommand) -> Result<(), WatcherError> {
        if self.is_stopped() {
            return Err(WatcherError::SessionClosed(self.id));
        }
        self.commands
            .send(command)
            .map_err(|_| WatcherError::SessionClosed(self.id))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Stop the session. Calling this more than once has no further effect.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs one polling task per session.
#[derive(Debug)]
pub struct PollScheduler {
    /// Parent of every session's cancellation token.
    root: CancellationToken,
    tasks: JoinSet<SessionId>,
    poll_timeout: Duration,
}

impl PollScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    #[must_use]
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: JoinSet::new(),
            poll_timeout,
        }
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Number of session tasks not yet reaped.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Start polling `session` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&mut self, session: FileWatchSession, interval: Duration) -> SessionHandle {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let cancel = self.root.child_token();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            id: session.id(),
            path: session.path().to_path_buf(),
            interval,
            cancel: cancel.clone(),
            commands: commands_tx,
            events: session.event_sender(),
        };

        let task = SessionTask {
            interval,
            poll_timeout: self.poll_timeout,
            cancel,
            commands: commands_rx,
        };
        let span = tracing::info_span!("session", path = %handle.path.display());
        self.tasks.spawn(task.run(session).instrument(span));

        handle
    }

    /// Collect tasks that have already finished, returning their ids.
    pub fn reap(&mut self) -> Vec<SessionId> {
        let mut finished = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            match result {
                Ok(id) => finished.push(id),
                Err(e) => tracing::error!(error = %e, "Session task failed"),
            }
        }
        finished
    }

    /// Cancel every session and wait for their tasks to exit.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Session task failed");
            }
        }
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

type Cycle = JoinHandle<(FileWatchSession, PollReport)>;

/// Per-session scheduling loop.
struct SessionTask {
    interval: Duration,
    poll_timeout: Duration,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl SessionTask {
    async fn run(mut self, session: FileWatchSession) -> SessionId {
        let id = session.id();
        tracing::info!(interval = ?self.interval, "Watching log file");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut idle = Some(session);
        let mut in_flight: Option<Cycle> = None;
        let mut pending: Vec<SessionCommand> = Vec::new();
        let mut commands_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv(), if commands_open => {
                    match (command, idle.as_mut()) {
                        (Some(command), Some(session)) => session.apply(command),
                        (Some(command), None) => pending.push(command),
                        (None, _) => commands_open = false,
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Some(cycle) = in_flight.take() {
                if !cycle.is_finished() {
                    tracing::warn!("Previous poll still running, skipping tick");
                    in_flight = Some(cycle);
                    continue;
                }
                match cycle.await {
                    Ok((session, report)) => {
                        log_report(&report);
                        idle = Some(session);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Poll cycle aborted, stopping session");
                        break;
                    }
                }
            }

            let Some(mut session) = idle.take() else {
                break;
            };
            // The tick can win the select over commands that are already
            // queued; everything sent before this point must apply first.
            for command in pending.drain(..) {
                session.apply(command);
            }
            while let Ok(command) = self.commands.try_recv() {
                session.apply(command);
            }

            let mut cycle: Cycle = tokio::task::spawn_blocking(move || {
                let report = session.poll();
                (session, report)
            });

            let outcome = tokio::select! {
                () = self.cancel.cancelled() => None,
                result = tokio::time::timeout(self.poll_timeout, &mut cycle) => Some(result),
            };

            match outcome {
                None => break,
                Some(Ok(Ok((session, report)))) => {
                    log_report(&report);
                    idle = Some(session);
                }
                Some(Ok(Err(e))) => {
                    tracing::error!(error = %e, "Poll cycle aborted, stopping session");
                    break;
                }
                Some(Err(_)) => {
                    tracing::warn!(
                        timeout = ?self.poll_timeout,
                        "Poll cycle exceeded timeout, skipping ticks until it finishes"
                    );
                    in_flight = Some(cycle);
                }
            }
        }

        tracing::info!("Stopped watching log file");
        id
    }
}

fn log_report(report: &PollReport) {
    if report.lines > 0 || report.timeouts_fired > 0 {
        tracing::debug!(
            lines = report.lines,
            matched = report.matched,
            rotated = report.rotated,
            timeouts_fired = report.timeouts_fired,
            "Poll cycle complete"
        );
    }
}
