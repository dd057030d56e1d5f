//! Per-file watch session.
//!
//! A [`FileWatchSession`] owns everything about one monitored file: the last
//! observed snapshot, the match rule and the missing-pattern rules. Each call
//! to [`FileWatchSession::poll`] is one tick of the session's state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::clock::Clock;
use super::error::WatcherError;
use super::lines::{count_lines, read_lines_from};
use super::rules::{LineObserver, MatchRule, MissingPatternRule};

/// Buffered events per session before slow subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifier of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Events published by a session to its subscribers.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Lines were appended since the previous poll.
    LinesAdded {
        path: PathBuf,
        lines: Arc<[String]>,
    },
    /// The line count shrank; the file was read again from the start.
    Rotated {
        path: PathBuf,
        previous_lines: usize,
        current_lines: usize,
    },
    /// The file could not be read this cycle.
    Unavailable {
        path: PathBuf,
        consecutive_failures: u32,
    },
    /// A missing-pattern rule fired.
    TimeoutFired { path: PathBuf, pattern: String },
}

/// Last observed state of a monitored file.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
    line_count: usize,
}

impl WatchTarget {
    /// Take the initial snapshot of `path`. Existing content is the baseline,
    /// not new lines.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::PathNotFound`] if `path` does not exist, or
    /// [`WatcherError::IoUnavailable`] if it exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WatcherError> {
        let path = path.into();
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WatcherError::PathNotFound(path));
            }
            Err(e) => return Err(WatcherError::unavailable(path, e)),
        };
        let line_count = count_lines(&path)?;

        Ok(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            line_count,
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Complete lines as of the last successful read.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_count
    }
}

/// Lines appended since the previous poll, plus the snapshot they came from.
#[derive(Debug)]
pub struct LineDelta {
    pub lines: Vec<String>,
    pub rotated: bool,
    pub previous_lines: usize,
    pub line_count: usize,
    modified: Option<SystemTime>,
    len: u64,
}

/// Where a session is in its tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Polling,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// New lines delivered to the rules.
    pub lines: usize,
    /// Lines that satisfied the match rule.
    pub matched: usize,
    /// The file was treated as recreated.
    pub rotated: bool,
    /// Missing-pattern rules that fired this tick.
    pub timeouts_fired: usize,
    /// The file could not be read; nothing was delivered.
    pub unavailable: bool,
}

/// Registration changes delivered to a running session.
pub enum SessionCommand {
    /// Replace the match rule.
    SetMatch(MatchRule),
    /// Add a missing-pattern rule.
    AddMissing(MissingPatternRule),
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetMatch(rule) => f.debug_tuple("SetMatch").field(rule).finish(),
            Self::AddMissing(rule) => f.debug_tuple("AddMissing").field(rule).finish(),
        }
    }
}

/// One monitored file and its rules.
pub struct FileWatchSession {
    id: SessionId,
    target: WatchTarget,
    state: SessionState,
    match_rule: Option<MatchRule>,
    missing_rules: Vec<MissingPatternRule>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<WatchEvent>,
    consecutive_failures: u32,
}

impl FileWatchSession {
    /// Start a session for `path`, snapshotting its current contents.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::PathNotFound`] if `path` does not exist.
    pub fn start(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, WatcherError> {
        let target = WatchTarget::open(path)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::debug!(
            path = %target.path.display(),
            lines = target.line_count,
            "Watch session created"
        );

        Ok(Self {
            id: SessionId::new(),
            target,
            state: SessionState::Idle,
            match_rule: None,
            missing_rules: Vec::new(),
            clock,
            events,
            consecutive_failures: 0,
        })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.target.path
    }

    #[must_use]
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn match_rule(&self) -> Option<&MatchRule> {
        self.match_rule.as_ref()
    }

    #[must_use]
    pub fn missing_rules(&self) -> &[MissingPatternRule] {
        &self.missing_rules
    }

    /// Polls in a row that failed to read the file.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sender side of the event channel, for handing out more receivers.
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<WatchEvent> {
        self.events.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Replace the match rule, returning the previous one.
    pub fn set_match_rule(&mut self, rule: MatchRule) -> Option<MatchRule> {
        self.match_rule.replace(rule)
    }

    pub fn add_missing_rule(&mut self, rule: MissingPatternRule) {
        self.missing_rules.push(rule);
    }

    pub fn apply(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetMatch(rule) => {
                if self.set_match_rule(rule).is_some() {
                    tracing::debug!(path = %self.target.path.display(), "Match rule replaced");
                }
            }
            SessionCommand::AddMissing(rule) => self.add_missing_rule(rule),
        }
    }

    /// Run one tick: read new lines, feed them to the rules, then check the
    /// missing-pattern timeouts.
    ///
    /// Never fails. An unreadable file skips the read and is retried on the
    /// next tick; timeouts are evaluated either way.
    pub fn poll(&mut self) -> PollReport {
        // Runs on the blocking pool, outside the scheduler's span.
        let span = tracing::error_span!("poll", path = %self.target.path.display());
        let _guard = span.enter();

        self.state = SessionState::Polling;
        let mut report = PollReport::default();

        match self.read_delta() {
            Ok(Some(delta)) => {
                self.consecutive_failures = 0;
                report.rotated = delta.rotated;
                report.lines = delta.lines.len();
                report.matched = self.dispatch(&delta.lines);
                self.commit(delta);
            }
            Ok(None) => {
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                report.unavailable = true;
                tracing::debug!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Log file unavailable, retrying next tick"
                );
                let _ = self.events.send(WatchEvent::Unavailable {
                    path: self.target.path.clone(),
                    consecutive_failures: self.consecutive_failures,
                });
            }
        }

        report.timeouts_fired = self.evaluate_timeouts();
        self.state = SessionState::Idle;
        report
    }

    /// Read the lines appended since the last successful poll.
    ///
    /// Returns `None` when the file has not changed. Only the lines counted in
    /// this snapshot are read, so anything appended mid-read is left for the
    /// next poll.
    fn read_delta(&self) -> Result<Option<LineDelta>, WatcherError> {
        let path = &self.target.path;
        let metadata = std::fs::metadata(path).map_err(|e| WatcherError::unavailable(path, e))?;
        let modified = metadata.modified().ok();
        let len = metadata.len();

        let newer = match (modified, self.target.modified) {
            (Some(current), Some(previous)) => current > previous,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer && len == self.target.len {
            return Ok(None);
        }

        let total = count_lines(path)?;
        let previous_lines = self.target.line_count;

        // Fewer lines than last time: assume the file was recreated. This cannot
        // tell a rewrite-in-place from a real rotation.
        let rotated = total < previous_lines;
        let baseline = if rotated { 0 } else { previous_lines };

        let lines = read_lines_from(path, baseline)?
            .take(total - baseline)
            .collect::<Result<Vec<_>, _>>()?;

        if rotated {
            tracing::warn!(
                previous_lines,
                current_lines = total,
                "Line count decreased, treating file as recreated"
            );
        }

        Ok(Some(LineDelta {
            line_count: baseline + lines.len(),
            lines,
            rotated,
            previous_lines,
            modified,
            len,
        }))
    }

    /// Offer each line to the rules in file order. Returns the match count.
    fn dispatch(&mut self, lines: &[String]) -> usize {
        let mut matched = 0;
        for line in lines {
            let now = self.clock.now();
            if let Some(rule) = self.match_rule.as_mut() {
                if rule.on_line(line, now) {
                    matched += 1;
                }
            }
            for rule in &mut self.missing_rules {
                rule.on_line(line, now);
            }
        }
        matched
    }

    fn commit(&mut self, delta: LineDelta) {
        self.target.modified = delta.modified;
        self.target.len = delta.len;
        self.target.line_count = delta.line_count;

        if delta.rotated {
            let _ = self.events.send(WatchEvent::Rotated {
                path: self.target.path.clone(),
                previous_lines: delta.previous_lines,
                current_lines: delta.line_count,
            });
        }

        if !delta.lines.is_empty() {
            tracing::trace!(lines = delta.lines.len(), total = delta.line_count, "New lines");
            let _ = self.events.send(WatchEvent::LinesAdded {
                path: self.target.path.clone(),
                lines: Arc::from(delta.lines),
            });
        }
    }

    fn evaluate_timeouts(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for rule in &mut self.missing_rules {
            if rule.evaluate(now) {
                fired += 1;
                let _ = self.events.send(WatchEvent::TimeoutFired {
                    path: self.target.path.clone(),
                    pattern: rule.predicate().label().to_string(),
                });
            }
        }
        fired
    }
}

impl fmt::Debug for FileWatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatchSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("match_rule", &self.match_rule)
            .field("missing_rules", &self.missing_rules)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}
