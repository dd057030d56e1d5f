//! Match and missing-pattern rules.
//!
//! A session offers every new line to its rules through [`LineObserver`].
//! [`MatchRule`] reacts to each satisfying line; [`MissingPatternRule`] only
//! records when it last saw one and fires once if it stays quiet too long.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;

use super::error::ReactionError;

/// Reaction invoked with each line satisfying a [`MatchRule`].
pub type MatchReaction = Box<dyn FnMut(&str) -> Result<(), ReactionError> + Send>;

/// Reaction invoked once when a [`MissingPatternRule`] times out.
pub type TimeoutReaction = Box<dyn FnMut() -> Result<(), ReactionError> + Send>;

/// Something that wants to see every new line of a watched file.
pub trait LineObserver {
    /// Offer `line`, observed at `now`. Returns whether the line satisfied
    /// the observer's predicate.
    fn on_line(&mut self, line: &str, now: Instant) -> bool;
}

/// A shareable test over a single line of text.
#[derive(Clone)]
pub struct LinePredicate {
    label: Arc<str>,
    test: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl LinePredicate {
    /// Wrap an arbitrary closure.
    pub fn new<F>(label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            label: Arc::from(label.into()),
            test: Arc::new(test),
        }
    }

    /// Lines containing a match for `regex`.
    #[must_use]
    pub fn regex(regex: Regex) -> Self {
        let label = regex.as_str().to_string();
        Self::new(label, move |line| regex.is_match(line))
    }

    /// Lines containing `needle` verbatim.
    pub fn contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        let label = format!("contains {needle:?}");
        Self::new(label, move |line| line.contains(needle.as_str()))
    }

    /// Human-readable description, used in logs and events.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Evaluate the predicate. A panicking predicate counts as "no match".
    #[must_use]
    pub fn matches(&self, line: &str) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.test)(line))) {
            Ok(matched) => matched,
            Err(payload) => {
                tracing::error!(
                    predicate = %self.label,
                    panic = %panic_message(payload.as_ref()),
                    "Line predicate panicked"
                );
                false
            }
        }
    }
}

impl fmt::Debug for LinePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinePredicate").field(&self.label).finish()
    }
}

impl From<Regex> for LinePredicate {
    fn from(regex: Regex) -> Self {
        Self::regex(regex)
    }
}

/// Predicate plus the reaction fired for every line that satisfies it.
pub struct MatchRule {
    predicate: LinePredicate,
    reaction: MatchReaction,
    matches: u64,
}

impl MatchRule {
    pub fn new<F>(predicate: LinePredicate, reaction: F) -> Self
    where
        F: FnMut(&str) -> Result<(), ReactionError> + Send + 'static,
    {
        Self {
            predicate,
            reaction: Box::new(reaction),
            matches: 0,
        }
    }

    #[must_use]
    pub fn predicate(&self) -> &LinePredicate {
        &self.predicate
    }

    /// Number of lines this rule has matched so far.
    #[must_use]
    pub fn matches(&self) -> u64 {
        self.matches
    }
}

impl LineObserver for MatchRule {
    fn on_line(&mut self, line: &str, _now: Instant) -> bool {
        if !self.predicate.matches(line) {
            return false;
        }
        self.matches = self.matches.saturating_add(1);
        tracing::debug!(predicate = %self.predicate.label(), line = %line, "Line matched");
        let reaction = &mut self.reaction;
        run_reaction("match", || reaction(line));
        true
    }
}

impl fmt::Debug for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRule")
            .field("predicate", &self.predicate)
            .field("matches", &self.matches)
            .finish_non_exhaustive()
    }
}

/// State of a [`MissingPatternRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting; the reaction has not run.
    Armed,
    /// The reaction has run. Terminal.
    Fired,
}

/// Fires a one-shot reaction when no line has satisfied the predicate for
/// `timeout`.
///
/// The clock starts at creation and restarts whenever a satisfying line is
/// observed. Once fired the rule stays fired for the rest of its life.
pub struct MissingPatternRule {
    predicate: LinePredicate,
    timeout: Duration,
    reaction: TimeoutReaction,
    last_occurrence: Instant,
    fired: bool,
}

impl MissingPatternRule {
    /// Create an armed rule whose clock starts at `now`.
    pub fn new<F>(predicate: LinePredicate, timeout: Duration, reaction: F, now: Instant) -> Self
    where
        F: FnMut() -> Result<(), ReactionError> + Send + 'static,
    {
        Self {
            predicate,
            timeout,
            reaction: Box::new(reaction),
            last_occurrence: now,
            fired: false,
        }
    }

    #[must_use]
    pub fn predicate(&self) -> &LinePredicate {
        &self.predicate
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn last_occurrence(&self) -> Instant {
        self.last_occurrence
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        if self.fired {
            TimerState::Fired
        } else {
            TimerState::Armed
        }
    }

    /// Time since the predicate was last satisfied (or since creation).
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_occurrence)
    }

    #[must_use]
    pub fn is_timeout_reached(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.timeout
    }

    /// Fire the reaction if the timeout has been reached and the rule is still
    /// armed. Returns `true` only on the call that fires.
    ///
    /// A reaction that fails still leaves the rule fired.
    pub fn evaluate(&mut self, now: Instant) -> bool {
        if self.fired || !self.is_timeout_reached(now) {
            return false;
        }
        self.fired = true;
        tracing::warn!(
            predicate = %self.predicate.label(),
            elapsed = ?self.elapsed(now),
            timeout = ?self.timeout,
            "Expected pattern missing, firing timeout reaction"
        );
        let reaction = &mut self.reaction;
        run_reaction("timeout", || reaction());
        true
    }
}

impl LineObserver for MissingPatternRule {
    fn on_line(&mut self, line: &str, now: Instant) -> bool {
        if !self.predicate.matches(line) {
            return false;
        }
        self.last_occurrence = now;
        tracing::trace!(predicate = %self.predicate.label(), "Missing-pattern clock reset");
        true
    }
}

impl fmt::Debug for MissingPatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MissingPatternRule")
            .field("predicate", &self.predicate)
            .field("timeout", &self.timeout)
            .field("last_occurrence", &self.last_occurrence)
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

/// Run a user reaction, containing both returned errors and panics.
///
/// Returns whether the reaction completed successfully.
fn run_reaction<F>(kind: &'static str, reaction: F) -> bool
where
    F: FnOnce() -> Result<(), ReactionError>,
{
    match panic::catch_unwind(AssertUnwindSafe(reaction)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(reaction = kind, error = %e, "Reaction failed");
            false
        }
        Err(payload) => {
            tracing::error!(
                reaction = kind,
                panic = %panic_message(payload.as_ref()),
                "Reaction panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
