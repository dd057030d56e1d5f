//! Log file watcher.
//!
//! Polls append-only log files, hands each new line to match and
//! missing-pattern rules, and survives truncation and recreation of the
//! files it watches.

mod clock;
mod error;
mod lines;
mod rules;
mod scheduler;
mod session;
mod watch_set;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ReactionError, WatcherError};
pub use lines::{count_lines, read_lines_from, LineReader};
pub use rules::{
    LineObserver, LinePredicate, MatchReaction, MatchRule, MissingPatternRule, TimeoutReaction,
    TimerState,
};
pub use scheduler::{PollScheduler, SessionHandle, DEFAULT_POLL_TIMEOUT, MIN_POLL_INTERVAL};
pub use session::{
    FileWatchSession, LineDelta, PollReport, SessionCommand, SessionId, SessionState, WatchEvent,
    WatchTarget, EVENT_CHANNEL_CAPACITY,
};
pub use watch_set::WatchSet;
