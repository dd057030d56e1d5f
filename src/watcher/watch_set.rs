//! Registration surface for watching many log files.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::clock::{Clock, SystemClock};
use super::error::{ReactionError, WatcherError};
use super::rules::{LinePredicate, MatchRule, MissingPatternRule};
use super::scheduler::{PollScheduler, SessionHandle};
use super::session::{FileWatchSession, SessionCommand, SessionId, WatchEvent};

/// A set of independently polled log files and the rules attached to them.
#[derive(Debug)]
pub struct WatchSet {
    scheduler: PollScheduler,
    sessions: HashMap<SessionId, SessionHandle>,
    clock: Arc<dyn Clock>,
}

impl WatchSet {
    #[must_use]
    pub fn new() -> Self {
        Self::with_scheduler(PollScheduler::new(), Arc::new(SystemClock))
    }

    /// Build a watch set around a specific scheduler and time source.
    #[must_use]
    pub fn with_scheduler(scheduler: PollScheduler, clock: Arc<dyn Clock>) -> Self {
        Self {
            scheduler,
            sessions: HashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&SessionHandle> {
        self.sessions.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionHandle> {
        self.sessions.values()
    }

    /// Start polling `path` every `check_interval`.
    ///
    /// Lines already in the file are not reported; only lines appended from
    /// now on are.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::PathNotFound`] if `path` does not exist, or
    /// [`WatcherError::IoUnavailable`] if it cannot be read for the initial
    /// snapshot.
    pub fn start_watching(
        &mut self,
        path: impl AsRef<Path>,
        check_interval: Duration,
    ) -> Result<SessionId, WatcherError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(WatcherError::PathNotFound(path.to_path_buf()));
        }

        let session = FileWatchSession::start(path, Arc::clone(&self.clock))?;
        self.scheduler.reap();
        let handle = self.scheduler.spawn(session, check_interval);
        let id = handle.id();
        self.sessions.insert(id, handle);
        Ok(id)
    }

    /// Set the match rule for a session, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::SessionNotFound`] for an unknown or stopped id.
    pub fn register_match<F>(
        &self,
        id: SessionId,
        predicate: LinePredicate,
        reaction: F,
    ) -> Result<(), WatcherError>
    where
        F: FnMut(&str) -> Result<(), ReactionError> + Send + 'static,
    {
        self.handle(id)?
            .send(SessionCommand::SetMatch(MatchRule::new(predicate, reaction)))
    }

    /// Add a missing-pattern rule to a session. Its clock starts now.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::SessionNotFound`] for an unknown or stopped id.
    pub fn register_missing_pattern_timeout<F>(
        &self,
        id: SessionId,
        predicate: LinePredicate,
        timeout: Duration,
        reaction: F,
    ) -> Result<(), WatcherError>
    where
        F: FnMut() -> Result<(), ReactionError> + Send + 'static,
    {
        let rule = MissingPatternRule::new(predicate, timeout, reaction, self.clock.now());
        self.handle(id)?.send(SessionCommand::AddMissing(rule))
    }

    /// Receive this session's [`WatchEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::SessionNotFound`] for an unknown or stopped id.
    pub fn subscribe(&self, id: SessionId) -> Result<broadcast::Receiver<WatchEvent>, WatcherError> {
        Ok(self.handle(id)?.subscribe())
    }

    /// Like [`WatchSet::subscribe`], as a `Stream`.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::SessionNotFound`] for an unknown or stopped id.
    pub fn events(&self, id: SessionId) -> Result<BroadcastStream<WatchEvent>, WatcherError> {
        self.subscribe(id).map(BroadcastStream::new)
    }

    /// Stop polling a session. Returns `false` if it was already stopped.
    ///
    /// The task exits at its next await point. It is collected by a later
    /// `stop_watching`, `start_watching` or [`WatchSet::shutdown`].
    pub fn stop_watching(&mut self, id: SessionId) -> bool {
        let Some(handle) = self.sessions.remove(&id) else {
            return false;
        };
        handle.stop();
        self.scheduler.reap();
        true
    }

    /// Stop every session and wait for their tasks to exit.
    pub async fn shutdown(&mut self) {
        for handle in self.sessions.values() {
            handle.stop();
        }
        self.scheduler.shutdown().await;
        self.sessions.clear();
    }

    fn handle(&self, id: SessionId) -> Result<&SessionHandle, WatcherError> {
        self.sessions
            .get(&id)
            .ok_or(WatcherError::SessionNotFound(id))
    }
}

impl Default for WatchSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_watching_missing_path() {
        let dir = TempDir::new().unwrap();
        let mut set = WatchSet::new();
        let result = set.start_watching(dir.path().join("absent.log"), Duration::from_secs(1));
        assert!(matches!(result, Err(WatcherError::PathNotFound(_))));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_does_not_affect_others() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.log");
        std::fs::write(&present, "").unwrap();

        let mut set = WatchSet::new();
        let id = set.start_watching(&present, Duration::from_millis(50)).unwrap();
        assert!(set.start_watching(dir.path().join("absent.log"), Duration::from_millis(50)).is_err());

        assert_eq!(set.len(), 1);
        assert_eq!(set.session(id).unwrap().path(), present.as_path());
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_watching_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "").unwrap();

        let mut set = WatchSet::new();
        let id = set.start_watching(&path, Duration::from_millis(50)).unwrap();

        assert!(set.stop_watching(id));
        assert!(!set.stop_watching(id));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_task_reaped_on_next_start() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");
        std::fs::write(&first, "").unwrap();
        std::fs::write(&second, "").unwrap();

        let mut set = WatchSet::new();
        let id = set.start_watching(&first, Duration::from_millis(20)).unwrap();
        assert!(set.stop_watching(id));
        tokio::time::sleep(Duration::from_millis(50)).await;

        set.start_watching(&second, Duration::from_millis(20)).unwrap();
        assert_eq!(set.scheduler.task_count(), 1);

        set.shutdown().await;
        assert_eq!(set.scheduler.task_count(), 0);
    }

    #[tokio::test]
    async fn test_register_on_unknown_session() {
        let set = WatchSet::new();
        let id = SessionId::new();
        let result = set.register_match(id, LinePredicate::contains("x"), |_| Ok(()));
        assert!(matches!(result, Err(WatcherError::SessionNotFound(_))));
        let result =
            set.register_missing_pattern_timeout(id, LinePredicate::contains("x"), Duration::from_secs(1), || {
                Ok(())
            });
        assert!(matches!(result, Err(WatcherError::SessionNotFound(_))));
        assert!(set.subscribe(id).is_err());
    }
}
