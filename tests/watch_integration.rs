//! Integration tests for watching live log files.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log_sentinel::watcher::{
    LinePredicate, ManualClock, PollScheduler, SessionId, WatchEvent, WatchSet, WatcherError,
};
use regex::Regex;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

const TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

fn append(path: &Path, content: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

fn proofs() -> LinePredicate {
    LinePredicate::regex(Regex::new(r"Found [1-9]+ proofs\.").unwrap())
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<WatchEvent>, mut wanted: F) -> WatchEvent
where
    F: FnMut(&WatchEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        if wanted(&event) {
            return event;
        }
    }
}

async fn next_lines(rx: &mut broadcast::Receiver<WatchEvent>) -> Vec<String> {
    match wait_for(rx, |e| matches!(e, WatchEvent::LinesAdded { .. })).await {
        WatchEvent::LinesAdded { lines, .. } => lines.to_vec(),
        _ => unreachable!(),
    }
}

/// Give the session task a moment to apply a registration.
async fn settle() {
    tokio::time::sleep(TICK * 5).await;
}

#[tokio::test]
async fn test_found_proofs_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "line 1\nline 2\nline 3\n").unwrap();

    let mut set = WatchSet::new();
    let id = set.start_watching(&path, TICK).unwrap();
    let mut rx = set.subscribe(id).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    set.register_match(id, proofs(), move |line| {
        sink.lock().unwrap().push(line.to_string());
        Ok(())
    })
    .unwrap();
    settle().await;

    append(&path, "A\nFound 5 proofs.\n");

    assert_eq!(next_lines(&mut rx).await, vec!["A", "Found 5 proofs."]);
    assert_eq!(*seen.lock().unwrap(), vec!["Found 5 proofs."]);

    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    set.shutdown().await;
}

#[tokio::test]
async fn test_missing_pattern_fires_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "").unwrap();

    let clock = ManualClock::new();
    let mut set = WatchSet::with_scheduler(PollScheduler::new(), Arc::new(clock.clone()));
    let id = set.start_watching(&path, TICK).unwrap();
    let mut rx = set.subscribe(id).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    set.register_missing_pattern_timeout(
        id,
        LinePredicate::contains("eligible for farming"),
        Duration::from_secs(5 * 60),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(5 * 60));
    let event = wait_for(&mut rx, |e| matches!(e, WatchEvent::TimeoutFired { .. })).await;
    if let WatchEvent::TimeoutFired { pattern, .. } = event {
        assert_eq!(pattern, r#"contains "eligible for farming""#);
    }

    clock.advance(Duration::from_secs(10 * 60));
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    set.shutdown().await;
}

#[tokio::test]
async fn test_satisfying_line_postpones_timeout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "").unwrap();

    let clock = ManualClock::new();
    let mut set = WatchSet::with_scheduler(PollScheduler::new(), Arc::new(clock.clone()));
    let id = set.start_watching(&path, TICK).unwrap();
    let mut rx = set.subscribe(id).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    set.register_missing_pattern_timeout(
        id,
        LinePredicate::contains("eligible"),
        Duration::from_secs(60),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();
    settle().await;

    clock.advance(Duration::from_secs(45));
    append(&path, "2 plots were eligible for farming\n");
    next_lines(&mut rx).await;

    clock.advance(Duration::from_secs(45));
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(15));
    wait_for(&mut rx, |e| matches!(e, WatchEvent::TimeoutFired { .. })).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    set.shutdown().await;
}

#[tokio::test]
async fn test_truncated_file_read_from_start() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    let original: String = (0..100).map(|i| format!("old line {i}\n")).collect();
    std::fs::write(&path, original).unwrap();

    let mut set = WatchSet::new();
    let id = set.start_watching(&path, TICK).unwrap();
    let mut rx = set.subscribe(id).unwrap();

    // Recreate the file the way a rotating logger would.
    let replacement = dir.path().join("debug.log.new");
    std::fs::write(&replacement, "new 1\nnew 2\n").unwrap();
    std::fs::rename(&replacement, &path).unwrap();

    let rotated = wait_for(&mut rx, |e| matches!(e, WatchEvent::Rotated { .. })).await;
    assert!(matches!(
        rotated,
        WatchEvent::Rotated {
            previous_lines: 100,
            current_lines: 2,
            ..
        }
    ));
    assert_eq!(next_lines(&mut rx).await, vec!["new 1", "new 2"]);
    set.shutdown().await;
}

#[tokio::test]
async fn test_misbehaving_reaction_keeps_session_alive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "").unwrap();

    let mut set = WatchSet::new();
    let id = set.start_watching(&path, TICK).unwrap();
    let mut rx = set.subscribe(id).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    set.register_match(id, proofs(), move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("alert player crashed");
        }
        Err("alert player missing".into())
    })
    .unwrap();
    settle().await;

    append(&path, "Found 1 proofs.\n");
    next_lines(&mut rx).await;
    append(&path, "Found 2 proofs.\n");
    next_lines(&mut rx).await;
    append(&path, "Found 3 proofs.\n");
    next_lines(&mut rx).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    set.shutdown().await;
}

#[tokio::test]
async fn test_files_are_watched_independently() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.log");
    let second = dir.path().join("second.log");
    std::fs::write(&first, "").unwrap();
    std::fs::write(&second, "").unwrap();

    let mut set = WatchSet::new();
    let first_id = set.start_watching(&first, TICK).unwrap();
    let second_id = set.start_watching(&second, TICK).unwrap();
    assert_ne!(first_id, second_id);

    let mut first_rx = set.subscribe(first_id).unwrap();
    let mut second_rx = set.subscribe(second_id).unwrap();

    // Removing one file must not disturb the other.
    std::fs::remove_file(&first).unwrap();
    wait_for(&mut first_rx, |e| matches!(e, WatchEvent::Unavailable { .. })).await;

    append(&second, "second only\n");
    assert_eq!(next_lines(&mut second_rx).await, vec!["second only"]);

    // The producer recreates the file; watching resumes.
    std::fs::write(&first, "back\n").unwrap();
    assert_eq!(next_lines(&mut first_rx).await, vec!["back"]);
    set.shutdown().await;
}

#[tokio::test]
async fn test_event_stream() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "").unwrap();

    let mut set = WatchSet::new();
    let id = set.start_watching(&path, TICK).unwrap();
    let mut events = set.events(id).unwrap();

    append(&path, "streamed\n");

    let event = tokio::time::timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for stream")
        .unwrap()
        .unwrap();
    assert!(matches!(event, WatchEvent::LinesAdded { ref lines, .. } if lines[0] == "streamed"));
    set.shutdown().await;
}

#[tokio::test]
async fn test_stop_watching_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug.log");
    std::fs::write(&path, "").unwrap();

    let mut set = WatchSet::new();
    let id = set.start_watching(&path, TICK).unwrap();

    assert!(set.stop_watching(id));
    assert!(!set.stop_watching(id));
    assert!(matches!(
        set.register_match(id, proofs(), |_| Ok(())),
        Err(WatcherError::SessionNotFound(_))
    ));
    set.shutdown().await;
}

#[tokio::test]
async fn test_start_watching_missing_file() {
    let dir = TempDir::new().unwrap();
    let mut set = WatchSet::new();
    let result = set.start_watching(dir.path().join("never.log"), TICK);
    assert!(matches!(result, Err(WatcherError::PathNotFound(_))));
    tokio_test::assert_err!(set.subscribe(SessionId::new()));
}
