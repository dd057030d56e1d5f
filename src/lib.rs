//! Log Sentinel - tail growing log files and alert on found or missing patterns.

pub mod alert;
pub mod config;
pub mod watcher;
