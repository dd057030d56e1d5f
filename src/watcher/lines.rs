//! Line counting and incremental line reading.
//!
//! Both helpers open the log for shared read so the producing process can
//! keep appending while we scan. A line is only a line once its terminating
//! `\n` has been written; a trailing partial line is neither counted nor
//! yielded, so the counter and the reader always agree.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use super::error::WatcherError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Open `path` for reading without locking out concurrent writers.
fn open_shared(path: &Path) -> Result<File, WatcherError> {
    let mut options = OpenOptions::new();
    options.read(true);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }

    options
        .open(path)
        .map_err(|e| WatcherError::unavailable(path, e))
}

/// Count the complete (newline-terminated) lines in the file at `path`.
///
/// # Errors
///
/// Returns [`WatcherError::IoUnavailable`] if the file cannot be opened or read.
pub fn count_lines(path: &Path) -> Result<usize, WatcherError> {
    let file = open_shared(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut count = 0;

    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(WatcherError::unavailable(path, e)),
        };
        if chunk.is_empty() {
            break;
        }
        count += chunk.iter().filter(|&&b| b == b'\n').count();
        let consumed = chunk.len();
        reader.consume(consumed);
    }

    Ok(count)
}

/// Open `path` and return a lazy iterator over the lines at index `start` and beyond.
///
/// # Errors
///
/// Returns [`WatcherError::IoUnavailable`] if the file cannot be opened.
pub fn read_lines_from(path: &Path, start: usize) -> Result<LineReader, WatcherError> {
    let file = open_shared(path)?;
    Ok(LineReader {
        path: path.to_path_buf(),
        reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
        buf: Vec::new(),
        next_index: 0,
        start,
        done: false,
    })
}

/// Streaming reader over the complete lines of a file, starting at a given index.
///
/// Yields lines without their terminator. Invalid UTF-8 is replaced rather than
/// rejected, since producers occasionally emit garbage bytes into logs.
#[derive(Debug)]
pub struct LineReader {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    next_index: usize,
    start: usize,
    done: bool,
}

impl Iterator for LineReader {
    type Item = Result<String, WatcherError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    if self.buf.last() != Some(&b'\n') {
                        // Writer is mid-line; leave it for a later poll.
                        self.done = true;
                        return None;
                    }
                    let index = self.next_index;
                    self.next_index += 1;
                    if index >= self.start {
                        return Some(Ok(decode_line(&self.buf)));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(WatcherError::unavailable(&self.path, e)));
                }
            }
        }
    }
}

impl FusedIterator for LineReader {}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if raw[..end].ends_with(b"\n") {
        end -= 1;
    }
    if raw[..end].ends_with(b"\r") {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn collect(path: &Path, start: usize) -> Vec<String> {
        read_lines_from(path, start)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_count_lines_empty_file() {
        let file = file_with("");
        assert_eq!(count_lines(file.path()).unwrap(), 0);
    }

    #[test]
    fn test_count_lines_ignores_partial_last_line() {
        let file = file_with("one\ntwo\nthree");
        assert_eq!(count_lines(file.path()).unwrap(), 2);
    }

    #[test]
    fn test_count_lines_counts_blank_lines() {
        let file = file_with("a\n\n\nb\n");
        assert_eq!(count_lines(file.path()).unwrap(), 4);
    }

    #[test]
    fn test_count_lines_missing_file() {
        let result = count_lines(Path::new("/tmp/log-sentinel-missing-8c1f.log"));
        assert!(matches!(result, Err(WatcherError::IoUnavailable { .. })));
    }

    #[test]
    fn test_read_lines_from_start() {
        let file = file_with("alpha\nbeta\ngamma\n");
        assert_eq!(collect(file.path(), 0), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_read_lines_skips_leading_lines() {
        let file = file_with("alpha\nbeta\ngamma\ndelta\n");
        assert_eq!(collect(file.path(), 2), vec!["gamma", "delta"]);
    }

    #[test]
    fn test_read_lines_start_past_end_is_empty() {
        let file = file_with("alpha\n");
        assert!(collect(file.path(), 5).is_empty());
    }

    #[test]
    fn test_read_lines_strips_crlf() {
        let file = file_with("windows\r\nunix\n");
        assert_eq!(collect(file.path(), 0), vec!["windows", "unix"]);
    }

    #[test]
    fn test_read_lines_stops_before_partial_line() {
        let file = file_with("done\nhalf-writ");
        let mut reader = read_lines_from(file.path(), 0).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), "done");
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_read_lines_replaces_invalid_utf8() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"ok\n\xff\xfebad\n").unwrap();
        file.flush().unwrap();
        let lines = collect(file.path(), 1);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("bad"));
    }

    #[test]
    fn test_read_lines_is_lazy() {
        let file = file_with("1\n2\n3\n");
        let mut reader = read_lines_from(file.path(), 0).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), "1");

        // Lines written after the reader opened are still picked up.
        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(b"4\n")
            .unwrap();
        let rest: Vec<String> = reader.map(Result::unwrap).collect();
        assert_eq!(rest, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_read_lines_missing_file() {
        let result = read_lines_from(Path::new("/tmp/log-sentinel-missing-8c1f.log"), 0);
        assert!(matches!(result, Err(WatcherError::IoUnavailable { .. })));
    }
}
