//! Per-instance log isolation
//!
//! Layout: `<run_dir>/instance_<ordinal>_<stamp>/attempt_<restart>.log`. Every
//! (re)start gets a fresh file so successive attempts never overwrite or interleave.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

use super::error::{FleetError, FleetResult};

/// Owns the log directory of one instance
#[derive(Debug, Clone)]
pub struct LogManager {
    ordinal: usize,
    dir: PathBuf,
}

impl LogManager {
    pub fn new(run_dir: &Path, stamp: &str, ordinal: usize) -> Self {
        Self {
            ordinal,
            dir: run_dir.join(format!("instance_{:02}_{}", ordinal, stamp)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn attempt_path(&self, restart_count: u32) -> PathBuf {
        self.dir.join(format!("attempt_{:03}.log", restart_count))
    }

    /// Open the capture file for an attempt, creating the directory on demand
    pub fn open_attempt(&self, restart_count: u32, command_line: &str) -> FleetResult<(PathBuf, File)> {
        let logging = |e: std::io::Error| FleetError::Logging {
            ordinal: self.ordinal,
            reason: e.to_string(),
        };

        std::fs::create_dir_all(&self.dir).map_err(logging)?;
        let path = self.attempt_path(restart_count);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(logging)?;
        writeln!(
            file,
            "=== instance {} attempt {} started {} ===\n=== {} ===",
            self.ordinal,
            restart_count,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            command_line
        )
        .map_err(logging)?;

        Ok((path, file))
    }
}

/// Read the last `lines` lines of a log file. Invalid UTF-8 is replaced.
pub fn tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = std::collections::VecDeque::with_capacity(lines + 1);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        buf.push_back(line.trim_end_matches(['\n', '\r']).to_string());
        if buf.len() > lines {
            buf.pop_front();
        }
    }
    Ok(buf.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogManager::new(dir.path(), "20240101_000000", 3);

        let (first, mut f1) = logs.open_attempt(0, "server -a").unwrap();
        writeln!(f1, "first run").unwrap();
        let (second, mut f2) = logs.open_attempt(1, "server -a").unwrap();
        writeln!(f2, "second run").unwrap();

        assert_ne!(first, second);
        assert_eq!(
            logs.dir(),
            dir.path().join("instance_03_20240101_000000").as_path()
        );
        assert!(first.ends_with("attempt_000.log"));
        let text = std::fs::read_to_string(&first).unwrap();
        assert!(text.contains("first run"));
        assert!(!text.contains("second run"));
    }

    #[test]
    fn reopening_an_attempt_appends() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogManager::new(dir.path(), "s", 0);
        let (path, mut f) = logs.open_attempt(0, "x").unwrap();
        writeln!(f, "kept").unwrap();
        drop(f);
        logs.open_attempt(0, "x").unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("kept"));
    }

    #[test]
    fn unwritable_root_is_a_logging_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let logs = LogManager::new(&blocker, "s", 1);
        match logs.open_attempt(0, "x") {
            Err(FleetError::Logging { ordinal, .. }) => assert_eq!(ordinal, 1),
            other => panic!("expected logging error, got {:?}", other.map(|(p, _)| p)),
        }
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail(&path, 2).unwrap(), vec!["c", "d"]);
        assert_eq!(tail(&path, 10).unwrap().len(), 4);
    }
}
