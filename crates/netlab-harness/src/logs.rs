//! Per-instance append-only log streams.
//!
//! Every instance owns one text file under the log root, named
//! `{prefix}__{instance}.txt`. The first line is the resolved command; both
//! output streams of the spawned process append after it. These files are
//! the synchronization surface between the harness and its child processes,
//! so the rest of the engine reads them only through [`LogReader`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Read access to an instance's log stream. Must tolerate the file not yet
/// existing — spawn and first write race with the first discovery poll.
pub trait LogReader: Sync {
    fn read_all(&self, instance: &str) -> Vec<String>;
}

/// One case run's log directory.
#[derive(Debug, Clone)]
pub struct LogDir {
    root: PathBuf,
    prefix: String,
}

impl LogDir {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Path of one instance's log file.
    pub fn path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}__{}.txt", self.prefix, instance))
    }

    /// Create the instance's log file, write the command header, and return
    /// the handle the spawned process appends to.
    pub fn open_sink(&self, instance: &str, command: &str) -> io::Result<File> {
        fs::create_dir_all(&self.root)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path(instance))?;
        writeln!(file, "cmd: {command}\n")?;
        file.flush()?;
        Ok(file)
    }

    /// Last `n` lines of an instance's log, for diagnostics.
    pub fn tail(&self, instance: &str, n: usize) -> Vec<String> {
        let lines = self.read_all(instance);
        let skip = lines.len().saturating_sub(n);
        lines.into_iter().skip(skip).collect()
    }
}

impl LogReader for LogDir {
    fn read_all(&self, instance: &str) -> Vec<String> {
        match fs::read_to_string(self.path(instance)) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            // Not created yet, or already cleaned up: an empty tail.
            Err(_) => Vec::new(),
        }
    }
}
