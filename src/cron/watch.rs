use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Detects crontab file changes by modification time.
#[derive(Debug)]
pub struct CrontabWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl CrontabWatcher {
    /// Starts from the file's current state, so the first change after this
    /// call is reported.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let modified = modified_time(&path);
        Self { path, modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the modification time moved since the last call. A file that
    /// disappears is not a change.
    pub fn changed(&mut self) -> bool {
        let current = modified_time(&self.path);
        if current.is_none() || current == self.modified {
            return false;
        }
        self.modified = current;
        true
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
