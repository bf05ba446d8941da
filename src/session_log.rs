//! Per-session event log files.
//!
//! One line per event, stamped with seconds since session start. Old logs
//! are pruned at startup so the directory holds only the newest few
//! sessions.

use crate::error::Result;
use chrono::Local;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// Session logs retained after pruning.
const KEEP_LOGS: usize = 5;

pub struct SessionLog {
    file: Mutex<File>,
    started: Instant,
    path: PathBuf,
}

impl SessionLog {
    /// Create `logs/session_<timestamp>.log` and prune older sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        prune_old_logs(dir);
        let name = format!("session_{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = dir.join(name);
        let file = File::create(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            started: Instant::now(),
            path,
        })
    }

    /// Append one event line, `[%7.2fs] <message>`.
    pub fn log(&self, message: &str) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = writeln!(file, "[{elapsed:7.2}s] {message}") {
            warn!("session log write failed: {e}");
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Keep only the newest [`KEEP_LOGS`] session logs (one slot is about to
/// be taken by the new session).
fn prune_old_logs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("session_") && n.ends_with(".log"))
        })
        .collect();
    // Timestamped names sort chronologically.
    logs.sort();
    while logs.len() >= KEEP_LOGS {
        let oldest = logs.remove(0);
        if let Err(e) = std::fs::remove_file(&oldest) {
            warn!("failed to prune old session log {}: {e}", oldest.display());
        }
    }
}
