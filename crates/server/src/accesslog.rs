//! Reopenable access log.
//!
//! One line per HTTP request. `SIGUSR1` reopens the file so external log
//! rotation can move the old file aside without losing writes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::ServerError;

/// Shared handle to the access log file, `None` when disabled.
pub struct AccessLog {
    path: String,
    file: Mutex<Option<File>>,
}

impl AccessLog {
    /// Open the log file, or create a disabled logger for an empty path.
    pub fn open(path: &str) -> Result<Self, ServerError> {
        let file = if path.is_empty() {
            None
        } else {
            Some(open_append(path)?)
        };
        Ok(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
        })
    }

    /// Whether request lines are being written anywhere.
    pub fn enabled(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Append one request line.
    pub fn record(
        &self,
        entry_point: &str,
        remote: &str,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
    ) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else { return };
        let line = format!(
            "{entry_point} {remote} \"{method} {path}\" {status} {}ms\n",
            duration.as_millis()
        );
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "access log write failed");
        }
    }

    /// Close and reopen the file at the configured path.
    ///
    /// Called on `SIGUSR1` after an external rotation; a reopen failure
    /// keeps the previous handle so no lines are lost.
    pub fn reopen(&self) {
        if self.path.is_empty() {
            return;
        }
        match open_append(&self.path) {
            Ok(file) => {
                *self.file.lock() = Some(file);
                tracing::info!(path = %self.path, "access log reopened");
            }
            Err(e) => warn!(path = %self.path, error = %e, "access log reopen failed"),
        }
    }
}

fn open_append(path: &str) -> Result<File, ServerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ServerError::AccessLog {
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_path_empty() {
        let log = AccessLog::open("").unwrap();
        assert!(!log.enabled());
        // Recording on a disabled log is a no-op.
        log.record("web", "10.0.0.1", "GET", "/", 200, Duration::from_millis(3));
    }

    #[test]
    fn writes_and_survives_rotation() {
        let dir = std::env::temp_dir().join(format!("fluxgate-accesslog-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("access.log");
        let path_str = path.to_str().unwrap();

        let log = AccessLog::open(path_str).unwrap();
        log.record("web", "10.0.0.1", "GET", "/a", 200, Duration::from_millis(1));

        // Simulate rotation: move the file aside, reopen, write again.
        let rotated = dir.join("access.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        log.reopen();
        log.record("web", "10.0.0.1", "GET", "/b", 404, Duration::from_millis(2));

        let old = std::fs::read_to_string(&rotated).unwrap();
        let new = std::fs::read_to_string(&path).unwrap();
        assert!(old.contains("\"GET /a\" 200"));
        assert!(new.contains("\"GET /b\" 404"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
