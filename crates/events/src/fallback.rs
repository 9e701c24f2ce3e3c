//! Last-resort sink for events neither bus topic accepted.
//!
//! Every record is emitted as an `error`-level log line under the
//! `event_fallback` target. When a path is configured the exact message
//! bytes are also appended to a JSON-lines file that operators can replay.
//! Operators must watch one or the other: an unmonitored fallback log is
//! effectively a lost event.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only local event log.
pub struct LocalEventLog {
    path: Option<PathBuf>,
    /// Serializes appends so concurrent lines never interleave.
    write_lock: Mutex<()>,
}

impl LocalEventLog {
    /// Log records only, no file.
    pub fn log_only() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Log records and append to `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one message that could not be delivered to `topic`.
    pub async fn append(&self, topic: &str, payload: &[u8]) -> Result<(), std::io::Error> {
        tracing::error!(
            target: "event_fallback",
            topic,
            payload = %String::from_utf8_lossy(payload),
            "Event not delivered to the bus; recorded in local fallback log"
        );

        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Default for LocalEventLog {
    fn default() -> Self {
        Self::log_only()
    }
}
