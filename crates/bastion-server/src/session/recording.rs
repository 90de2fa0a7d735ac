//! Per-session audit recording.
//!
//! Each bastion session gets `session-<id>.jsonl` in the recordings
//! directory, in the [`bastion_core::audit`] line format. Recording is
//! best-effort: write failures are logged and disable the recorder, they
//! never end the session.

use bastion_core::audit::{AuditKind, AuditRecord, EVENT_SESSION_END, EVENT_SESSION_START};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Session recorder that appends audit records to a file.
pub struct SessionRecorder {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl SessionRecorder {
    /// Path of the recording for `session_id` inside `dir`.
    pub fn path_for(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("session-{session_id}.jsonl"))
    }

    /// Open the recording and write the `meta` and `session-start` records.
    pub async fn start(dir: &Path, session_id: &str, meta: Value) -> Self {
        let path = Self::path_for(dir, session_id);
        let file = match Self::open(dir, &path).await {
            Ok(file) => Some(file),
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot open recording, auditing disabled for session");
                None
            }
        };
        let recorder = Self {
            path,
            file: Mutex::new(file),
        };
        recorder.record(AuditRecord::now(AuditKind::Meta, meta)).await;
        recorder.record(AuditRecord::event(EVENT_SESSION_START)).await;
        recorder
    }

    async fn open(dir: &Path, path: &Path) -> std::io::Result<File> {
        tokio::fs::create_dir_all(dir).await?;
        OpenOptions::new().create(true).append(true).open(path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub async fn is_active(&self) -> bool {
        self.file.lock().await.is_some()
    }

    /// Append one record.
    pub async fn record(&self, record: AuditRecord) {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };
        let line = match record.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "failed to write recording, disabling");
            *guard = None;
        }
    }

    pub async fn stdin(&self, data: &[u8]) {
        self.record(AuditRecord::bytes(AuditKind::Stdin, data)).await;
    }

    pub async fn stdout(&self, data: &[u8]) {
        self.record(AuditRecord::bytes(AuditKind::Stdout, data)).await;
    }

    pub async fn resize(&self, cols: u32, rows: u32) {
        self.record(AuditRecord::resize(cols, rows)).await;
    }

    /// Write `session-end` and stop recording. Later calls are no-ops.
    pub async fn finish(&self) {
        self.record(AuditRecord::event(EVENT_SESSION_END)).await;
        if self.file.lock().await.take().is_some() {
            debug!(path = %self.path.display(), "recording closed");
        }
    }
}
