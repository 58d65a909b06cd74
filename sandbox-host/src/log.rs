use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Timestamp format used for every line of a sandbox log.
pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only, human-readable log of one sandbox build.
///
/// Every write reopens the file in append mode so concurrent readers (the tail
/// endpoint) always see complete, flushed data. Write failures are reported via
/// tracing and never abort a build.
#[derive(Debug, Clone)]
pub struct SandboxLog {
    path: PathBuf,
}

impl SandboxLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[YYYY-mm-dd HH:MM:SS] message`.
    pub async fn line(&self, message: impl AsRef<str>) {
        let now = chrono::Local::now().format(LOG_TIME_FORMAT);
        self.raw(&format!("[{now}] {}\n", message.as_ref())).await;
    }

    /// Append `text` as-is.
    pub async fn raw(&self, text: &str) {
        if let Err(e) = append(&self.path, text.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "failed to append to sandbox log");
        }
    }
}

/// Open `path` for appending, creating it if needed.
pub(crate) async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = open_append(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = SandboxLog::new(dir.path().join("exec.log"));
        log.line("first").await;
        log.raw("=== banner ===\n").await;
        log.line("second").await;

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert_eq!(lines[1], "=== banner ===");
        assert!(lines[2].ends_with("] second"));
    }

    #[tokio::test]
    async fn write_failure_does_not_panic() {
        let log = SandboxLog::new("/nonexistent-dir/exec.log");
        log.line("dropped").await;
    }
}
