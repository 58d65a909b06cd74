//! Persisted teardown deadlines.
//!
//! Each pending teardown is `<dir>/<sandbox_id>.json`. Whoever renames the
//! entry away first (stop, timer or sweep) owns the teardown; everyone else
//! sees `None` from [`TeardownScheduler::claim`].

use std::io::ErrorKind;
use std::path::PathBuf;

use sandbox::{PortMapping, RunMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};

const ENTRY_EXT: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownEntry {
    pub sandbox_id: String,
    /// Unix seconds.
    pub due: i64,
    pub mode: RunMode,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TeardownScheduler {
    dir: PathBuf,
}

impl TeardownScheduler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, sandbox_id: &str) -> PathBuf {
        self.dir.join(format!("{sandbox_id}.{ENTRY_EXT}"))
    }

    pub async fn schedule(&self, entry: &TeardownEntry) -> RunnerResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec(entry)
            .map_err(|e| RunnerError::Internal(format!("serialize teardown entry: {e}")))?;
        let path = self.entry_path(&entry.sandbox_id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", entry.sandbox_id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(sandbox_id = %entry.sandbox_id, due = entry.due, "teardown scheduled");
        Ok(())
    }

    /// Take exclusive ownership of the pending teardown for `sandbox_id`.
    pub async fn claim(&self, sandbox_id: &str) -> Option<TeardownEntry> {
        let path = self.entry_path(sandbox_id);
        let claimed = self.dir.join(format!(
            "{sandbox_id}.{}.claimed",
            uuid::Uuid::new_v4().simple()
        ));
        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(sandbox_id, error = %e, "failed to claim teardown entry");
                return None;
            }
        }
        let bytes = tokio::fs::read(&claimed).await;
        let _ = tokio::fs::remove_file(&claimed).await;
        match bytes.map(|b| serde_json::from_slice::<TeardownEntry>(&b)) {
            Ok(Ok(entry)) => Some(entry),
            Ok(Err(e)) => {
                warn!(sandbox_id, error = %e, "corrupt teardown entry");
                None
            }
            Err(e) => {
                warn!(sandbox_id, error = %e, "unreadable teardown entry");
                None
            }
        }
    }

    /// Drop the pending teardown without running it.
    pub async fn cancel(&self, sandbox_id: &str) -> bool {
        tokio::fs::remove_file(self.entry_path(sandbox_id)).await.is_ok()
    }

    pub async fn pending(&self) -> Vec<TeardownEntry> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return Vec::new();
        };
        let mut pending = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await
                && let Ok(parsed) = serde_json::from_slice::<TeardownEntry>(&bytes)
            {
                pending.push(parsed);
            }
        }
        pending.sort_by_key(|e| e.due);
        pending
    }

    /// Ids whose deadline is at or before `now`.
    pub async fn due(&self, now: i64) -> Vec<String> {
        self.pending()
            .await
            .into_iter()
            .filter(|e| e.due <= now)
            .map(|e| e.sandbox_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn entry(id: &str, due: i64) -> TeardownEntry {
        TeardownEntry {
            sandbox_id: id.into(),
            due,
            mode: RunMode::Single,
            ports: vec![PortMapping::new(id, 32801, 80)],
            session_id: None,
        }
    }

    #[tokio::test]
    async fn claim_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(TeardownScheduler::new(dir.path()));
        scheduler.schedule(&entry("abc", 10)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move { s.claim("abc").await }));
        }
        let mut winners = 0;
        for h in handles {
            if let Some(claimed) = h.await.unwrap() {
                assert_eq!(claimed, entry("abc", 10));
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn due_filters_by_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = TeardownScheduler::new(dir.path());
        scheduler.schedule(&entry("late", 200)).await.unwrap();
        scheduler.schedule(&entry("early", 100)).await.unwrap();

        assert_eq!(scheduler.due(99).await, Vec::<String>::new());
        assert_eq!(scheduler.due(100).await, vec!["early"]);
        assert_eq!(scheduler.due(500).await, vec!["early", "late"]);
        assert_eq!(scheduler.pending().await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_prevents_claim() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = TeardownScheduler::new(dir.path());
        scheduler.schedule(&entry("abc", 10)).await.unwrap();

        assert!(scheduler.cancel("abc").await);
        assert!(!scheduler.cancel("abc").await);
        assert_eq!(scheduler.claim("abc").await, None);
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = TeardownScheduler::new(dir.path().join("nope"));
        assert!(scheduler.pending().await.is_empty());
        assert_eq!(scheduler.claim("abc").await, None);
    }
}
