use std::path::Path;

use sandbox::{PortMapping, RunMode};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

/// What a running sandbox needs torn down, persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    #[serde(default = "default_mode", deserialize_with = "lenient_mode")]
    pub mode: RunMode,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub container_ids: Vec<String>,
    /// Unix seconds.
    #[serde(default)]
    pub created: i64,
    /// Seconds.
    #[serde(default)]
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

fn default_mode() -> RunMode {
    RunMode::Single
}

/// Anything other than `compose` is a single container.
fn lenient_mode<'de, D: serde::Deserializer<'de>>(d: D) -> Result<RunMode, D::Error> {
    let mode = String::deserialize(d)?;
    Ok(if mode == "compose" {
        RunMode::Compose
    } else {
        RunMode::Single
    })
}

impl RunMeta {
    /// Atomic write via a temp file and rename.
    pub async fn save(&self, path: &Path) -> RunnerResult<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| RunnerError::Internal(format!("serialize meta: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// `None` when the file is missing or unreadable.
    pub async fn load(path: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable meta.json");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunMeta {
        RunMeta {
            mode: RunMode::Compose,
            ports: vec![PortMapping::new("db", 40001, 5432)],
            container_ids: vec!["abc-db-id".into()],
            created: 1_700_000_000,
            ttl: 3600,
            session_id: Some("s1".into()),
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        sample().save(&path).await.unwrap();

        assert_eq!(RunMeta::load(&path).await, Some(sample()));
        assert!(!dir.path().join("meta.json.tmp").exists());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["mode"], "compose");
        assert_eq!(json["containerIds"][0], "abc-db-id");
        assert_eq!(json["ports"][0]["hostPort"], 40001);
        assert_eq!(json["ports"][0]["containerPort"], 5432);
        assert_eq!(json["sessionId"], "s1");
    }

    #[test]
    fn unknown_mode_is_single() {
        let meta: RunMeta = serde_json::from_str(r#"{"mode":"swarm"}"#).unwrap();
        assert_eq!(meta.mode, RunMode::Single);
        assert!(meta.ports.is_empty());
    }

    #[tokio::test]
    async fn missing_or_corrupt_meta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        assert_eq!(RunMeta::load(&path).await, None);
        std::fs::write(&path, "{").unwrap();
        assert_eq!(RunMeta::load(&path).await, None);
    }
}
