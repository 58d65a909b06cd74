//! Per-session sandbox quota, tracked as flag files.
//!
//! `<sessions>/<session>/<sandbox_id>.flag` exists while a sandbox counts
//! against its session. All mutation happens under `<sessions>/.lock`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sandbox::SandboxError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RunnerResult;
use crate::lock::{LockMode, lock_blocking};

const FLAG_EXT: &str = "flag";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFlag {
    pub started: i64,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct SessionQuota {
    dir: PathBuf,
    max_per_session: usize,
    /// Flags older than this no longer count.
    stale_after: Duration,
}

fn is_flag(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(FLAG_EXT)
}

fn older_than(path: &Path, age: Duration, now: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

fn flags_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| is_flag(p))
                .collect()
        })
        .unwrap_or_default()
}

impl SessionQuota {
    pub fn new(dir: impl Into<PathBuf>, max_per_session: usize, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_per_session,
            stale_after,
        }
    }

    fn flag_path(&self, session: &str, sandbox_id: &str) -> PathBuf {
        self.dir.join(session).join(format!("{sandbox_id}.{FLAG_EXT}"))
    }

    fn lock(&self) -> RunnerResult<nix::fcntl::Flock<std::fs::File>> {
        std::fs::create_dir_all(&self.dir)?;
        lock_blocking(&self.dir.join(LOCK_FILE), LockMode::Exclusive)
    }

    /// Live flags for `session`, after dropping stale ones.
    pub fn active(&self, session: &str) -> usize {
        let now = SystemTime::now();
        flags_in(&self.dir.join(session))
            .into_iter()
            .filter(|f| !older_than(f, self.stale_after, now))
            .count()
    }

    /// Count `sandbox_id` against `session`, failing when the session is full.
    pub fn reserve(&self, session: &str, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock()?;
        let session_dir = self.dir.join(session);
        std::fs::create_dir_all(&session_dir)?;

        let now = SystemTime::now();
        for flag in flags_in(&session_dir) {
            if older_than(&flag, self.stale_after, now) {
                debug!(flag = %flag.display(), "dropping stale session flag");
                let _ = std::fs::remove_file(&flag);
            }
        }
        if flags_in(&session_dir).len() >= self.max_per_session {
            return Err(SandboxError::QuotaExceeded(format!(
                "Limit reached: max {} concurrent sandboxes per session",
                self.max_per_session
            ))
            .into());
        }

        let flag = SessionFlag {
            started: chrono::Utc::now().timestamp(),
            id: sandbox_id.to_string(),
        };
        let json = serde_json::to_vec(&flag).map_err(std::io::Error::other)?;
        std::fs::write(self.flag_path(session, sandbox_id), json)?;
        Ok(())
    }

    pub fn release(&self, session: &str, sandbox_id: &str) {
        let path = self.flag_path(session, sandbox_id);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(session, sandbox_id, "session flag released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove session flag"),
        }
    }

    /// Remove the flag for `sandbox_id` from whichever session holds it.
    pub fn release_any(&self, sandbox_id: &str) -> usize {
        let Ok(sessions) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let name = format!("{sandbox_id}.{FLAG_EXT}");
        sessions
            .flatten()
            .map(|e| e.path().join(&name))
            .filter(|flag| std::fs::remove_file(flag).is_ok())
            .count()
    }

    /// Drop flags older than `age` and session directories left empty.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let Ok(_guard) = self.lock() else {
            return 0;
        };
        let Ok(sessions) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for session in sessions.flatten() {
            let session_dir = session.path();
            if !session_dir.is_dir() {
                continue;
            }
            for flag in flags_in(&session_dir) {
                if older_than(&flag, age, now) && std::fs::remove_file(&flag).is_ok() {
                    removed += 1;
                }
            }
            let empty = std::fs::read_dir(&session_dir).is_ok_and(|mut d| d.next().is_none());
            if empty && std::fs::remove_dir(&session_dir).is_ok() {
                info!(session = %session_dir.display(), "removed empty session directory");
            }
        }
        removed
    }
}
