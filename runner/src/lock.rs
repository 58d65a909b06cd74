use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{RunnerError, RunnerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers at once.
    Shared,
    /// A single writer.
    Exclusive,
}

/// Take a flock on `path` on the current thread, blocking until available.
///
/// The lock file is created if missing. The returned guard holds the lock
/// until dropped.
pub fn lock_blocking(path: &Path, mode: LockMode) -> RunnerResult<Flock<File>> {
    let file = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| RunnerError::Internal(format!("open lock {}: {e}", path.display())))?;
    let arg = match mode {
        LockMode::Shared => FlockArg::LockShared,
        LockMode::Exclusive => FlockArg::LockExclusive,
    };
    Flock::lock(file, arg)
        .map_err(|(_file, e)| RunnerError::Internal(format!("flock {}: {e}", path.display())))
}

/// Acquire an exclusive flock on the given path without blocking the runtime.
///
/// The returned guard holds the lock until dropped.
pub async fn acquire(path: PathBuf) -> RunnerResult<Flock<File>> {
    tokio::task::spawn_blocking(move || lock_blocking(&path, LockMode::Exclusive))
        .await
        .map_err(|e| RunnerError::Internal(format!("lock task: {e}")))?
}
