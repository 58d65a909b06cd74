use std::path::{Path, PathBuf};

use sandbox::SandboxError;

/// Directory names under the build root that are never sandboxes.
pub const SESSIONS_DIR: &str = "sessions";
pub const RATE_LIMIT_DIR: &str = ".ratelimit";
pub const SCHEDULE_DIR: &str = ".schedule";
pub const RESERVED_DIRS: [&str; 3] = [SESSIONS_DIR, RATE_LIMIT_DIR, SCHEDULE_DIR];
/// Held by the running daemon for its whole lifetime.
pub const DAEMON_LOCK: &str = ".daemon.lock";

const SANDBOX_ID_LEN: usize = 16;
const MAX_ID_LEN: usize = 64;

/// Layout of the build root.
///
/// ```text
/// <root>/<id>/exec.log
/// <root>/<id>/meta.json
/// <root>/<id>/src/          cloned repository, holds `.env`
/// <root>/sessions/<session>/<id>.flag
/// <root>/.schedule/<id>.json
/// <root>/.ratelimit/
/// ```
#[derive(Debug, Clone)]
pub struct BuildPaths {
    root: PathBuf,
}

impl BuildPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.sandbox_dir(id).join("src")
    }

    pub fn log(&self, id: &str) -> PathBuf {
        self.sandbox_dir(id).join("exec.log")
    }

    pub fn meta(&self, id: &str) -> PathBuf {
        self.sandbox_dir(id).join("meta.json")
    }

    pub fn env_file(&self, id: &str) -> PathBuf {
        self.work_dir(id).join(".env")
    }

    pub fn sessions(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    pub fn schedule(&self) -> PathBuf {
        self.root.join(SCHEDULE_DIR)
    }

    pub fn rate_limit(&self) -> PathBuf {
        self.root.join(RATE_LIMIT_DIR)
    }

    pub fn daemon_lock(&self) -> PathBuf {
        self.root.join(DAEMON_LOCK)
    }
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_DIRS.contains(&name)
}

/// Fresh sandbox id: 16 lowercase hex characters, valid as an image tag and
/// compose project name.
pub fn new_sandbox_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SANDBOX_ID_LEN);
    id
}

/// Strip everything outside `[A-Za-z0-9.-]`.
pub fn sanitize_id(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect()
}

/// Sanitize a caller-supplied sandbox id and check it names a plausible
/// sandbox directory.
pub fn validate_sandbox_id(input: &str) -> Result<String, SandboxError> {
    let id = sanitize_id(input);
    if id.is_empty() || id.len() > MAX_ID_LEN || id.starts_with('.') || is_reserved(&id) {
        return Err(SandboxError::InvalidInput("Invalid sandbox id".into()));
    }
    Ok(id)
}

/// Session ids become directory names, so they get the same treatment.
pub fn validate_session_id(input: &str) -> Result<String, SandboxError> {
    let id: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(SandboxError::InvalidInput("Invalid session".into()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_ids_are_tag_safe() {
        let id = new_sandbox_id();
        assert_eq!(id.len(), SANDBOX_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(id, new_sandbox_id());
    }

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_id("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_id("abc123-x.y"), "abc123-x.y");
    }

    #[test]
    fn validate_rejects_dot_and_empty() {
        assert!(validate_sandbox_id("../..").is_err());
        assert!(validate_sandbox_id("/;").is_err());
        assert!(validate_sandbox_id(&"a".repeat(65)).is_err());
        assert_eq!(validate_sandbox_id("ab/cd").unwrap(), "abcd");
    }

    #[test]
    fn validate_rejects_reserved_directories() {
        for name in RESERVED_DIRS {
            assert!(validate_sandbox_id(name).is_err(), "{name}");
        }
        assert!(validate_sandbox_id("sessions/").is_err());
    }

    #[test]
    fn session_ids_are_directory_safe() {
        assert_eq!(validate_session_id("s3ss/../x").unwrap(), "s3ssx");
        assert!(validate_session_id("../").is_err());
    }

    #[test]
    fn layout() {
        let paths = BuildPaths::new("/srv/builds");
        assert_eq!(paths.work_dir("abc"), PathBuf::from("/srv/builds/abc/src"));
        assert_eq!(paths.env_file("abc"), PathBuf::from("/srv/builds/abc/src/.env"));
        assert_eq!(paths.meta("abc"), PathBuf::from("/srv/builds/abc/meta.json"));
        assert!(is_reserved(".schedule"));
        assert!(!is_reserved("abc"));
    }
}
