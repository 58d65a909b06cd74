use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of build descriptor found in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Dockerfile,
    Compose,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dockerfile => write!(f, "dockerfile"),
            Self::Compose => write!(f, "compose"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl BuildArtifact {
    pub fn dockerfile(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ArtifactKind::Dockerfile,
            path: path.into(),
        }
    }

    pub fn compose(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ArtifactKind::Compose,
            path: path.into(),
        }
    }

    /// Directory the descriptor lives in, used as build context / project directory.
    pub fn context_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}

/// How a sandbox's containers were started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Single,
    Compose,
}

impl From<ArtifactKind> for RunMode {
    fn from(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Dockerfile => Self::Single,
            ArtifactKind::Compose => Self::Compose,
        }
    }
}

/// A host port published for a container port of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub service: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(service: impl Into<String>, host_port: u16, container_port: u16) -> Self {
        Self {
            service: service.into(),
            host_port,
            container_port,
        }
    }
}

/// Running containers and published ports of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub mode: RunMode,
    pub ports: Vec<PortMapping>,
    pub container_ids: Vec<String>,
}

/// Result of a supervised command: exit code plus combined stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Side channels of a supervised command: an append-only log file that
/// receives output as it arrives, and a liveness callback.
#[derive(Clone, Copy, Default)]
pub struct CommandIo<'a> {
    pub log: Option<&'a Path>,
    pub heartbeat: Option<&'a (dyn Fn() + Send + Sync)>,
}

impl<'a> CommandIo<'a> {
    pub fn new(log: &'a Path, heartbeat: Option<&'a (dyn Fn() + Send + Sync)>) -> Self {
        Self {
            log: Some(log),
            heartbeat,
        }
    }

    pub fn beat(&self) {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat();
        }
    }
}
