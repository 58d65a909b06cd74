/// Message shown to callers for failures that carry internal detail.
pub const GENERIC_FAILURE_MESSAGE: &str = "An unexpected error occurred. Please try again.";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed repository URL, git ref, environment content or sandbox id.
    #[error("{0}")]
    InvalidInput(String),

    /// Rate, concurrency or per-session limit hit.
    #[error("{0}")]
    QuotaExceeded(String),

    /// Clone failed, or the cloned tree was rejected.
    #[error("{0}")]
    CloneFailure(String),

    /// Image build or stack start failed, or the build descriptor was rejected.
    #[error("{0}")]
    BuildFailure(String),

    /// A command exceeded its deadline.
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Containers failed to start or no build descriptor exists.
    #[error("{0}")]
    RuntimeFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Message safe to hand back to the requester.
    ///
    /// Classified failures carry a message written for users. Anything else is
    /// collapsed into a generic message so host paths and command output never
    /// leak.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(msg)
            | Self::QuotaExceeded(msg)
            | Self::CloneFailure(msg)
            | Self::BuildFailure(msg)
            | Self::RuntimeFailure(msg) => msg.clone(),
            Self::Timeout { seconds, .. } => {
                format!("Build timed out after {seconds}s. Check logs for details.")
            }
            Self::NotFound(what) => format!("{what} not found"),
            Self::Internal(_) | Self::Io(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Whether the failure came from the build stage (timeouts count as build failures).
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::BuildFailure(_) | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_errors_keep_their_message() {
        let err = SandboxError::QuotaExceeded("Server busy: max 5 concurrent builds".into());
        assert_eq!(err.user_message(), "Server busy: max 5 concurrent builds");
    }

    #[test]
    fn internal_errors_are_generic() {
        let err = SandboxError::Internal("failed to write /srv/builds/abc/meta.json".into());
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);

        let err = SandboxError::Io(std::io::Error::other("disk full"));
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
    }

    #[test]
    fn timeout_is_a_build_failure() {
        let err = SandboxError::Timeout {
            command: "docker build".into(),
            seconds: 600,
        };
        assert!(err.is_build_failure());
        assert!(err.user_message().contains("600s"));
        assert!(!err.user_message().contains("docker"));
    }
}
