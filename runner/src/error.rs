use sandbox::{GENERIC_FAILURE_MESSAGE, SandboxError};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Message safe to show the requester of a build.
    pub fn user_message(&self) -> String {
        match self {
            Self::Sandbox(e) => e.user_message(),
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// The sandbox-level classification, if any.
    pub fn as_sandbox(&self) -> Option<&SandboxError> {
        match self {
            Self::Sandbox(e) => Some(e),
            _ => None,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_errors_pass_their_message_through() {
        let err = RunnerError::from(SandboxError::InvalidInput("Invalid git ref format".into()));
        assert_eq!(err.user_message(), "Invalid git ref format");
        assert!(matches!(err.as_sandbox(), Some(SandboxError::InvalidInput(_))));
    }

    #[test]
    fn unclassified_errors_are_generic() {
        let err = RunnerError::Internal("flock /srv/builds/.ratelimit/x.lock: EIO".into());
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
        assert!(err.as_sandbox().is_none());
    }
}
