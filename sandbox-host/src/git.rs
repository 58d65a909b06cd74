use async_trait::async_trait;
use sandbox::{CloneRequest, CommandOutput, RepoCloner, Result};

use crate::command::{RunOptions, run};

/// Never prompt for credentials; private repositories fail fast instead of hanging.
const CLONE_ENV: [(&str, &str); 1] = [("GIT_TERMINAL_PROMPT", "0")];

/// Shallow, single-branch clones through the `git` binary.
#[derive(Debug, Default, Clone)]
pub struct GitCloner;

impl GitCloner {
    fn clone_args<'a>(request: &'a CloneRequest<'_>, dest: &'a str) -> Vec<&'a str> {
        let mut args = vec!["clone", "--depth", "1", "--single-branch"];
        if let Some(reference) = request.reference {
            args.extend(["--branch", reference]);
        }
        args.extend(["--", request.url, dest]);
        args
    }
}

#[async_trait]
impl RepoCloner for GitCloner {
    async fn clone_repo(&self, request: &CloneRequest<'_>) -> Result<CommandOutput> {
        let dest = request.dest.to_string_lossy();
        let args = Self::clone_args(request, &dest);
        let options = RunOptions::new(request.timeout).envs(&CLONE_ENV);
        Ok(run("git", &args, &options).await?)
    }
}
