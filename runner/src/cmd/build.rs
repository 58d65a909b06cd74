use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use runner::config::RunnerConfig;
use runner::{
    BuildRequest, ProgressSink, RunnerError, RunnerResult, SandboxOrchestrator, SandboxStatus,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{preflight, print_json};

#[derive(Args)]
pub struct BuildArgs {
    /// HTTPS URL of the repository
    repo: String,
    /// Branch, tag or commit to check out
    #[arg(long = "ref")]
    reference: Option<String>,
    /// File whose content becomes the sandbox `.env`
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Session the sandbox counts against
    #[arg(long, default_value = "cli")]
    session: String,
    /// Client address used for rate limiting
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,
}

struct LogProgress;

impl ProgressSink for LogProgress {
    fn stage(&self, status: SandboxStatus, message: &str) {
        info!(%status, "{message}");
    }

    fn heartbeat(&self) {
        debug!("still working");
    }
}

pub async fn run_build(config: &RunnerConfig, args: BuildArgs) -> RunnerResult<ExitCode> {
    preflight(config).await;
    let env = match &args.env_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|e| {
            RunnerError::Config(format!("read env file {}: {e}", path.display()))
        })?),
        None => None,
    };

    let orchestrator = SandboxOrchestrator::from_config(config)?;
    match orchestrator.sweep_expired(config.ttl_minutes).await {
        Ok(report) => debug!(?report, "pre-build sweep"),
        Err(e) => warn!(error = %e, "pre-build sweep failed"),
    }

    let request = BuildRequest {
        repo_url: args.repo,
        reference: args.reference,
        env,
        session_id: args.session,
        client_ip: args.ip,
    };
    match orchestrator.create_and_run(&request, Some(&LogProgress)).await {
        Ok(result) => {
            let mut out = json!({ "ok": true });
            if let (Some(obj), Ok(serde_json::Value::Object(fields))) =
                (out.as_object_mut(), serde_json::to_value(&result))
            {
                obj.extend(fields);
            }
            print_json(&out);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "build failed");
            print_json(&json!({ "ok": false, "error": e.user_message() }));
            Ok(ExitCode::FAILURE)
        }
    }
}
