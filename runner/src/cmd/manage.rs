use std::process::ExitCode;

use clap::Args;
use runner::config::RunnerConfig;
use runner::logtail::Tail;
use runner::{RunnerResult, SandboxOrchestrator};
use serde_json::json;

use super::print_json;

#[derive(Args)]
pub struct StopArgs {
    sandbox_id: String,
}

#[derive(Args)]
pub struct TailArgs {
    sandbox_id: String,
    /// Byte offset returned by the previous call
    #[arg(long, default_value_t = 0)]
    offset: u64,
}

#[derive(Args)]
pub struct StatsArgs {
    /// Container name or id
    container: String,
}

pub async fn run_stop(config: &RunnerConfig, args: StopArgs) -> RunnerResult<ExitCode> {
    let orchestrator = SandboxOrchestrator::from_config(config)?;
    let stopped = orchestrator.stop(&args.sandbox_id).await?;
    print_json(&json!({ "ok": true, "stopped": stopped }));
    Ok(ExitCode::SUCCESS)
}

pub async fn run_sweep(config: &RunnerConfig) -> RunnerResult<ExitCode> {
    let orchestrator = SandboxOrchestrator::from_config(config)?;
    let report = orchestrator.sweep_expired(config.ttl_minutes).await?;
    print_json(&json!({ "ok": true, "report": report }));
    Ok(ExitCode::SUCCESS)
}

pub async fn run_tail(config: &RunnerConfig, args: TailArgs) -> RunnerResult<ExitCode> {
    let orchestrator = SandboxOrchestrator::from_config(config)?;
    match orchestrator.tail(&args.sandbox_id, args.offset).await {
        Ok(Tail::NoNewContent) => print_json(&json!({ "ok": true, "status": "no_new_content" })),
        Ok(Tail::Chunk(chunk)) => print_json(&json!({ "ok": true, "chunk": chunk })),
        Err(e) => {
            print_json(&json!({ "ok": false, "error": e.user_message() }));
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_stats(config: &RunnerConfig, args: StatsArgs) -> RunnerResult<ExitCode> {
    let orchestrator = SandboxOrchestrator::from_config(config)?;
    let stats = orchestrator.container_stats(&args.container).await?;
    print_json(&json!({ "ok": true, "stats": stats }));
    Ok(ExitCode::SUCCESS)
}
