mod build;
mod daemon;
mod manage;

use std::path::PathBuf;

use clap::Args;
use runner::config::{self, RunnerConfig};
use runner::{RunnerError, RunnerResult};
use sandbox_host::check_prerequisites;
use tracing::warn;

pub use build::{BuildArgs, run_build};
pub use daemon::{DaemonArgs, run_daemon};
pub use manage::{StatsArgs, StopArgs, TailArgs, run_stats, run_stop, run_sweep, run_tail};

const DOCKER: &str = "docker";

#[derive(Args)]
pub struct GlobalArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, global = true, env = "SANDBOX_RUNNER_CONFIG")]
    config: Option<PathBuf>,
    /// Directory holding sandboxes (overrides config)
    #[arg(long, global = true, env = "SANDBOX_BUILD_ROOT")]
    build_root: Option<PathBuf>,
}

/// Config file if given, otherwise defaults rooted at `--build-root`.
pub async fn load_config(args: &GlobalArgs) -> RunnerResult<RunnerConfig> {
    let mut config = match (&args.config, &args.build_root) {
        (Some(path), _) => config::load(path).await?,
        (None, Some(root)) => RunnerConfig::with_root(root),
        (None, None) => {
            return Err(RunnerError::Config(
                "either --config or --build-root is required".into(),
            ));
        }
    };
    if let Some(root) = &args.build_root {
        config.build_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Warn about missing host tools; commands still run and fail on their own.
async fn preflight(config: &RunnerConfig) {
    let firewall = config
        .firewall
        .enabled
        .then(|| config.firewall.privilege());
    if let Err(e) = check_prerequisites(DOCKER, firewall).await {
        warn!(error = %e, "host prerequisites missing");
    }
}

fn print_json(value: &serde_json::Value) {
    println!("{value}");
}
