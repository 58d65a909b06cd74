mod cmd;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version, about = "Build and run untrusted repositories in hardened containers")]
struct Cli {
    #[command(flatten)]
    global: cmd::GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clone a repository, build it and start its containers
    Build(cmd::BuildArgs),
    /// Stop a sandbox and close its ports
    Stop(cmd::StopArgs),
    /// Fire due teardowns and remove expired sandbox directories
    Sweep,
    /// Print the next slice of a sandbox execution log
    Tail(cmd::TailArgs),
    /// Print resource usage of a container
    Stats(cmd::StatsArgs),
    /// Fire scheduled teardowns and sweep periodically until signalled
    Daemon(cmd::DaemonArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries JSON results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match cmd::load_config(&cli.global).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Build(args) => cmd::run_build(&config, args).await,
        Command::Stop(args) => cmd::run_stop(&config, args).await,
        Command::Sweep => cmd::run_sweep(&config).await,
        Command::Tail(args) => cmd::run_tail(&config, args).await,
        Command::Stats(args) => cmd::run_stats(&config, args).await,
        Command::Daemon(args) => cmd::run_daemon(&config, args)
            .await
            .map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
