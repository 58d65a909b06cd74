use std::time::{Duration, Instant};

use clap::Args;
use runner::config::RunnerConfig;
use runner::paths::BuildPaths;
use runner::{RunnerResult, SandboxOrchestrator};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::preflight;

#[derive(Args)]
pub struct DaemonArgs {
    /// Seconds between scheduled-teardown checks
    #[arg(long, default_value_t = 15)]
    tick_seconds: u64,
    /// Seconds between full sweeps of the build root
    #[arg(long, default_value_t = 600)]
    sweep_seconds: u64,
}

/// Fire due teardowns on every tick and sweep expired sandboxes less often,
/// until SIGINT or SIGTERM.
pub async fn run_daemon(config: &RunnerConfig, args: DaemonArgs) -> RunnerResult<()> {
    preflight(config).await;
    let orchestrator = SandboxOrchestrator::from_config(config)?;
    let paths = BuildPaths::new(&config.build_root);
    info!(lock = %paths.daemon_lock().display(), "acquiring daemon lock");
    let _guard = runner::lock::acquire(paths.daemon_lock()).await?;

    let sweep_every = Duration::from_secs(args.sweep_seconds);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.tick_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut last_sweep: Option<Instant> = None;

    info!(root = %config.build_root.display(), "daemon started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, stopping");
                break;
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, stopping");
                break;
            }
        }

        if last_sweep.is_none_or(|at| at.elapsed() >= sweep_every) {
            match orchestrator.sweep_expired(config.ttl_minutes).await {
                Ok(report) => info!(?report, "sweep finished"),
                Err(e) => warn!(error = %e, "sweep failed"),
            }
            last_sweep = Some(Instant::now());
        } else {
            let fired = orchestrator.fire_due().await;
            if fired > 0 {
                info!(fired, "scheduled teardowns fired");
            }
        }
    }
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
