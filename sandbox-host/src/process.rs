use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Exit code reported for a command killed at its deadline (matches coreutils `timeout`).
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the child has already exited or the PID cannot
/// be represented as `i32`.
pub(crate) fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

/// Shell-style exit code: the status code, or `128 + signal` when killed by a signal.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_exit_maps_to_128_plus_signal() {
        let status = tokio::process::Command::new("bash")
            .args(["-c", "kill -9 $$"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 137);
    }

    #[tokio::test]
    async fn plain_exit_code_passes_through() {
        let status = tokio::process::Command::new("bash")
            .args(["-c", "exit 3"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 3);
    }

    #[tokio::test]
    async fn kill_process_group_takes_down_children() {
        let mut child = tokio::process::Command::new("bash")
            .args(["-c", "sleep 30 & sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        kill_process_group(&child);
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), 137);
    }
}
