use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use sandbox::{CommandIo, CommandOutput, SandboxError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::log::open_append;
use crate::process::{EXIT_CODE_TIMEOUT, exit_code, kill_process_group};

/// Interval between liveness callbacks while a supervised command runs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Deadline for short query and cleanup commands.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 8192;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl From<CommandError> for SandboxError {
    fn from(e: CommandError) -> Self {
        SandboxError::Internal(e.to_string())
    }
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Format a human-readable display string for a direct command invocation.
pub(crate) fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

fn command_for(program: &str, args: &[&str], privilege: Privilege) -> Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        }
        Privilege::User => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

/// Execute a short query command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = command_for(program, args, privilege)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// [`exec`] bounded by `timeout`. The child is killed when the deadline passes.
pub async fn exec_within(
    program: &str,
    args: &[&str],
    privilege: Privilege,
    timeout: Duration,
) -> sandbox::Result<String> {
    match tokio::time::timeout(timeout, exec(program, args, privilege)).await {
        Ok(out) => Ok(out?),
        Err(_) => Err(SandboxError::Timeout {
            command: format_command_display(program, args, privilege),
            seconds: timeout.as_secs(),
        }),
    }
}

/// Execute a command, ignoring any errors. Gives up after `timeout`.
pub async fn exec_ignore_errors(
    program: &str,
    args: &[&str],
    privilege: Privilege,
    timeout: Duration,
) {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec_ignore_errors");

    let output = tokio::time::timeout(
        timeout,
        command_for(program, args, privilege)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(o)) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Ok(Err(e)) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        Err(_) => {
            warn!(command = %cmd_display, seconds = timeout.as_secs(), "command timed out (ignored)");
        }
        Ok(Ok(_)) => {}
    }
}

// ---------------------------------------------------------------------------
// Supervised execution
// ---------------------------------------------------------------------------

/// Options for [`run`].
pub struct RunOptions<'a> {
    pub timeout: Duration,
    pub current_dir: Option<&'a Path>,
    pub envs: &'a [(&'a str, &'a str)],
    pub io: CommandIo<'a>,
}

impl<'a> RunOptions<'a> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            current_dir: None,
            envs: &[],
            io: CommandIo::default(),
        }
    }

    pub fn current_dir(mut self, dir: &'a Path) -> Self {
        self.current_dir = Some(dir);
        self
    }

    pub fn envs(mut self, envs: &'a [(&'a str, &'a str)]) -> Self {
        self.envs = envs;
        self
    }

    pub fn io(mut self, io: CommandIo<'a>) -> Self {
        self.io = io;
        self
    }
}

/// Run a long command under a deadline.
///
/// Stdout and stderr are merged and captured in arrival order. When a log
/// file is given every chunk is appended and flushed as soon as it is read.
/// The heartbeat fires every [`HEARTBEAT_INTERVAL`] while the command runs.
///
/// At the deadline the whole process group is killed, the marker
/// `[TIMEOUT after Ns]` is appended to output and log, and the result carries
/// exit code [`EXIT_CODE_TIMEOUT`] with `timed_out` set. A non-zero exit is
/// returned as a normal [`CommandOutput`]; only spawn and wait failures are
/// errors.
pub async fn run(
    program: &str,
    args: &[&str],
    options: &RunOptions<'_>,
) -> Result<CommandOutput, CommandError> {
    let cmd_display = format_command_display(program, args, Privilege::User);
    debug!(command = %cmd_display, timeout_secs = options.timeout.as_secs(), "run");
    let fail = |detail: String| CommandError {
        command: cmd_display.clone(),
        detail,
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(options.envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = options.current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| fail(e.to_string()))?;

    let mut log = match options.io.log {
        Some(path) => match open_append(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open log, output not streamed");
                None
            }
        },
        None => None,
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);
    let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
    let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);

    let mut output = Vec::new();
    let mut streams_open = true;
    let mut status = None;

    loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some(bytes) => {
                    if let Some(file) = log.as_mut()
                        && let Err(e) = write_flush(file, &bytes).await
                    {
                        warn!(error = %e, "log write failed, output no longer streamed");
                        log = None;
                    }
                    output.extend_from_slice(&bytes);
                }
                None => streams_open = false,
            },
            waited = child.wait(), if status.is_none() => {
                status = Some(waited.map_err(|e| fail(e.to_string()))?);
            }
            _ = heartbeat.tick() => options.io.beat(),
            () = &mut deadline => {
                kill_process_group(&child);
                let _ = child.wait().await;
                let marker = format!("\n[TIMEOUT after {}s]\n", options.timeout.as_secs());
                if let Some(file) = log.as_mut() {
                    let _ = write_flush(file, marker.as_bytes()).await;
                }
                output.extend_from_slice(marker.as_bytes());
                warn!(command = %cmd_display, timeout_secs = options.timeout.as_secs(), "command timed out");
                return Ok(CommandOutput {
                    exit_code: EXIT_CODE_TIMEOUT,
                    output: String::from_utf8_lossy(&output).into_owned(),
                    timed_out: true,
                });
            }
        }

        if let Some(status) = status
            && !streams_open
        {
            let code = exit_code(status);
            trace!(command = %cmd_display, exit_code = code, "run finished");
            return Ok(CommandOutput {
                exit_code: code,
                output: String::from_utf8_lossy(&output).into_owned(),
                timed_out: false,
            });
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let Some(chunk) = buf.get(..n) else { break };
                if tx.send(chunk.to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_flush(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}
