//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bounds applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    /// Wall-clock budget measured from spawn.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL when the group is terminated.
    pub kill_grace: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    /// Exit code, with death-by-signal reported shell style (128 + signal).
    pub fn exit_code(&self) -> Option<i32> {
        self.status
            .code()
            .or_else(|| self.status.signal().map(|sig| 128 + sig))
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }

    /// Stdout as text with the truncation marker appended when capped.
    pub fn stdout_text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&self.stdout_truncated_notice(label));
        text
    }

    /// Stderr as text with the truncation marker appended when capped.
    pub fn stderr_text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&self.stderr_truncated_notice(label));
        text
    }
}

fn truncated_notice(label: &str, stream: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} {stream} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child leads its own process group. On timeout or cancellation the whole
/// group receives SIGTERM, then SIGKILL once `kill_grace` has passed. After the
/// child exits the group is killed again so no descendant keeps the pipes open.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: &ProcessLimits,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pgid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Dropping the handle at the end closes the pipe so the child sees EOF.
            Some(thread::spawn(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let elapsed = started.elapsed();
        if elapsed >= limits.timeout {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            timed_out = true;
            break terminate_group(&mut child, pgid, limits.kill_grace)?;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, terminating process group");
            cancelled = true;
            break terminate_group(&mut child, pgid, limits.kill_grace)?;
        }
        let slice = (limits.timeout - elapsed).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
    };
    signal_group(pgid, Signal::SIGKILL);
    let duration = started.elapsed();

    if let Some(handle) = stdin_handle {
        match handle.join() {
            // The child may legitimately exit without reading its input.
            Ok(Err(e)) => debug!(err = %e, "child stdin not fully written"),
            Ok(Ok(())) => {}
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration,
    })
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL and reap.
fn terminate_group(child: &mut Child, pgid: u32, grace: Duration) -> Result<ExitStatus> {
    signal_group(pgid, Signal::SIGTERM);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?
    {
        return Ok(status);
    }
    warn!(grace_ms = grace.as_millis() as u64, "process group ignored SIGTERM, killing");
    signal_group(pgid, Signal::SIGKILL);
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after SIGKILL to group");
    }
    child.wait().context("wait command after kill")
}

/// Best-effort signal to every process in the group led by `pgid`.
fn signal_group(pgid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => {}
        // The group already exited.
        Err(Errno::ESRCH) => debug!(pgid, %signal, "process group already gone"),
        Err(e) => warn!(err = %e, pgid, %signal, "failed to signal process group"),
    }
}

/// Whether a process with this id exists. A process owned by another user
/// counts as alive.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
