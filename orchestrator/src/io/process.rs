//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use command_group::CommandGroup;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes drained but not kept because the shared budget ran out.
    pub truncated: usize,
    pub timed_out: bool,
    /// From just before spawn until the process was reaped.
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr with a trailing notice when output was dropped.
    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` is a
/// single budget shared by stdout and stderr; bytes beyond it are discarded
/// while the pipes keep draining, so a chatty child never blocks on a full pipe.
/// The child leads its own process group. On timeout the whole group is
/// killed, so processes it forked cannot hold the pipes open past the
/// deadline, and whatever was written so far is returned.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.group_spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .inner()
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .inner()
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let budget = Arc::new(AtomicUsize::new(output_limit_bytes));
    let stdout_budget = Arc::clone(&budget);
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, &stdout_budget));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, &budget));

    let mut timed_out = false;
    let status = match child.inner().wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, killing process group"
            );
            timed_out = true;
            child.kill().context("kill process group")?;
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let truncated = stdout_truncated + stderr_truncated;

    if truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
        elapsed,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, budget: &AtomicUsize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = claim(budget, n);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

/// Take up to `wanted` bytes from the shared budget, returning how many were granted.
fn claim(budget: &AtomicUsize, wanted: usize) -> usize {
    match budget.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
        Some(left.saturating_sub(wanted))
    }) {
        Ok(left) | Err(left) => left.min(wanted),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf out; printf err >&2"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 1024).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"out");
        assert_eq!(output.stderr, b"err");
        assert_eq!(output.truncated, 0);
        assert!(!output.timed_out);
    }

    #[test]
    fn budget_is_shared_across_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 0123456789; printf abcdefghij >&2"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 12).expect("run");
        assert_eq!(output.stdout.len() + output.stderr.len(), 12);
        assert_eq!(output.truncated, 8);
        assert!(output.stderr_lossy().contains("[output truncated 8 bytes]"));
    }

    #[test]
    fn timeout_kills_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let timeout = Duration::from_millis(100);
        let output = run_command_with_timeout(cmd, timeout, 1024).expect("run");
        assert!(output.timed_out);
        assert!(output.elapsed >= timeout);
        assert!(output.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5 & sleep 5"]);
        let started = Instant::now();
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn claim_never_over_grants() {
        let budget = AtomicUsize::new(5);
        assert_eq!(claim(&budget, 3), 3);
        assert_eq!(claim(&budget, 3), 2);
        assert_eq!(claim(&budget, 3), 0);
    }
}
