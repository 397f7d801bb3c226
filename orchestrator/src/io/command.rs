//! Sanitized, shell-free test command execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::sanitize::{SanitizedCommand, sanitize_command};
use crate::error::ErrorKind;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Working directory; the current directory when `None`.
    pub cwd: Option<PathBuf>,
    /// Overrides merged over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Combined stdout + stderr bytes kept in memory.
    pub output_limit_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.timeout.is_zero() {
            return Err(CommandError::Validation {
                field: "timeout",
                message: "must be greater than 0".to_string(),
            });
        }
        if self.output_limit_bytes == 0 {
            return Err(CommandError::Validation {
                field: "output_limit_bytes",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A command that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRun {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("command '{command}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        command: String,
        timeout: Duration,
        duration: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("command '{command}' failed{}", exit_suffix(.exit_code))]
    Execution {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        duration: Duration,
    },
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " without an exit code".to_string(),
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Validation { .. } => ErrorKind::Validation,
            CommandError::Timeout { .. } => ErrorKind::Timeout,
            CommandError::Execution { .. } => ErrorKind::Execution,
        }
    }

    /// Exit code to record; `-1` when the process produced none.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Execution {
                exit_code: Some(code),
                ..
            } => *code,
            _ => -1,
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            CommandError::Validation { .. } => "",
            CommandError::Timeout { stdout, .. } | CommandError::Execution { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Validation { .. } => "",
            CommandError::Timeout { stderr, .. } | CommandError::Execution { stderr, .. } => stderr,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            CommandError::Validation { .. } => Duration::ZERO,
            CommandError::Timeout { duration, .. } | CommandError::Execution { duration, .. } => {
                *duration
            }
        }
    }
}

/// Sanitize `raw` and run it. Nothing is spawned if validation fails.
pub fn run_test_command(raw: &str, opts: &RunOptions) -> Result<CommandRun, CommandError> {
    let command = sanitize_command(raw).map_err(|message| CommandError::Validation {
        field: "command",
        message,
    })?;
    run_sanitized(&command, opts)
}

/// Spawn an already-sanitized command directly, without a shell.
#[instrument(skip_all, fields(command = %command.command))]
pub fn run_sanitized(command: &SanitizedCommand, opts: &RunOptions) -> Result<CommandRun, CommandError> {
    opts.validate()?;

    let mut cmd = Command::new(&command.executable);
    cmd.args(&command.args);
    cmd.envs(&opts.env);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    let started = Instant::now();
    let output = match run_command_with_timeout(cmd, opts.timeout, opts.output_limit_bytes) {
        Ok(output) => output,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "command could not be run");
            return Err(CommandError::Execution {
                command: command.command.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{err:#}"),
                duration: started.elapsed(),
            });
        }
    };

    let stdout = output.stdout_lossy();
    let stderr = output.stderr_lossy();

    if output.timed_out {
        return Err(CommandError::Timeout {
            command: command.command.clone(),
            timeout: opts.timeout,
            // The child is killed only after the deadline passed.
            duration: output.elapsed.max(opts.timeout),
            stdout,
            stderr,
        });
    }

    match output.status.code() {
        Some(0) => {
            info!(duration_ms = output.elapsed.as_millis() as u64, "command succeeded");
            Ok(CommandRun {
                command: command.command.clone(),
                stdout,
                stderr,
                exit_code: 0,
                duration: output.elapsed,
            })
        }
        code => {
            info!(exit_code = ?code, "command failed");
            Err(CommandError::Execution {
                command: command.command.clone(),
                exit_code: code,
                stdout,
                stderr,
                duration: output.elapsed,
            })
        }
    }
}
