//! Command-line entry point for the sandboxed task orchestrator.
//!
//! The task lifecycle itself is served by `orchestrator-server`; this binary
//! covers the pieces that are useful on their own: config bootstrap, command
//! sanitization and execution, diff linting and memory queries.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::core::lint::{DiffLinter, RuleLinter};
use orchestrator::core::sanitize::sanitize_command;
use orchestrator::exit_codes;
use orchestrator::io::command::run_test_command;
use orchestrator::io::config::{OrchestratorConfig, config_path, load_config, write_config};
use orchestrator::io::memory_log::{MemoryLog, MemoryQuery};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Sandboxed plan/execute/test/review task orchestrator"
)]
struct Cli {
    /// Project directory holding `.orchestrator/config.toml`.
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.orchestrator/config.toml` with default values.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Print how a command would be split into executable and arguments.
    Sanitize { command: String },
    /// Run a sanitized command with the configured timeout and environment.
    Exec {
        command: String,
        /// Working directory (defaults to the project directory).
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Override the configured timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Lint a unified diff read from a file, or stdin with `-`.
    Lint { input: String },
    /// Query the memory log.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    Query {
        /// Case-insensitive keyword matched against statements.
        #[arg(long = "q")]
        keyword: Option<String>,
        /// Comma-separated tags that must all be present.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

fn main() {
    orchestrator::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project_dir = cli.project_dir;
    match cli.command {
        Command::Init { force } => cmd_init(&project_dir, force),
        Command::Sanitize { command } => cmd_sanitize(&command),
        Command::Exec {
            command,
            cwd,
            timeout_ms,
        } => cmd_exec(&project_dir, &command, cwd, timeout_ms),
        Command::Lint { input } => cmd_lint(&input),
        Command::Memory {
            command: MemoryCommand::Query { keyword, tags },
        } => cmd_memory_query(&project_dir, MemoryQuery { keyword, tags }),
    }
}

fn cmd_init(project_dir: &Path, force: bool) -> Result<i32> {
    let path = config_path(project_dir);
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &OrchestratorConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_sanitize(raw: &str) -> Result<i32> {
    match sanitize_command(raw) {
        Ok(command) => {
            print_json(&command)?;
            Ok(exit_codes::OK)
        }
        Err(message) => {
            eprintln!("invalid command: {message}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_exec(
    project_dir: &Path,
    raw: &str,
    cwd: Option<PathBuf>,
    timeout_ms: Option<u64>,
) -> Result<i32> {
    let config = load_config(&config_path(project_dir))?;
    let mut opts = config.run_options();
    opts.cwd = Some(cwd.unwrap_or_else(|| project_dir.to_path_buf()));
    if let Some(ms) = timeout_ms {
        opts.timeout = Duration::from_millis(ms);
    }

    match run_test_command(raw, &opts) {
        Ok(run) => {
            print!("{}", run.stdout);
            eprint!("{}", run.stderr);
            Ok(exit_codes::OK)
        }
        Err(err) => {
            print!("{}", err.stdout());
            eprint!("{}", err.stderr());
            eprintln!("{err}");
            Ok(exit_codes::for_kind(err.kind()))
        }
    }
}

fn cmd_lint(input: &str) -> Result<i32> {
    let diff = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read diff from stdin")?;
        buf
    } else {
        fs::read_to_string(input).with_context(|| format!("read {input}"))?
    };
    let verdict = RuleLinter.lint(&diff);
    print_json(&verdict)?;
    Ok(if verdict.valid {
        exit_codes::OK
    } else {
        exit_codes::VIOLATIONS
    })
}

fn cmd_memory_query(project_dir: &Path, query: MemoryQuery) -> Result<i32> {
    let config = load_config(&config_path(project_dir))?.resolve_paths(project_dir);
    let Some(path) = config.memory_log_path else {
        eprintln!("memory log is disabled in config");
        return Ok(exit_codes::INVALID);
    };
    for item in MemoryLog::new(path).query(&query)? {
        println!(
            "{}",
            serde_json::to_string(&item).context("serialize memory item")?
        );
    }
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
