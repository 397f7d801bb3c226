//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::sanitize::DEFAULT_STORAGE_LIMIT;
use crate::io::command::{DEFAULT_OUTPUT_LIMIT_BYTES, RunOptions};

/// Config location relative to the project directory.
pub const CONFIG_RELATIVE_PATH: &str = ".orchestrator/config.toml";

/// Orchestrator configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below;
/// relative paths resolve against the project directory that holds
/// `.orchestrator/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Project name recorded on memory log entries.
    pub project: String,

    /// Tree copied into each task workspace.
    pub source_root: PathBuf,

    /// Parent directory of all task workspaces.
    pub workspace_root: PathBuf,

    /// Directory names skipped at any depth when copying and diffing.
    pub excluded_dirs: Vec<String>,

    /// JSONL memory log. `None` disables the memory features.
    pub memory_log_path: Option<PathBuf>,

    pub execution: ExecutionConfig,

    pub review: ReviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of test commands running at once.
    pub concurrency_limit: usize,

    pub timeout_ms: u64,

    /// Combined stdout + stderr bytes kept per command.
    pub output_limit_bytes: usize,

    /// Environment overrides applied to every test command.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Stored review diffs are truncated beyond this many characters.
    pub storage_limit_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project: "ai-sandbox".to_string(),
            source_root: PathBuf::from("."),
            workspace_root: PathBuf::from(".work"),
            excluded_dirs: [".git", ".orchestrator", "node_modules", ".work", "target"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            memory_log_path: Some(PathBuf::from(".orchestrator/memory.jsonl")),
            execution: ExecutionConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            timeout_ms: 30_000,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            env: BTreeMap::from([("CI".to_string(), "true".to_string())]),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            storage_limit_chars: DEFAULT_STORAGE_LIMIT,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(anyhow!("project must be non-empty"));
        }
        if self.execution.concurrency_limit == 0 {
            return Err(anyhow!("execution.concurrency_limit must be > 0"));
        }
        if self.execution.timeout_ms == 0 {
            return Err(anyhow!("execution.timeout_ms must be > 0"));
        }
        if self.execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        if self.review.storage_limit_chars == 0 {
            return Err(anyhow!("review.storage_limit_chars must be > 0"));
        }
        if self
            .excluded_dirs
            .iter()
            .any(|name| name.is_empty() || name.contains('/'))
        {
            return Err(anyhow!("excluded_dirs entries must be bare directory names"));
        }
        Ok(())
    }

    /// Make every configured path absolute against `project_dir`.
    pub fn resolve_paths(mut self, project_dir: &Path) -> Self {
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                project_dir.join(path)
            }
        };
        self.source_root = resolve(self.source_root);
        self.workspace_root = resolve(self.workspace_root);
        self.memory_log_path = self.memory_log_path.map(resolve);
        self
    }

    /// Baseline executor options. Callers set `cwd` per task.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            cwd: None,
            env: self.execution.env.clone(),
            timeout: Duration::from_millis(self.execution.timeout_ms),
            output_limit_bytes: self.execution.output_limit_bytes,
        }
    }
}

pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_RELATIVE_PATH)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
