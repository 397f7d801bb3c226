//! Input sanitization for commands and workspace paths.
//!
//! Commands are never handed to a shell. A sanitized command is split on
//! whitespace into an executable and its argument vector, so shell
//! metacharacters have no meaning even if the allow-list were widened.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

pub const MAX_COMMAND_LEN: usize = 256;
pub const MAX_PATH_LEN: usize = 512;
pub const DEFAULT_STORAGE_LIMIT: usize = 20_000;

const COMMAND_PUNCTUATION: &str = "-._/:@=,(){}[]+ ";
const PATH_PUNCTUATION: &str = "-._/:@ ";

/// A command that passed validation, ready to spawn without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedCommand {
    pub executable: String,
    pub args: Vec<String>,
    /// Normalized form: tokens joined by single spaces.
    pub command: String,
}

/// Validate `input` against the command allow-list and tokenize it.
///
/// Returns a stable error message naming the violated rule.
pub fn sanitize_command(input: &str) -> Result<SanitizedCommand, String> {
    let trimmed = input.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_COMMAND_LEN {
        return Err(format!(
            "command must be between 1 and {MAX_COMMAND_LEN} characters"
        ));
    }
    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err("command must be a single line".to_string());
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || COMMAND_PUNCTUATION.contains(*ch)))
    {
        return Err(format!("command contains unsupported character {bad:?}"));
    }

    let mut tokens = trimmed.split_whitespace().map(str::to_string);
    let executable = tokens
        .next()
        .ok_or_else(|| "command is empty after sanitization".to_string())?;
    let args: Vec<String> = tokens.collect();
    let command = std::iter::once(executable.as_str())
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    Ok(SanitizedCommand {
        executable,
        args,
        command,
    })
}

/// Resolve `input` under `base`, rejecting anything that would escape it.
///
/// Resolution is lexical: `..` components are folded without touching the
/// filesystem, so the result is safe to create even if it does not exist yet.
pub fn sanitize_workspace_path(input: &str, base: &Path) -> Result<PathBuf, String> {
    let trimmed = input.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_PATH_LEN {
        return Err(format!(
            "file path must be between 1 and {MAX_PATH_LEN} characters"
        ));
    }
    if trimmed.contains('\0') {
        return Err("file path contains null bytes".to_string());
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || PATH_PUNCTUATION.contains(*ch)))
    {
        return Err(format!("file path contains unsupported character {bad:?}"));
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Err("file path must be relative to the workspace".to_string());
    }

    let mut resolved = base.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err("resolved path escapes the workspace directory".to_string());
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err("file path must be relative to the workspace".to_string());
            }
        }
    }
    if depth == 0 {
        return Err("file path must name an entry inside the workspace".to_string());
    }
    Ok(resolved)
}

/// Truncate `value` to at most `limit` characters, noting how much was dropped.
pub fn truncate_for_storage(value: &str, limit: usize) -> String {
    let total = value.chars().count();
    if total <= limit {
        return value.to_string();
    }
    let cut = value
        .char_indices()
        .nth(limit)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    format!(
        "{}\n...<truncated {} characters>",
        &value[..cut],
        total - limit
    )
}
