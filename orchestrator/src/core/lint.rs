//! Rule-based linting of review diffs.
//!
//! Only added lines (`+`, excluding the `+++` file header) are checked. A
//! non-empty violation list blocks patch approval; the review attempt is
//! recorded either way.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

pub const MSG_EMPTY_DIFF: &str = "Diff content cannot be empty.";
pub const MSG_TODO_MARKER: &str = "Added lines must not contain TODO or FIXME markers.";
pub const MSG_CONSOLE_LOG: &str = "Debug logging (console.log) is not allowed in new code.";
pub const MSG_DBG_MACRO: &str = "Debug macros (dbg!) are not allowed in new code.";

static CONSOLE_LOG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"console\.log\s*\(").unwrap());
static DBG_MACRO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bdbg!\s*\(").unwrap());
static SNAKE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());

/// Verdict for one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintVerdict {
    pub valid: bool,
    pub violations: Vec<String>,
}

impl LintVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }
}

/// Collaborator that judges review diffs.
pub trait DiffLinter: Send + Sync {
    fn lint(&self, diff: &str) -> LintVerdict;
}

/// Built-in rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleLinter;

impl DiffLinter for RuleLinter {
    fn lint(&self, diff: &str) -> LintVerdict {
        lint_diff(diff)
    }
}

/// Apply the built-in rules to `diff`.
///
/// Each distinct violation message is reported once, in first-seen order.
pub fn lint_diff(diff: &str) -> LintVerdict {
    if diff.trim().is_empty() {
        return LintVerdict::from_violations(vec![MSG_EMPTY_DIFF.to_string()]);
    }

    let lines: Vec<&str> = diff.lines().collect();
    let added: Vec<&str> = lines
        .iter()
        .filter(|line| !line.starts_with("+++"))
        .filter_map(|line| line.strip_prefix('+'))
        .collect();
    let touches_yaml = lines
        .iter()
        .filter_map(|line| line.strip_prefix("+++ b/"))
        .any(|path| is_yaml_path(path.trim()));

    let mut violations = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |message: String| {
        if seen.insert(message.clone()) {
            violations.push(message);
        }
    };

    for value in &added {
        let upper = value.to_uppercase();
        if upper.contains("TODO") || upper.contains("FIXME") {
            push(MSG_TODO_MARKER.to_string());
        }
        if CONSOLE_LOG_RE.is_match(value) {
            push(MSG_CONSOLE_LOG.to_string());
        }
        if DBG_MACRO_RE.is_match(value) {
            push(MSG_DBG_MACRO.to_string());
        }
    }

    if touches_yaml {
        for value in &added {
            let trimmed = value.trim();
            if let Some((key, _)) = trimmed.split_once(':') {
                let key = key.trim_start_matches("- ").trim();
                if !SNAKE_KEY_RE.is_match(key) {
                    push(format!("YAML key \"{key}\" must be snake_case alphanumeric."));
                }
            }
        }
    }

    LintVerdict::from_violations(violations)
}

fn is_yaml_path(path: &str) -> bool {
    path.ends_with(".yml") || path.ends_with(".yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_diff_is_valid() {
        let verdict = lint_diff("diff --git a/file.ts b/file.ts\n+++ b/file.ts\n+const value = 1;");
        assert!(verdict.valid);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn todo_markers_are_reported_once() {
        let verdict = lint_diff("+++ b/a.rs\n+// TODO: fix\n+// fixme later\n");
        assert!(!verdict.valid);
        assert_eq!(verdict.violations, vec![MSG_TODO_MARKER.to_string()]);
    }

    #[test]
    fn removed_and_context_lines_are_ignored() {
        let verdict = lint_diff("--- a/a.js\n+++ b/a.js\n-console.log(1)\n // TODO old\n+ok();\n");
        assert!(verdict.valid);
    }

    #[test]
    fn debug_logging_is_rejected() {
        let verdict = lint_diff("+++ b/a.js\n+console.log (x);\n+let y = dbg!(x);\n");
        assert_eq!(
            verdict.violations,
            vec![MSG_CONSOLE_LOG.to_string(), MSG_DBG_MACRO.to_string()]
        );
    }

    #[test]
    fn yaml_keys_must_be_snake_case() {
        let verdict = lint_diff("+++ b/config/app.yaml\n+good_key: 1\n+badKey: 2\n");
        assert_eq!(
            verdict.violations,
            vec!["YAML key \"badKey\" must be snake_case alphanumeric.".to_string()]
        );
    }

    #[test]
    fn yaml_rule_skips_other_files() {
        let verdict = lint_diff("+++ b/src/main.rs\n+let camelCase: u8 = 1;\n");
        assert!(verdict.valid);
    }

    #[test]
    fn empty_diff_is_invalid() {
        let verdict = RuleLinter.lint("  \n");
        assert_eq!(verdict.violations, vec![MSG_EMPTY_DIFF.to_string()]);
    }
}
