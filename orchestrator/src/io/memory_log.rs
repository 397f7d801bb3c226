//! Append-only JSONL memory of plan key points and reviewer feedback.
//!
//! Every upsert appends a full line. When several lines share an id the last
//! one wins, so refreshing an item never rewrites history on disk.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::Plan;
use crate::io::random_hex_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub project: String,
    pub scope: String,
    pub statement: String,
    pub tags: Vec<String>,
    pub evidence: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_confirmed: DateTime<Utc>,
}

/// Upsert payload. Timestamps are assigned by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMemoryItem {
    #[serde(default)]
    pub id: Option<String>,
    pub project: String,
    pub scope: String,
    pub statement: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MemoryQuery {
    /// Case-insensitive substring of the statement.
    #[serde(default)]
    pub keyword: Option<String>,
    /// Every tag listed must be present.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MemoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `item`, or refresh the existing item with the same id.
    ///
    /// A refresh keeps `first_seen` and moves `last_confirmed` to now.
    pub fn upsert(&self, item: NewMemoryItem) -> Result<MemoryItem> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let id = item.id.unwrap_or_else(random_hex_id);
        let first_seen = self
            .read_latest()?
            .get(&id)
            .map_or(now, |existing| existing.first_seen);

        let stored = MemoryItem {
            id,
            project: item.project,
            scope: item.scope,
            statement: item.statement,
            tags: item.tags,
            evidence: item.evidence,
            first_seen,
            last_confirmed: now,
        };
        self.append(&stored)?;
        debug!(id = %stored.id, "memory item upserted");
        Ok(stored)
    }

    /// Current items matching `query`, in first-seen order.
    pub fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let keyword = query
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase);

        let mut items: Vec<MemoryItem> = self
            .read_latest()?
            .into_values()
            .filter(|item| {
                keyword
                    .as_ref()
                    .is_none_or(|k| item.statement.to_lowercase().contains(k))
            })
            .filter(|item| query.tags.iter().all(|tag| item.tags.contains(tag)))
            .collect();
        items.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    fn append(&self, item: &MemoryItem) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(item).context("serialize memory item")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(())
    }

    /// Last line per id. Unparseable lines are skipped with a warning.
    fn read_latest(&self) -> Result<HashMap<String, MemoryItem>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };

        let mut latest = HashMap::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryItem>(line) {
                Ok(item) => {
                    latest.insert(item.id.clone(), item);
                }
                Err(err) => {
                    warn!(line = idx + 1, err = %err, path = %self.path.display(), "skipping malformed memory line");
                }
            }
        }
        Ok(latest)
    }
}

/// Key points of an approved plan. The id is derived from the task so a
/// re-approved plan refreshes the same item.
pub fn plan_key_points(plan: &Plan, project: &str) -> NewMemoryItem {
    let mut modules = Vec::new();
    for step in &plan.steps {
        let top = step.file.split('/').next().unwrap_or_default().to_string();
        if !top.is_empty() && !modules.contains(&top) {
            modules.push(top);
        }
    }
    let scope = modules.join(", ");
    let statement = format!(
        "Objective: {}. Touches modules: {}.",
        plan.goals.join(", "),
        scope
    );

    let mut tags = vec!["plan".to_string(), "generated".to_string()];
    let actions: BTreeSet<&str> = plan.steps.iter().map(|s| s.action.label()).collect();
    tags.extend(actions.into_iter().map(str::to_string));

    NewMemoryItem {
        id: Some(format!("plan-{}", plan.task_id)),
        project: project.to_string(),
        scope,
        statement,
        tags,
        evidence: plan.evidence.clone(),
    }
}

pub fn feedback_item(task_id: &str, feedback: &str, project: &str) -> NewMemoryItem {
    NewMemoryItem {
        id: None,
        project: project.to_string(),
        scope: format!("task:{task_id}"),
        statement: format!("Feedback: {}", feedback.trim()),
        tags: vec!["feedback".to_string()],
        evidence: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PlanStep, StepAction};

    fn item(id: Option<&str>, statement: &str, tags: &[&str]) -> NewMemoryItem {
        NewMemoryItem {
            id: id.map(str::to_string),
            project: "demo".to_string(),
            scope: "src".to_string(),
            statement: statement.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn upsert_assigns_id_and_timestamps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MemoryLog::new(temp.path().join("nested/memory.jsonl"));
        let stored = log.upsert(item(None, "first", &["a"])).expect("upsert");
        assert_eq!(stored.id.len(), 16);
        assert_eq!(stored.first_seen, stored.last_confirmed);
        assert!(log.path().is_file());
    }

    #[test]
    fn refresh_keeps_first_seen_and_last_line_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MemoryLog::new(temp.path().join("memory.jsonl"));
        let first = log.upsert(item(Some("k"), "old", &[])).expect("insert");
        let second = log.upsert(item(Some("k"), "new", &[])).expect("refresh");
        assert_eq!(second.first_seen, first.first_seen);
        assert!(second.last_confirmed >= first.last_confirmed);

        let all = log.query(&MemoryQuery::default()).expect("query");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].statement, "new");

        let lines = fs::read_to_string(log.path()).expect("read");
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn query_filters_by_keyword_and_all_tags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MemoryLog::new(temp.path().join("memory.jsonl"));
        log.upsert(item(Some("1"), "Refactor the Parser", &["plan", "replace"]))
            .expect("upsert");
        log.upsert(item(Some("2"), "Add parser tests", &["plan"]))
            .expect("upsert");
        log.upsert(item(Some("3"), "Unrelated", &["feedback"]))
            .expect("upsert");

        let by_keyword = log
            .query(&MemoryQuery {
                keyword: Some("PARSER".to_string()),
                tags: Vec::new(),
            })
            .expect("query");
        assert_eq!(by_keyword.len(), 2);

        let by_tags = log
            .query(&MemoryQuery {
                keyword: None,
                tags: vec!["plan".to_string(), "replace".to_string()],
            })
            .expect("query");
        assert_eq!(by_tags.len(), 1);
        assert_eq!(by_tags[0].id, "1");
    }

    #[test]
    fn missing_file_queries_empty_and_bad_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MemoryLog::new(temp.path().join("memory.jsonl"));
        assert!(log.query(&MemoryQuery::default()).expect("query").is_empty());

        fs::write(log.path(), "not json\n").expect("write");
        log.upsert(item(Some("ok"), "kept", &[])).expect("upsert");
        let all = log.query(&MemoryQuery::default()).expect("query");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn plan_key_points_summarize_modules_and_actions() {
        let plan = Plan {
            task_id: "t1".to_string(),
            goals: vec!["Add login".to_string()],
            steps: vec![
                PlanStep {
                    file: "src/auth.rs".to_string(),
                    symbol: None,
                    action: StepAction::Replace,
                    test_impact: None,
                },
                PlanStep {
                    file: "src/login.rs".to_string(),
                    symbol: None,
                    action: StepAction::Create,
                    test_impact: None,
                },
                PlanStep {
                    file: "docs/login.md".to_string(),
                    symbol: None,
                    action: StepAction::Create,
                    test_impact: None,
                },
            ],
            risks: Vec::new(),
            evidence: vec!["src/auth.rs:10".to_string()],
        };
        let points = plan_key_points(&plan, "ai-sandbox");
        assert_eq!(points.id.as_deref(), Some("plan-t1"));
        assert_eq!(points.scope, "src, docs");
        assert_eq!(
            points.statement,
            "Objective: Add login. Touches modules: src, docs."
        );
        assert_eq!(points.tags, vec!["plan", "generated", "create", "replace"]);
        assert_eq!(points.evidence, plan.evidence);
    }
}
