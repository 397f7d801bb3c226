//! Shared domain types for the task lifecycle.
//!
//! These types define the contracts between the state machine, the sandbox,
//! the executor and the request layer. They carry no I/O and serialize to the
//! JSON shapes exposed by the server.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a task id. Ids double as workspace directory names.
pub const MAX_TASK_ID_LEN: usize = 64;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Planning,
    PlanApproved,
    Executing,
    Testing,
    Review,
    Done,
    Error,
}

impl TaskStatus {
    /// `DONE` and `ERROR` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Planning => "PLANNING",
            TaskStatus::PlanApproved => "PLAN_APPROVED",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Testing => "TESTING",
            TaskStatus::Review => "REVIEW",
            TaskStatus::Done => "DONE",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// File-level change a plan step asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Insert,
    Replace,
    Create,
    Delete,
}

impl StepAction {
    pub fn label(self) -> &'static str {
        match self {
            StepAction::Insert => "insert",
            StepAction::Replace => "replace",
            StepAction::Create => "create",
            StepAction::Delete => "delete",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Target path, relative to the project root.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_impact: Option<String>,
}

/// Proposed change set for one planning cycle.
///
/// A plan is never edited after it is attached to a task; the next cycle
/// attaches a fresh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub goals: Vec<String>,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub risks: Vec<String>,
    /// Opaque references (e.g. `path:line`) supplied by the search collaborator.
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Outcome of the most recent test command for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// One test/command run. Never edited after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub command: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process produced no exit code (spawn failure, signal, timeout).
    pub exit_code: i32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn test_result(&self) -> TestResult {
        TestResult {
            command: self.command.clone(),
            success: self.success,
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// One review submission. Never edited after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub diff: String,
    pub valid: bool,
    pub violations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Unified diff for one file of a task workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub diff: String,
}

/// A unit of work moving through plan → execute → test → review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub plan: Option<Plan>,
    pub feedback: Option<String>,
    pub test_result: Option<TestResult>,
    /// Reason recorded when the task moved to `ERROR`.
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub review_history: Vec<ReviewRecord>,
    pub execution_history: Vec<ExecutionRecord>,
}

impl Task {
    /// Fresh `PLANNING` task with empty histories.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Planning,
            plan: None,
            feedback: None,
            test_result: None,
            failure: None,
            created_at: now,
            updated_at: now,
            review_history: Vec::new(),
            execution_history: Vec::new(),
        }
    }

    pub fn latest_review(&self) -> Option<&ReviewRecord> {
        self.review_history.last()
    }
}

/// Partial, non-status update for a task. `Some` fields overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub feedback: Option<String>,
    pub test_result: Option<TestResult>,
}

/// Validate a task id: 1..=64 chars of `[A-Za-z0-9_-]`.
///
/// Returns a stable error message on failure.
pub fn validate_task_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_TASK_ID_LEN {
        return Err(format!(
            "task id must be between 1 and {MAX_TASK_ID_LEN} characters"
        ));
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
    {
        return Err("task id may only contain ASCII letters, digits, '-' and '_'".to_string());
    }
    Ok(())
}
