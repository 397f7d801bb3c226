//! The command surface: each operation pairs a state machine transition with
//! the sandbox, executor or collaborator call it implies.
//!
//! Every dependency is injected at construction. One [`Orchestrator`] value
//! is shared (behind an `Arc`) by whatever owns the request lifecycle.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::core::lint::{DiffLinter, RuleLinter};
use crate::core::machine::{IllegalTransition, Transition};
use crate::core::sanitize::{sanitize_command, truncate_for_storage};
use crate::core::types::{
    ExecutionRecord, FileDiff, Plan, ReviewRecord, Task, TaskStatus, TestResult,
};
use crate::error::{Error, Result};
use crate::gate::ExecutionGate;
use crate::io::command::{CommandRun, run_sanitized};
use crate::io::config::{OrchestratorConfig, config_path, load_config};
use crate::io::memory_log::{MemoryLog, feedback_item, plan_key_points};
use crate::io::planner::{MockPlanner, PlanProvider};
use crate::io::random_hex_id;
use crate::io::workspace::WorkspaceSandbox;
use crate::store::TaskStore;

/// Per-call adjustments to the configured executor options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Merged over the configured environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A passing test run and the task it was recorded on.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub task: Task,
    pub run: CommandRun,
}

/// Everything a reviewer needs: the workspace diff and the last test outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewPacket {
    pub task: Task,
    pub diffs: Vec<FileDiff>,
    pub test_result: Option<TestResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub task: Task,
    pub valid: bool,
    pub violations: Vec<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: TaskStore,
    gate: ExecutionGate,
    sandbox: WorkspaceSandbox,
    linter: Box<dyn DiffLinter>,
    planner: Box<dyn PlanProvider>,
    memory: Option<MemoryLog>,
}

impl Orchestrator {
    /// Build from an already-resolved config with the built-in collaborators.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let gate = ExecutionGate::new(config.execution.concurrency_limit)?;
        let sandbox = WorkspaceSandbox::new(
            config.source_root.clone(),
            config.workspace_root.clone(),
            config.excluded_dirs.iter().cloned(),
        );
        let memory = config.memory_log_path.clone().map(MemoryLog::new);
        Ok(Self {
            config,
            store: TaskStore::new(),
            gate,
            sandbox,
            linter: Box::new(RuleLinter),
            planner: Box::new(MockPlanner::default()),
            memory,
        })
    }

    /// Load `.orchestrator/config.toml` (or `config_file`) and resolve its
    /// paths against `project_dir`.
    pub fn open(project_dir: &Path, config_file: Option<&Path>) -> anyhow::Result<Self> {
        let path = config_file.map_or_else(|| config_path(project_dir), Path::to_path_buf);
        let config = load_config(&path)?.resolve_paths(project_dir);
        Self::new(config).context("build orchestrator")
    }

    pub fn with_linter(mut self, linter: Box<dyn DiffLinter>) -> Self {
        self.linter = linter;
        self
    }

    pub fn with_planner(mut self, planner: Box<dyn PlanProvider>) -> Self {
        self.planner = planner;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    pub fn sandbox(&self) -> &WorkspaceSandbox {
        &self.sandbox
    }

    pub fn memory(&self) -> Option<&MemoryLog> {
        self.memory.as_ref()
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.store
            .get_task(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.store.list_tasks()
    }

    pub fn latest_review(&self, id: &str) -> Result<Option<ReviewRecord>> {
        self.store.latest_review(id)
    }

    /// Create a task, generating a 16-hex-character id when none is given.
    pub fn create_task(&self, id: Option<&str>) -> Result<Task> {
        match id {
            Some(id) => self.store.create_task(id),
            None => self.store.create_task(&random_hex_id()),
        }
    }

    /// Create a task and attach a plan for `requirement` from the plan provider.
    #[instrument(skip(self, requirement, context))]
    pub fn propose_plan(&self, requirement: &str, context: Option<&str>) -> Result<Task> {
        if requirement.trim().is_empty() {
            return Err(Error::validation("requirement", "must be non-empty"));
        }
        let task = self.create_task(None)?;
        match self.planner.plan(&task.id, requirement, context) {
            Ok(plan) => {
                let task = self.store.transition(&task.id, Transition::AttachPlan(plan))?;
                info!(task_id = %task.id, "plan proposed");
                Ok(task)
            }
            Err(err) => {
                let err = Error::PlanProvider {
                    task_id: task.id.clone(),
                    source: err,
                };
                self.fail_after(&task.id, &err);
                Err(err)
            }
        }
    }

    pub fn submit_plan(&self, id: &str, plan: Plan) -> Result<Task> {
        self.store.transition(id, Transition::AttachPlan(plan))
    }

    /// Approve the attached plan and build a fresh workspace for it.
    #[instrument(skip(self, feedback))]
    pub fn approve_plan(&self, id: &str, feedback: Option<String>) -> Result<Task> {
        let feedback = feedback.filter(|f| !f.trim().is_empty());
        let task = self
            .store
            .transition(id, Transition::ApprovePlan { feedback })?;

        if let Err(err) = self.sandbox.create(id) {
            self.fail_after(id, &err);
            return Err(err);
        }

        if let (Some(memory), Some(plan)) = (&self.memory, &task.plan)
            && let Err(err) = memory.upsert(plan_key_points(plan, &self.config.project))
        {
            warn!(task_id = id, err = %format!("{err:#}"), "failed to record plan key points");
        }
        info!(task_id = id, "plan approved");
        Ok(task)
    }

    /// Apply every plan step inside the workspace, in order.
    ///
    /// `contents` supplies file bodies keyed by step path; a missing entry
    /// means empty content. The first failing step moves the task to `ERROR`.
    #[instrument(skip(self, contents))]
    pub fn execute_plan(&self, id: &str, contents: &BTreeMap<String, String>) -> Result<Task> {
        let task = self.store.transition(id, Transition::StartExecution)?;
        let steps = task.plan.map(|plan| plan.steps).unwrap_or_default();

        for step in &steps {
            let content = contents.get(&step.file).map_or("", String::as_str);
            if let Err(err) = self.sandbox.apply_step(id, step, content) {
                self.fail_after(id, &err);
                return Err(err);
            }
        }

        let task = self.store.transition(id, Transition::FinishExecution)?;
        info!(task_id = id, steps = steps.len(), "plan executed");
        Ok(task)
    }

    /// Run a test command inside the task's workspace.
    ///
    /// Input is validated and the gate consulted before anything is spawned or
    /// recorded. Once a command runs, its outcome is recorded whether it
    /// passed or not, and the task stays in `TESTING`.
    #[instrument(skip(self, overrides))]
    pub fn run_test(&self, id: &str, command: &str, overrides: RunOverrides) -> Result<TestRun> {
        let command =
            sanitize_command(command).map_err(|message| Error::validation("command", message))?;
        let mut opts = self.config.run_options();
        if let Some(ms) = overrides.timeout_ms {
            opts.timeout = Duration::from_millis(ms);
        }
        opts.env.extend(overrides.env);
        opts.cwd = Some(self.sandbox.path(id));
        opts.validate()?;

        let task = self.get_task(id)?;
        if task.status != TaskStatus::Testing {
            return Err(Error::IllegalTransition(IllegalTransition {
                task_id: id.to_string(),
                from: task.status,
                transition: "run_test",
                reason: format!("requires status {}", TaskStatus::Testing),
            }));
        }

        let outcome = {
            let _permit = self.gate.try_acquire()?;
            run_sanitized(&command, &opts)
        };

        let record = match &outcome {
            Ok(run) => ExecutionRecord {
                command: run.command.clone(),
                success: true,
                stdout: run.stdout.clone(),
                stderr: run.stderr.clone(),
                exit_code: run.exit_code,
                duration_ms: run.duration.as_millis() as u64,
                completed_at: Utc::now(),
            },
            Err(err) => ExecutionRecord {
                command: command.command.clone(),
                success: false,
                stdout: err.stdout().to_string(),
                stderr: err.stderr().to_string(),
                exit_code: err.exit_code(),
                duration_ms: err.duration().as_millis() as u64,
                completed_at: Utc::now(),
            },
        };
        let task = self.store.record_execution(id, record)?;

        match outcome {
            Ok(run) => {
                info!(task_id = id, "test command passed");
                Ok(TestRun { task, run })
            }
            Err(err) => {
                warn!(task_id = id, err = %err, "test command failed");
                Err(err.into())
            }
        }
    }

    /// Move to `REVIEW` and collect the workspace diff.
    #[instrument(skip(self))]
    pub fn request_review(&self, id: &str) -> Result<ReviewPacket> {
        let task = self.store.transition(id, Transition::BeginReview)?;
        let diffs = match self.sandbox.generate_diff(id) {
            Ok(diffs) => diffs,
            Err(err) => {
                self.fail_after(id, &err);
                return Err(err);
            }
        };
        let test_result = task.test_result.clone();
        Ok(ReviewPacket {
            task,
            diffs,
            test_result,
        })
    }

    /// Lint `diff` and record the attempt. A rejected diff leaves the task in
    /// `REVIEW` with the violations on its history.
    #[instrument(skip(self, diff))]
    pub fn submit_review(&self, id: &str, diff: &str) -> Result<ReviewOutcome> {
        if diff.trim().is_empty() {
            return Err(Error::validation("diff", "must be non-empty"));
        }
        let task = self.get_task(id)?;
        if task.status != TaskStatus::Review {
            return Err(Error::IllegalTransition(IllegalTransition {
                task_id: id.to_string(),
                from: task.status,
                transition: "submit_review",
                reason: format!("requires status {}", TaskStatus::Review),
            }));
        }

        let verdict = self.linter.lint(diff);
        let record = ReviewRecord {
            diff: truncate_for_storage(diff, self.config.review.storage_limit_chars),
            valid: verdict.valid,
            violations: verdict.violations.clone(),
            checked_at: Utc::now(),
        };
        let task = self.store.record_review(id, record)?;
        info!(
            task_id = id,
            valid = verdict.valid,
            violations = verdict.violations.len(),
            "review recorded"
        );
        Ok(ReviewOutcome {
            task,
            valid: verdict.valid,
            violations: verdict.violations,
        })
    }

    /// Accept the reviewed patch: remove the workspace and finish the task.
    #[instrument(skip(self))]
    pub fn approve_patch(&self, id: &str) -> Result<Task> {
        self.store.check_transition(id, &Transition::ApprovePatch)?;
        if let Err(err) = self.sandbox.destroy(id) {
            self.fail_after(id, &err);
            return Err(err);
        }
        let task = self.store.transition(id, Transition::ApprovePatch)?;
        info!(task_id = id, "patch approved");
        Ok(task)
    }

    /// Reopen planning. The workspace stays until the next approval replaces it.
    #[instrument(skip(self, feedback))]
    pub fn submit_feedback(&self, id: &str, feedback: &str) -> Result<Task> {
        let task = self
            .store
            .transition(id, Transition::Feedback(feedback.trim().to_string()))?;
        if let Some(memory) = &self.memory
            && let Err(err) = memory.upsert(feedback_item(id, feedback, &self.config.project))
        {
            warn!(task_id = id, err = %format!("{err:#}"), "failed to record feedback");
        }
        info!(task_id = id, "feedback recorded, task back in planning");
        Ok(task)
    }

    pub fn fail_task(&self, id: &str, reason: &str) -> Result<Task> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::validation("reason", "must be non-empty"));
        }
        self.store.transition(
            id,
            Transition::Fail {
                reason: reason.to_string(),
            },
        )
    }

    /// Remove the workspace of an existing task without changing its status.
    pub fn teardown(&self, id: &str) -> Result<()> {
        self.get_task(id)?;
        self.sandbox.destroy(id)
    }

    /// Clear all tasks and gate slots.
    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        self.store.reset();
        self.gate.reset();
    }

    /// Move `id` to `ERROR` after `err`. The original error is what the
    /// caller sees, so a failed transition here is only logged.
    fn fail_after(&self, id: &str, err: &Error) {
        error!(task_id = id, err = %err, "step failed, marking task as errored");
        if let Err(fail_err) = self.store.transition(
            id,
            Transition::Fail {
                reason: err.to_string(),
            },
        ) {
            warn!(task_id = id, err = %fail_err, "could not mark task as errored");
        }
    }
}
