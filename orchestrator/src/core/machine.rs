//! Task state machine transitions.
//!
//! Every status change goes through [`apply`]. The store calls it under its
//! lock, so this is the one place where transition legality is decided:
//!
//! ```text
//! PLANNING -> PLAN_APPROVED -> EXECUTING -> TESTING -> REVIEW -> DONE
//!     ^            |               |           |         |
//!     +------------+---------------+-----------+---------+   (feedback)
//! any non-terminal -> ERROR                                  (fail)
//! ```

use std::fmt;

use crate::core::types::{Plan, Task, TaskStatus};

/// Closed set of lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Attach a new plan while planning.
    AttachPlan(Plan),
    ApprovePlan { feedback: Option<String> },
    StartExecution,
    FinishExecution,
    BeginReview,
    ApprovePatch,
    /// Reopen planning with reviewer feedback.
    Feedback(String),
    Fail { reason: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::AttachPlan(_) => "attach_plan",
            Transition::ApprovePlan { .. } => "approve_plan",
            Transition::StartExecution => "start_execution",
            Transition::FinishExecution => "finish_execution",
            Transition::BeginReview => "begin_review",
            Transition::ApprovePatch => "approve_patch",
            Transition::Feedback(_) => "feedback",
            Transition::Fail { .. } => "fail",
        }
    }
}

/// A transition the current task state does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub transition: &'static str,
    pub reason: String,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} task '{}' in status {}: {}",
            self.transition, self.task_id, self.from, self.reason
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// Compute the task that results from applying `transition` to `task`.
///
/// `updated_at` is left untouched; the store bumps it when committing.
pub fn apply(task: &Task, transition: Transition) -> Result<Task, IllegalTransition> {
    check(task, &transition)?;

    let mut next = task.clone();
    match transition {
        Transition::AttachPlan(plan) => {
            next.plan = Some(plan);
        }
        Transition::ApprovePlan { feedback } => {
            next.status = TaskStatus::PlanApproved;
            if feedback.is_some() {
                next.feedback = feedback;
            }
        }
        Transition::StartExecution => {
            next.status = TaskStatus::Executing;
            // Each cycle must produce its own test result before review.
            next.test_result = None;
        }
        Transition::FinishExecution => next.status = TaskStatus::Testing,
        Transition::BeginReview => next.status = TaskStatus::Review,
        Transition::ApprovePatch => next.status = TaskStatus::Done,
        Transition::Feedback(text) => {
            next.status = TaskStatus::Planning;
            next.feedback = Some(text);
            next.plan = None;
            next.test_result = None;
        }
        Transition::Fail { reason } => {
            next.status = TaskStatus::Error;
            next.failure = Some(reason);
        }
    }
    Ok(next)
}

/// Check whether `transition` is legal for `task` without producing a new value.
pub fn check(task: &Task, transition: &Transition) -> Result<(), IllegalTransition> {
    let reject = |reason: String| IllegalTransition {
        task_id: task.id.clone(),
        from: task.status,
        transition: transition.name(),
        reason,
    };

    if task.status.is_terminal() {
        return Err(reject("task is in a terminal state".to_string()));
    }

    match transition {
        Transition::AttachPlan(plan) => {
            expect_status(task.status, TaskStatus::Planning).map_err(reject)?;
            if plan.task_id != task.id {
                return Err(reject(format!(
                    "plan belongs to task '{}'",
                    plan.task_id
                )));
            }
        }
        Transition::ApprovePlan { .. } => {
            expect_status(task.status, TaskStatus::Planning).map_err(reject)?;
            if task.plan.is_none() {
                return Err(reject("no plan attached".to_string()));
            }
        }
        Transition::StartExecution => {
            expect_status(task.status, TaskStatus::PlanApproved).map_err(reject)?;
        }
        Transition::FinishExecution => {
            expect_status(task.status, TaskStatus::Executing).map_err(reject)?;
        }
        Transition::BeginReview => {
            expect_status(task.status, TaskStatus::Testing).map_err(reject)?;
            if task.test_result.is_none() {
                return Err(reject("no test result recorded".to_string()));
            }
        }
        Transition::ApprovePatch => {
            expect_status(task.status, TaskStatus::Review).map_err(reject)?;
            match task.latest_review() {
                None => return Err(reject("no review submitted".to_string())),
                Some(review) if !review.valid => {
                    return Err(reject(format!(
                        "latest review has {} violation(s)",
                        review.violations.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Transition::Feedback(text) => {
            if task.status == TaskStatus::Planning {
                return Err(reject("task is already planning".to_string()));
            }
            if text.trim().is_empty() {
                return Err(reject("feedback must not be empty".to_string()));
            }
        }
        // Any non-terminal state may fail.
        Transition::Fail { .. } => {}
    }
    Ok(())
}

fn expect_status(actual: TaskStatus, expected: TaskStatus) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("requires status {expected}"))
    }
}
