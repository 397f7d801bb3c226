//! In-memory task registry.
//!
//! One mutex guards the whole map, so every read-modify-write of a task is
//! atomic with respect to every other. No operation holds the lock across
//! I/O; callers receive cloned snapshots.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use crate::core::machine::{self, Transition};
use crate::core::types::{
    ExecutionRecord, ReviewRecord, Task, TaskPatch, TaskStatus, validate_task_id,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct TaskStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    /// Creation order, for stable listings.
    order: Vec<String>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written task:
        // every mutation replaces the whole value.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_task(&self, id: &str) -> Result<Task> {
        validate_task_id(id).map_err(|message| Error::validation("task_id", message))?;
        let mut inner = self.lock();
        if inner.tasks.contains_key(id) {
            return Err(Error::DuplicateTask { id: id.to_string() });
        }
        let task = Task::new(id, Utc::now());
        inner.tasks.insert(id.to_string(), task.clone());
        inner.order.push(id.to_string());
        info!(task_id = id, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    /// Tasks in creation order.
    pub fn list_tasks(&self) -> Vec<Task> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect()
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.mutate(id, |task| {
            if let Some(feedback) = patch.feedback {
                task.feedback = Some(feedback);
            }
            if let Some(result) = patch.test_result {
                task.test_result = Some(result);
            }
            Ok(())
        })
    }

    /// Apply a lifecycle transition and commit the result.
    pub fn transition(&self, id: &str, transition: Transition) -> Result<Task> {
        let name = transition.name();
        let task = self.mutate(id, |task| {
            *task = machine::apply(task, transition)?;
            Ok(())
        })?;
        debug!(task_id = id, transition = name, status = %task.status, "transition applied");
        Ok(task)
    }

    /// Validate a transition against the current state without committing it.
    pub fn check_transition(&self, id: &str, transition: &Transition) -> Result<()> {
        let inner = self.lock();
        let task = inner
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        machine::check(task, transition)?;
        Ok(())
    }

    /// Append an execution record. It becomes the task's latest test result
    /// only while the task is still `TESTING`; a run that finishes after the
    /// task moved on is kept as history alone.
    pub fn record_execution(&self, id: &str, record: ExecutionRecord) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status == TaskStatus::Testing {
                task.test_result = Some(record.test_result());
            } else {
                debug!(task_id = %task.id, status = %task.status, "late execution kept as history only");
            }
            task.execution_history.push(record);
            Ok(())
        })
    }

    pub fn record_review(&self, id: &str, record: ReviewRecord) -> Result<Task> {
        self.mutate(id, |task| {
            task.review_history.push(record);
            Ok(())
        })
    }

    pub fn latest_review(&self, id: &str) -> Result<Option<ReviewRecord>> {
        let inner = self.lock();
        let task = inner
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        Ok(task.latest_review().cloned())
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.order.clear();
    }

    /// Run `edit` on a working copy and commit it only if `edit` succeeds.
    fn mutate(&self, id: &str, edit: impl FnOnce(&mut Task) -> Result<()>) -> Result<Task> {
        let mut inner = self.lock();
        let current = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        let mut next = current.clone();
        edit(&mut next)?;
        next.updated_at = next_timestamp(current.updated_at);
        *current = next.clone();
        Ok(next)
    }
}

/// Wall-clock now, nudged forward if the clock has not advanced past `prev`.
fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + TimeDelta::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestResult;
    use crate::error::ErrorKind;
    use crate::test_support::sample_plan;
    use std::sync::Arc;
    use std::thread;

    fn execution(success: bool) -> ExecutionRecord {
        ExecutionRecord {
            command: "cargo test".to_string(),
            success,
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: if success { 0 } else { 1 },
            duration_ms: 5,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn created_task_starts_in_planning() {
        let store = TaskStore::new();
        store.create_task("t1").expect("create");
        let task = store.get_task("t1").expect("present");
        assert_eq!(task.status, TaskStatus::Planning);
        assert!(task.review_history.is_empty());
        assert!(task.execution_history.is_empty());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn duplicate_create_leaves_original_untouched() {
        let store = TaskStore::new();
        store.create_task("t1").expect("create");
        store
            .update_task(
                "t1",
                TaskPatch {
                    feedback: Some("keep".to_string()),
                    ..TaskPatch::default()
                },
            )
            .expect("update");
        let before = store.get_task("t1").expect("present");

        let err = store.create_task("t1").expect_err("duplicate");
        assert!(matches!(err, Error::DuplicateTask { .. }));
        assert_eq!(store.get_task("t1").expect("present"), before);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let store = TaskStore::new();
        let err = store.create_task("../x").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn missing_task_reports_not_found() {
        let store = TaskStore::new();
        assert!(store.get_task("nope").is_none());
        let err = store
            .update_task("nope", TaskPatch::default())
            .expect_err("missing");
        assert!(matches!(err, Error::TaskNotFound { .. }));
        assert!(store.record_execution("nope", execution(true)).is_err());
        assert!(store.latest_review("nope").is_err());
    }

    #[test]
    fn updated_at_strictly_increases() {
        let store = TaskStore::new();
        let mut last = store.create_task("t1").expect("create").updated_at;
        for _ in 0..50 {
            let task = store
                .update_task("t1", TaskPatch::default())
                .expect("update");
            assert!(task.updated_at > last);
            last = task.updated_at;
        }
    }

    #[test]
    fn illegal_transition_does_not_commit() {
        let store = TaskStore::new();
        let created = store.create_task("t1").expect("create");
        let err = store
            .transition("t1", Transition::StartExecution)
            .expect_err("illegal");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.get_task("t1").expect("present"), created);
    }

    fn testing_task(store: &TaskStore, id: &str) {
        store.create_task(id).expect("create");
        store
            .transition(id, Transition::AttachPlan(sample_plan(id)))
            .expect("attach");
        store
            .transition(id, Transition::ApprovePlan { feedback: None })
            .expect("approve");
        store
            .transition(id, Transition::StartExecution)
            .expect("start");
        store
            .transition(id, Transition::FinishExecution)
            .expect("finish");
    }

    #[test]
    fn execution_record_becomes_latest_test_result() {
        let store = TaskStore::new();
        testing_task(&store, "t1");
        store.record_execution("t1", execution(false)).expect("record");
        let task = store.record_execution("t1", execution(true)).expect("record");
        assert_eq!(task.execution_history.len(), 2);
        assert_eq!(
            task.test_result,
            Some(TestResult {
                command: "cargo test".to_string(),
                success: true,
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
                duration_ms: 5,
            })
        );
    }

    #[test]
    fn execution_after_feedback_is_history_only() {
        let store = TaskStore::new();
        testing_task(&store, "t1");
        store
            .transition("t1", Transition::Feedback("try again".to_string()))
            .expect("feedback");

        let task = store.record_execution("t1", execution(true)).expect("record");
        assert_eq!(task.status, TaskStatus::Planning);
        assert_eq!(task.execution_history.len(), 1);
        assert!(task.test_result.is_none());
    }

    #[test]
    fn list_preserves_creation_order_and_reset_clears() {
        let store = TaskStore::new();
        for id in ["b", "a", "c"] {
            store.create_task(id).expect("create");
        }
        let ids: Vec<String> = store.list_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        store.reset();
        assert!(store.list_tasks().is_empty());
    }

    /// Concurrent appends are all kept.
    #[test]
    fn concurrent_records_are_serialized() {
        let store = Arc::new(TaskStore::new());
        store.create_task("t1").expect("create");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.record_execution("t1", execution(true)).expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let task = store.get_task("t1").expect("present");
        assert_eq!(task.execution_history.len(), 200);
    }
}
