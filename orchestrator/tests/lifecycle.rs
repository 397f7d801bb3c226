//! End-to-end lifecycle tests for the orchestrator command surface.
//!
//! These drive a task from creation to a terminal state through the public
//! API, against a real temp source tree and real subprocesses.

#![cfg(unix)]

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use orchestrator::core::lint::MSG_TODO_MARKER;
use orchestrator::core::types::TaskStatus;
use orchestrator::io::memory_log::MemoryQuery;
use orchestrator::orchestrator::RunOverrides;
use orchestrator::test_support::{TestProject, sample_contents, sample_plan};
use orchestrator::{Error, ErrorKind};

/// Full lifecycle: plan → approve → execute → test → review (rejected for a
/// TODO marker) → feedback → second cycle → review (accepted) → done.
///
/// ```text
/// PLANNING -> PLAN_APPROVED -> EXECUTING -> TESTING -> REVIEW
///     ^                                                  |
///     +---------------------- feedback ------------------+
/// PLANNING -> ... -> REVIEW -> DONE
/// ```
#[test]
fn full_lifecycle_with_rejected_review_and_feedback_cycle() {
    let project = TestProject::new();
    project.write_source("src/lib.rs", "pub mod existing;\n");
    project.write_source("src/existing.rs", "pub fn existing() {}\n");
    let orch = project.orchestrator();

    // Cycle 1.
    let task = orch.create_task(Some("task-1")).expect("create");
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.created_at, task.updated_at);

    orch.submit_plan("task-1", sample_plan("task-1"))
        .expect("submit plan");
    let task = orch.approve_plan("task-1", None).expect("approve");
    assert_eq!(task.status, TaskStatus::PlanApproved);
    assert!(orch.sandbox().exists("task-1"));

    let mut contents = sample_contents();
    contents.insert(
        "src/generated.rs".to_string(),
        "// TODO: fill in\npub fn generated() {}\n".to_string(),
    );
    let task = orch.execute_plan("task-1", &contents).expect("execute");
    assert_eq!(task.status, TaskStatus::Testing);

    let run = orch
        .run_test("task-1", "ls src", RunOverrides::default())
        .expect("test run");
    assert!(run.run.stdout.contains("generated.rs"));
    assert!(run.task.test_result.as_ref().is_some_and(|r| r.success));

    let packet = orch.request_review("task-1").expect("request review");
    assert_eq!(packet.task.status, TaskStatus::Review);
    assert_eq!(packet.diffs.len(), 1);
    assert_eq!(packet.diffs[0].path, "src/generated.rs");
    assert!(packet.test_result.is_some());

    let outcome = orch
        .submit_review("task-1", &packet.diffs[0].diff)
        .expect("submit review");
    assert!(!outcome.valid);
    assert_eq!(outcome.violations, vec![MSG_TODO_MARKER.to_string()]);
    assert_eq!(outcome.task.status, TaskStatus::Review);
    assert_eq!(outcome.task.review_history.len(), 1);

    let err = orch.approve_patch("task-1").expect_err("blocked");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(orch.sandbox().exists("task-1"));

    let task = orch
        .submit_feedback("task-1", "Remove the TODO marker.")
        .expect("feedback");
    assert_eq!(task.status, TaskStatus::Planning);
    assert!(task.plan.is_none());
    assert!(task.test_result.is_none());
    assert_eq!(task.feedback.as_deref(), Some("Remove the TODO marker."));

    // Cycle 2: the workspace is rebuilt from the source on approval.
    orch.submit_plan("task-1", sample_plan("task-1"))
        .expect("resubmit plan");
    orch.approve_plan("task-1", None).expect("re-approve");
    assert!(
        !orch
            .sandbox()
            .path("task-1")
            .join("src/generated.rs")
            .exists()
    );
    orch.execute_plan("task-1", &sample_contents())
        .expect("re-execute");
    orch.run_test("task-1", "echo ok", RunOverrides::default())
        .expect("re-test");
    let packet = orch.request_review("task-1").expect("re-review");
    let outcome = orch
        .submit_review("task-1", &packet.diffs[0].diff)
        .expect("submit review");
    assert!(outcome.valid, "{:?}", outcome.violations);

    let task = orch.approve_patch("task-1").expect("approve patch");
    assert_eq!(task.status, TaskStatus::Done);
    assert!(!orch.sandbox().exists("task-1"));
    assert_eq!(task.review_history.len(), 2);
    assert_eq!(task.execution_history.len(), 2);

    // The source tree was never written.
    assert!(!project.source_root().join("src/generated.rs").exists());

    // Terminal: nothing else is accepted.
    let err = orch
        .submit_feedback("task-1", "too late")
        .expect_err("terminal");
    assert!(matches!(err, Error::IllegalTransition(_)));

    let memory = orch.memory().expect("memory");
    let feedback = memory
        .query(&MemoryQuery {
            keyword: None,
            tags: vec!["feedback".to_string()],
        })
        .expect("query");
    assert_eq!(feedback.len(), 1);
    let plans = memory
        .query(&MemoryQuery {
            keyword: Some("generated module".to_string()),
            tags: vec!["plan".to_string()],
        })
        .expect("query");
    assert_eq!(plans.len(), 1, "re-approval refreshes the same item");
}

#[test]
fn operations_out_of_order_are_conflicts() {
    let project = TestProject::new();
    let orch = project.orchestrator();
    orch.create_task(Some("t1")).expect("create");

    let err = orch
        .execute_plan("t1", &sample_contents())
        .expect_err("not approved");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("PLANNING"));

    let err = orch.approve_plan("t1", None).expect_err("no plan");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = orch.request_review("t1").expect_err("not testing");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = orch.approve_patch("t1").expect_err("not in review");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Nothing above changed the task.
    let task = orch.get_task("t1").expect("task");
    assert_eq!(task.status, TaskStatus::Planning);
    assert!(task.review_history.is_empty());

    let err = orch.get_task("missing").expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = orch.create_task(Some("t1")).expect_err("duplicate");
    assert!(matches!(err, Error::DuplicateTask { .. }));
}

#[test]
fn feedback_during_testing_keeps_the_workspace() {
    let project = TestProject::new();
    let orch = project.orchestrator_in_testing("t1");
    let marker = orch.sandbox().path("t1").join("src/generated.rs");
    assert!(marker.is_file());

    orch.submit_feedback("t1", "different approach").expect("feedback");
    assert!(marker.is_file());
}

#[test]
fn failed_command_is_recorded_and_task_can_retry() {
    let project = TestProject::new();
    let orch = project.orchestrator_in_testing("t1");

    let err = orch
        .run_test("t1", "ls does-not-exist", RunOverrides::default())
        .expect_err("ls fails");
    assert_eq!(err.kind(), ErrorKind::Execution);

    let task = orch.get_task("t1").expect("task");
    assert_eq!(task.status, TaskStatus::Testing);
    let record = task.execution_history.last().expect("record");
    assert!(!record.success);
    assert_ne!(record.exit_code, 0);
    assert!(!record.stderr.is_empty());

    let err = orch.request_review("t1");
    assert!(err.is_ok(), "a failed test result still allows review");
}

/// While `limit` commands hold the gate, another caller is refused and the
/// task it targets is untouched; once they finish the next caller is admitted.
#[test]
fn gate_refuses_callers_beyond_the_limit() {
    let project = TestProject::new();
    let mut config = project.config();
    config.execution.concurrency_limit = 2;
    let orch = Arc::new(orchestrator::Orchestrator::new(config).expect("orchestrator"));
    for id in ["a", "b", "c"] {
        project.drive_to_testing(&orch, id);
    }

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|id| {
            let orch = Arc::clone(&orch);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                orch.run_test(id, "sleep 1", RunOverrides::default())
            })
        })
        .collect();

    barrier.wait();
    // Wait for both sleeps to hold their slots.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while orch.gate().active() < 2 && std::time::Instant::now() < deadline {
        thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(orch.gate().is_saturated());

    let err = orch
        .run_test("c", "echo hi", RunOverrides::default())
        .expect_err("saturated");
    assert!(matches!(err, Error::Saturated { active: 2, limit: 2 }));
    assert!(err.is_retryable());
    assert!(
        orch.get_task("c")
            .expect("task")
            .execution_history
            .is_empty()
    );

    for handle in handles {
        handle.join().expect("join").expect("sleep passes");
    }
    assert_eq!(orch.gate().active(), 0);
    orch.run_test("c", "echo hi", RunOverrides::default())
        .expect("admitted after release");
}

/// A run that finishes after feedback reopened planning is kept as history,
/// but it does not count as the next cycle's test result.
#[test]
fn run_finishing_after_feedback_does_not_satisfy_next_review() {
    let project = TestProject::new();
    let orch = Arc::new(project.orchestrator());
    project.drive_to_testing(&orch, "t1");

    let runner = {
        let orch = Arc::clone(&orch);
        thread::spawn(move || orch.run_test("t1", "sleep 1", RunOverrides::default()))
    };
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while orch.gate().active() < 1 && std::time::Instant::now() < deadline {
        thread::sleep(std::time::Duration::from_millis(5));
    }
    orch.submit_feedback("t1", "wrong file").expect("feedback");
    runner.join().expect("join").expect("sleep passes");

    let task = orch.get_task("t1").expect("task");
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.execution_history.len(), 1);
    assert!(task.test_result.is_none());

    orch.submit_plan("t1", sample_plan("t1")).expect("plan");
    orch.approve_plan("t1", None).expect("approve");
    orch.execute_plan("t1", &sample_contents()).expect("execute");
    let err = orch.request_review("t1").expect_err("no run this cycle");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        orch.get_task("t1").expect("task").status,
        TaskStatus::Testing
    );
}

#[test]
fn review_diff_covers_modified_new_and_removed_files() {
    let project = TestProject::new();
    project.write_source("a.txt", "alpha\n");
    project.write_source("b.txt", "beta\n");
    let orch = project.orchestrator_in_testing("t1");
    let workspace = orch.sandbox().path("t1");
    fs::write(workspace.join("a.txt"), "ALPHA\n").expect("modify");
    fs::remove_file(workspace.join("b.txt")).expect("remove");
    orch.run_test("t1", "echo ok", RunOverrides::default())
        .expect("test");

    let packet = orch.request_review("t1").expect("review");
    let paths: Vec<&str> = packet.diffs.iter().map(|d| d.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "b.txt", "src/generated.rs"]);
    assert!(packet.diffs[0].diff.contains("-alpha\n+ALPHA\n"));
    assert!(packet.diffs[1].diff.contains("+++ /dev/null"));
    assert!(packet.diffs[2].diff.starts_with("--- /dev/null"));
}
