//! Test-only fixtures: a throwaway project tree and deterministic plans.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::types::{Plan, PlanStep, StepAction};
use crate::io::config::OrchestratorConfig;
use crate::io::workspace::WorkspaceSandbox;
use crate::orchestrator::Orchestrator;

/// Temp directory with a source tree, a workspace root and a memory log,
/// all disjoint.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("project")).expect("create source root");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn source_root(&self) -> PathBuf {
        self.temp.path().join("project")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    /// Write `contents` to `rel` under the source root, creating parents.
    pub fn write_source(&self, rel: &str, contents: &str) {
        let path = self.source_root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write source file");
    }

    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            source_root: self.source_root(),
            workspace_root: self.workspace_root(),
            memory_log_path: Some(self.temp.path().join("memory.jsonl")),
            ..OrchestratorConfig::default()
        }
    }

    pub fn sandbox(&self) -> WorkspaceSandbox {
        let config = self.config();
        WorkspaceSandbox::new(
            config.source_root,
            config.workspace_root,
            config.excluded_dirs,
        )
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.config()).expect("orchestrator")
    }

    /// Orchestrator with task `id` already executed and waiting in `TESTING`.
    pub fn orchestrator_in_testing(&self, id: &str) -> Orchestrator {
        let orch = self.orchestrator();
        self.drive_to_testing(&orch, id);
        orch
    }

    /// Create `id`, attach [`sample_plan`], approve and execute it.
    pub fn drive_to_testing(&self, orch: &Orchestrator, id: &str) {
        orch.create_task(Some(id)).expect("create task");
        orch.submit_plan(id, sample_plan(id)).expect("submit plan");
        orch.approve_plan(id, None).expect("approve plan");
        orch.execute_plan(id, &sample_contents())
            .expect("execute plan");
    }

    /// [`drive_to_testing`](Self::drive_to_testing), then a passing `echo`
    /// run and a review request.
    #[cfg(unix)]
    pub fn drive_to_review(&self, orch: &Orchestrator, id: &str) {
        self.drive_to_testing(orch, id);
        orch.run_test(id, "echo ok", Default::default())
            .expect("run test");
        orch.request_review(id).expect("request review");
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Plan with a single `create` step for `src/generated.rs`.
pub fn sample_plan(task_id: &str) -> Plan {
    Plan {
        task_id: task_id.to_string(),
        goals: vec!["Add a generated module".to_string()],
        steps: vec![PlanStep {
            file: "src/generated.rs".to_string(),
            symbol: None,
            action: StepAction::Create,
            test_impact: Some("New module needs its own tests.".to_string()),
        }],
        risks: vec!["New module is not wired into the build yet.".to_string()],
        evidence: vec!["src/lib.rs:1".to_string()],
    }
}

/// File bodies for [`sample_plan`].
pub fn sample_contents() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "src/generated.rs".to_string(),
        "pub fn generated() -> u32 {\n    42\n}\n".to_string(),
    )])
}
