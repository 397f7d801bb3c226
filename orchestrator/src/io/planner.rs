//! Plan generation collaborators.
//!
//! The orchestrator only consumes the [`Plan`] shape. These stand-ins produce
//! deterministic plans so the full lifecycle can run without a code-search
//! or model backend.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{Plan, PlanStep, StepAction};

/// Pattern used when the caller gives no context.
pub const DEFAULT_SEARCH_PATTERN: &str = "controller";

/// One code-search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub file_path: String,
    pub line: u32,
    pub text: String,
}

impl SymbolMatch {
    /// `path:line` reference stored as plan evidence.
    pub fn evidence(&self) -> String {
        format!("{}:{}", self.file_path, self.line)
    }
}

pub trait CodeSearch: Send + Sync {
    fn search(&self, pattern: &str) -> Result<Vec<SymbolMatch>>;
}

/// Returns the same matches for every pattern.
#[derive(Debug, Clone)]
pub struct StaticSearch {
    matches: Vec<SymbolMatch>,
}

impl StaticSearch {
    pub fn new(matches: Vec<SymbolMatch>) -> Self {
        Self { matches }
    }
}

impl Default for StaticSearch {
    fn default() -> Self {
        Self::new(vec![SymbolMatch {
            file_path: "some/file.ts".to_string(),
            line: 42,
            text: "some matching text".to_string(),
        }])
    }
}

impl CodeSearch for StaticSearch {
    fn search(&self, pattern: &str) -> Result<Vec<SymbolMatch>> {
        debug!(pattern, matches = self.matches.len(), "static search");
        Ok(self.matches.clone())
    }
}

/// Turns a free-text requirement into a plan for `task_id`.
pub trait PlanProvider: Send + Sync {
    fn plan(&self, task_id: &str, requirement: &str, context: Option<&str>) -> Result<Plan>;
}

/// Template planner: one `replace` step on an existing file and one `create`
/// step for a new one, with search hits as evidence.
pub struct MockPlanner {
    search: Box<dyn CodeSearch>,
}

impl MockPlanner {
    pub fn new(search: Box<dyn CodeSearch>) -> Self {
        Self { search }
    }
}

impl Default for MockPlanner {
    fn default() -> Self {
        Self::new(Box::new(StaticSearch::default()))
    }
}

impl PlanProvider for MockPlanner {
    fn plan(&self, task_id: &str, requirement: &str, context: Option<&str>) -> Result<Plan> {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            return Err(anyhow!("requirement must be non-empty"));
        }
        let pattern = context
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_SEARCH_PATTERN);
        let matches = self.search.search(pattern)?;

        Ok(Plan {
            task_id: task_id.to_string(),
            goals: vec![requirement.to_string()],
            steps: vec![
                PlanStep {
                    file: "mock/path/to/file.ts".to_string(),
                    symbol: Some("someFunction".to_string()),
                    action: StepAction::Replace,
                    test_impact: Some(
                        "Requires new unit tests for the updated logic.".to_string(),
                    ),
                },
                PlanStep {
                    file: "mock/path/to/anotherFile.ts".to_string(),
                    symbol: None,
                    action: StepAction::Create,
                    test_impact: Some("Requires a new test file.".to_string()),
                },
            ],
            risks: vec!["The change might affect downstream dependencies.".to_string()],
            evidence: matches.iter().map(SymbolMatch::evidence).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSearch {
        patterns: Mutex<Vec<String>>,
    }

    impl CodeSearch for RecordingSearch {
        fn search(&self, pattern: &str) -> Result<Vec<SymbolMatch>> {
            self.patterns
                .lock()
                .expect("lock")
                .push(pattern.to_string());
            Ok(Vec::new())
        }
    }

    #[test]
    fn mock_plan_uses_requirement_and_search_evidence() {
        let plan = MockPlanner::default()
            .plan("t1", "  Add login  ", None)
            .expect("plan");
        assert_eq!(plan.task_id, "t1");
        assert_eq!(plan.goals, vec!["Add login".to_string()]);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].action, StepAction::Replace);
        assert_eq!(plan.steps[1].action, StepAction::Create);
        assert_eq!(plan.evidence, vec!["some/file.ts:42".to_string()]);
    }

    #[test]
    fn context_drives_the_search_pattern() {
        let search = std::sync::Arc::new(RecordingSearch {
            patterns: Mutex::new(Vec::new()),
        });
        struct Shared(std::sync::Arc<RecordingSearch>);
        impl CodeSearch for Shared {
            fn search(&self, pattern: &str) -> Result<Vec<SymbolMatch>> {
                self.0.search(pattern)
            }
        }

        let planner = MockPlanner::new(Box::new(Shared(search.clone())));
        planner.plan("t1", "req", Some("router")).expect("plan");
        planner.plan("t1", "req", Some("  ")).expect("plan");
        assert_eq!(
            *search.patterns.lock().expect("lock"),
            vec!["router".to_string(), DEFAULT_SEARCH_PATTERN.to_string()]
        );
    }

    #[test]
    fn empty_requirement_is_rejected() {
        assert!(MockPlanner::default().plan("t1", " ", None).is_err());
    }
}
