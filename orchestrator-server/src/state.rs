//! Shared application state for the orchestrator server.

use std::sync::Arc;

use minijinja::Environment;
use orchestrator::Orchestrator;
use orchestrator::core::types::{Task, TaskStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::review_page;

/// Events broadcast to SSE clients after a command changes a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreated {
        task_id: String,
        status: TaskStatus,
    },
    StatusChanged {
        task_id: String,
        status: TaskStatus,
    },
    ExecutionRecorded {
        task_id: String,
        success: bool,
    },
    ReviewRecorded {
        task_id: String,
        valid: bool,
    },
    MemoryUpdated {
        id: String,
    },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Broadcast sender for task change events.
    pub event_tx: Arc<broadcast::Sender<TaskEvent>>,
    /// Compiled HTML templates.
    pub templates: Arc<Environment<'static>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> anyhow::Result<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            event_tx: Arc::new(event_tx),
            templates: Arc::new(review_page::environment()?),
        })
    }

    /// Send `event`; having no subscribers is not an error.
    pub fn publish(&self, event: TaskEvent) {
        debug!(?event, "broadcasting task event");
        let _ = self.event_tx.send(event);
    }

    pub fn publish_created(&self, task: &Task) {
        self.publish(TaskEvent::TaskCreated {
            task_id: task.id.clone(),
            status: task.status,
        });
    }

    pub fn publish_status(&self, task: &Task) {
        self.publish(TaskEvent::StatusChanged {
            task_id: task.id.clone(),
            status: task.status,
        });
    }
}
