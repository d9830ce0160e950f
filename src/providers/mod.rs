//! Task hub abstraction.
//!
//! The task hub owns history, queues and timers. The worker only sees work
//! items coming in and completions going out, and never touches storage.

use serde::{Deserialize, Serialize};

use crate::{Action, ErrorDetails, Event};

pub mod error;
/// In-process task hub used by tests and local runs.
pub mod in_memory;

pub use error::TransportError;
pub use in_memory::InMemoryTaskHub;

/// One orchestration pass to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationWorkItem {
    pub instance_id: String,
    /// Identifies the execution; changes every time the instance continues as new.
    pub execution_id: String,
    /// History the previous passes already observed.
    pub past_events: Vec<Event>,
    /// Events appended since the last pass.
    pub new_events: Vec<Event>,
}

/// Result of a replay pass, handed back to the task hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationCompletion {
    pub instance_id: String,
    pub execution_id: String,
    /// In sequence order; a terminal action, if any, is last.
    pub actions: Vec<Action>,
    pub custom_status: Option<String>,
    /// Version the worker resolved for this execution. The hub records it in
    /// an `ExecutionStarted` that does not carry one yet, so later passes
    /// replay with the same handler.
    #[serde(default)]
    pub orchestration_version: Option<String>,
}

impl OrchestrationCompletion {
    /// Terminal action of the batch, if the pass ended the execution.
    pub fn terminal_action(&self) -> Option<&Action> {
        self.actions.last().filter(|a| a.is_terminal())
    }
}

/// One activity invocation to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityWorkItem {
    pub instance_id: String,
    pub execution_id: String,
    pub name: String,
    pub task_id: u32,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCompletion {
    pub instance_id: String,
    pub execution_id: String,
    pub task_id: u32,
    pub result: Result<Option<String>, ErrorDetails>,
}

/// Connection to a task hub.
///
/// Fetches return `Ok(None)` when nothing is ready. A task hub must never hand
/// out two orchestration work items for the same instance at once; the
/// in-flight item is settled by exactly one `complete_` or `abandon_` call.
#[async_trait::async_trait]
pub trait TaskHubTransport: Send + Sync {
    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TransportError>;

    async fn complete_orchestration_work_item(&self, completion: OrchestrationCompletion)
    -> Result<(), TransportError>;

    /// Give the work item back for redelivery. Default relies on the task hub
    /// redelivering unacknowledged items on its own.
    async fn abandon_orchestration_work_item(
        &self,
        _instance_id: &str,
        _execution_id: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TransportError>;

    async fn complete_activity_work_item(&self, completion: ActivityCompletion) -> Result<(), TransportError>;
}
