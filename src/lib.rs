//! Deterministic replay engine for durable orchestrations.
//!
//! An external task hub persists the history of every orchestration instance and
//! hands it to a worker whenever the instance can make progress. This crate
//! re-runs the orchestrator function against that history and produces the next
//! batch of [`Action`]s without repeating side effects that already happened.
//!
//! - Data model: [`Event`], [`EventKind`], [`Action`], [`ErrorDetails`]
//! - Orchestrator surface: [`OrchestrationContext`] and [`Task`] with
//!   [`WhenAll`]/[`WhenAny`] combinators
//! - Replay: [`runtime::replay_engine::ReplayEngine`] and [`run_turn`]
//! - Worker loop: [`runtime::TaskHubWorker`] driving a [`providers::TaskHubTransport`]
//!
//! ```rust,no_run
//! use durabletask::OrchestrationContext;
//! use durabletask::runtime::registry::OrchestrationRegistry;
//!
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register_typed("Add", |ctx: OrchestrationContext, (x, y): (i64, i64)| async move {
//!         let sum: i64 = ctx.call_activity("Add", &(x, y)).await?;
//!         Ok(sum)
//!     })
//!     .build();
//! # let _ = orchestrations;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod context;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use context::OrchestrationContext;
pub use futures::{ContinueAsNewFuture, Task, TaskError, WhenAll, WhenAny};
pub use runtime::replay_engine::{TurnResult, run_turn};
pub use runtime::{
    ActivityContext, ActivityHandler, OrchestrationHandler, OrchestrationStatus, TaskHubWorker, WorkerOptions,
};

#[doc(hidden)]
pub use tracing as __tracing;

// Typed payload codec. Payloads cross the task hub boundary as JSON text; an
// absent payload reads as JSON `null`.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    pub trait Codec {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: Option<&str>) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| e.to_string())
        }

        fn decode<T: DeserializeOwned>(s: Option<&str>) -> Result<T, String> {
            serde_json::from_str(s.unwrap_or("null")).map_err(|e| e.to_string())
        }
    }
}

/// Reference from a sub-orchestration back to the orchestration that created it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentInstance {
    pub name: String,
    pub instance_id: String,
    /// Execution of the parent that created the child; results for a
    /// replaced execution are dropped.
    pub execution_id: String,
    /// Sequence number of the `SubOrchestrationCreated` event in the parent.
    pub task_id: u32,
}

/// One immutable entry of an instance's history log.
///
/// `event_id` is the log position assigned by the task hub: unique and strictly
/// increasing within one execution. Durable operations are correlated through
/// the `task_id` carried by the kind, which is the sequence number the replay
/// engine handed out when the operation was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// The task hub dispatched a replay pass; `timestamp` is the pass's logical time.
    OrchestratorStarted,
    /// The execution started with the named orchestrator and input.
    ExecutionStarted {
        name: String,
        version: Option<String>,
        input: Option<String>,
        parent: Option<ParentInstance>,
    },
    TaskScheduled {
        task_id: u32,
        name: String,
        input: Option<String>,
    },
    TaskCompleted {
        task_id: u32,
        result: Option<String>,
    },
    TaskFailed {
        task_id: u32,
        details: ErrorDetails,
    },
    TimerCreated {
        task_id: u32,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        task_id: u32,
        fire_at: DateTime<Utc>,
    },
    SubOrchestrationCreated {
        task_id: u32,
        name: String,
        instance_id: String,
        input: Option<String>,
    },
    SubOrchestrationCompleted {
        task_id: u32,
        result: Option<String>,
    },
    SubOrchestrationFailed {
        task_id: u32,
        details: ErrorDetails,
    },
    /// An external event was raised against the instance. Names match case-insensitively.
    EventRaised { name: String, input: Option<String> },
    /// The execution ended by continuing as new; nothing after it is replayed.
    ContinueAsNewRequested { input: Option<String> },
}

impl Event {
    pub fn new(event_id: u64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp,
            kind,
        }
    }

    /// Sequence number this event schedules or answers, if any.
    pub fn task_id(&self) -> Option<u32> {
        match &self.kind {
            EventKind::TaskScheduled { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::TimerCreated { task_id, .. }
            | EventKind::TimerFired { task_id, .. }
            | EventKind::SubOrchestrationCreated { task_id, .. }
            | EventKind::SubOrchestrationCompleted { task_id, .. }
            | EventKind::SubOrchestrationFailed { task_id, .. } => Some(*task_id),
            EventKind::OrchestratorStarted
            | EventKind::ExecutionStarted { .. }
            | EventKind::EventRaised { .. }
            | EventKind::ContinueAsNewRequested { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::OrchestratorStarted => "OrchestratorStarted",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SubOrchestrationCreated { .. } => "SubOrchestrationCreated",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::ContinueAsNewRequested { .. } => "ContinueAsNewRequested",
        }
    }
}

/// Outbound instruction produced by a replay pass. The task hub materializes
/// each one into history exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    ScheduleActivity {
        id: u32,
        name: String,
        input: Option<String>,
    },
    CreateTimer {
        id: u32,
        fire_at: DateTime<Utc>,
    },
    CreateSubOrchestration {
        id: u32,
        name: String,
        instance_id: String,
        input: Option<String>,
    },
    /// Terminal: the execution completed (`Ok`) or failed (`Err`).
    CompleteOrchestration {
        id: u32,
        outcome: Result<Option<String>, ErrorDetails>,
    },
    /// Terminal: restart the instance with fresh history and `new_input`.
    ContinueAsNew {
        id: u32,
        new_input: Option<String>,
        carryover_events: Vec<Event>,
    },
}

impl Action {
    pub fn id(&self) -> u32 {
        match self {
            Action::ScheduleActivity { id, .. }
            | Action::CreateTimer { id, .. }
            | Action::CreateSubOrchestration { id, .. }
            | Action::CompleteOrchestration { id, .. }
            | Action::ContinueAsNew { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::CompleteOrchestration { .. } | Action::ContinueAsNew { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::ScheduleActivity { .. } => "ScheduleActivity",
            Action::CreateTimer { .. } => "CreateTimer",
            Action::CreateSubOrchestration { .. } => "CreateSubOrchestration",
            Action::CompleteOrchestration { .. } => "CompleteOrchestration",
            Action::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// Failure classification carried in history and in terminal outcomes.
///
/// - `Application`: user code failed (orchestrator error, activity error, panic).
///   Activity and sub-orchestration failures are recoverable by the awaiting code.
/// - `Configuration`: the deployment is wrong (nondeterministic code change,
///   unregistered names). Always fatal to the instance and never retried.
/// - `Infrastructure`: transport or limit violations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    OrchestrationFailed,
    ActivityFailed,
    Panicked,
    /// A task from another replay pass was awaited.
    AccessViolation,
}

impl ErrorDetails {
    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }

    pub(crate) fn application(kind: AppErrorKind, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Application { .. } => "application",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Infrastructure { retryable, .. } | ErrorDetails::Application { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// Human-readable rendering used in logs and failed outcomes.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => {
                let kind = match kind {
                    ConfigErrorKind::Nondeterminism => "nondeterministic",
                    ConfigErrorKind::UnregisteredOrchestration => "unregistered orchestration",
                    ConfigErrorKind::UnregisteredActivity => "unregistered activity",
                };
                match (resource.is_empty(), message) {
                    (true, Some(m)) => format!("{kind}: {m}"),
                    (false, Some(m)) => format!("{kind}:{resource}: {m}"),
                    (false, None) => format!("{kind}:{resource}"),
                    (true, None) => kind.to_string(),
                }
            }
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::Panicked => format!("orchestration panicked: {message}"),
                AppErrorKind::AccessViolation => format!("access violation: {message}"),
                AppErrorKind::OrchestrationFailed | AppErrorKind::ActivityFailed => message.clone(),
            },
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}
