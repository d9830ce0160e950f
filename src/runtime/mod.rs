//! Worker side: handler traits, registries, the replay engine and the loops
//! that connect them to a task hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::providers::{OrchestrationCompletion, OrchestrationWorkItem, TaskHubTransport};
use crate::{Action, ConfigErrorKind, ErrorDetails, OrchestrationContext};

mod dispatchers;
pub mod history;
pub mod limits;
pub mod registry;
pub mod replay_engine;

pub use history::HistoryReader;
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
use replay_engine::{ReplayEngine, TurnResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of concurrent orchestration dispatch loops. Default: 4
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity dispatch loops. Default: 4
    pub activity_concurrency: usize,
    /// Sleep when a fetch returns nothing. Default: 10ms
    pub dispatcher_idle_sleep: Duration,
    /// Sleep after a transport error before fetching again. Default: 100ms
    pub transport_error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 4,
            activity_concurrency: 4,
            dispatcher_idle_sleep: Duration::from_millis(10),
            transport_error_backoff: Duration::from_millis(100),
        }
    }
}

/// Status of an orchestration instance as tracked by a task hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: Option<String> },
    Failed { details: ErrorDetails },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. }
        )
    }
}

/// Error returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Orchestrator function as seen by the replay engine. Payloads are JSON text;
/// `None` means no payload.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, String> {
        (self.0)(ctx, input).await
    }
}

/// Identity of the activity invocation being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: String,
    name: String,
    task_id: u32,
}

impl ActivityContext {
    pub fn new(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        name: impl Into<String>,
        task_id: u32,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            name: name.into(),
            task_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence number the orchestrator assigned to this call.
    pub fn task_id(&self) -> u32 {
        self.task_id
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Option<String>) -> Result<Option<String>, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Option<String>) -> Result<Option<String>, String> {
        (self.0)(ctx, input).await
    }
}

fn failed_completion(item: OrchestrationWorkItem, details: ErrorDetails) -> OrchestrationCompletion {
    OrchestrationCompletion {
        instance_id: item.instance_id,
        execution_id: item.execution_id,
        actions: vec![Action::CompleteOrchestration {
            id: 0,
            outcome: Err(details),
        }],
        custom_status: None,
        orchestration_version: None,
    }
}

static NEXT_WORKER: AtomicU64 = AtomicU64::new(0);

/// Pulls work items from a task hub, replays orchestrations, executes
/// activities and sends the results back.
pub struct TaskHubWorker {
    transport: Arc<dyn TaskHubTransport>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    options: WorkerOptions,
    worker_id: String,
    shutdown_flag: Arc<AtomicBool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskHubWorker {
    pub async fn start(
        transport: Arc<dyn TaskHubTransport>,
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(transport, orchestrations, activities, WorkerOptions::default()).await
    }

    pub async fn start_with_options(
        transport: Arc<dyn TaskHubTransport>,
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
        options: WorkerOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let worker = Arc::new(Self::new(transport, orchestrations, activities, options));

        let orchestration_handle = worker.clone().start_orchestration_dispatcher();
        let activity_handle = worker.clone().start_activity_dispatcher();
        worker
            .joins
            .lock()
            .await
            .extend([orchestration_handle, activity_handle]);

        info!(
            target: "durabletask::runtime",
            worker_id = %worker.worker_id,
            orchestration_concurrency = worker.options.orchestration_concurrency,
            activity_concurrency = worker.options.activity_concurrency,
            "task hub worker started"
        );
        worker
    }

    /// Worker that is not polling yet. Useful for driving single work items.
    pub fn new(
        transport: Arc<dyn TaskHubTransport>,
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
        options: WorkerOptions,
    ) -> Self {
        let worker_id = format!("{:x}-{}", std::process::id(), NEXT_WORKER.fetch_add(1, Ordering::Relaxed));
        Self {
            transport,
            orchestrations,
            activities,
            options,
            worker_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Replays one orchestration work item into a completion. Nondeterminism,
    /// user failures, panics and unknown orchestrations all come back as a
    /// failing `CompleteOrchestration` action.
    pub fn process_orchestration_work_item(&self, item: OrchestrationWorkItem) -> OrchestrationCompletion {
        let reader = HistoryReader::from_events(item.past_events.iter().chain(&item.new_events));
        let Some(name) = reader.orchestration_name.clone() else {
            return failed_completion(item, ErrorDetails::nondeterminism("history has no ExecutionStarted event"));
        };

        // a recorded version is binding; only the first pass of an execution
        // consults the policy
        let resolved = match &reader.orchestration_version {
            Some(version) => semver::Version::parse(version)
                .ok()
                .and_then(|v| self.orchestrations.resolve_handler_exact(&name, &v).map(|h| (v, h))),
            None => self.orchestrations.resolve_handler(&name),
        };
        match resolved {
            Some((version, handler)) => self.replay(item, version, handler),
            None => {
                let details = ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredOrchestration,
                    resource: name,
                    message: reader.orchestration_version.map(|v| format!("version {v}")),
                };
                tracing::warn!(
                    target: "durabletask::runtime",
                    instance_id = %item.instance_id,
                    error = %details,
                    "orchestration is not registered"
                );
                failed_completion(item, details)
            }
        }
    }

    fn replay(
        &self,
        item: OrchestrationWorkItem,
        version: semver::Version,
        handler: Arc<dyn OrchestrationHandler>,
    ) -> OrchestrationCompletion {
        let mut engine = ReplayEngine::from_work_item(item);
        match engine.execute_orchestration(handler) {
            TurnResult::Continue => {}
            TurnResult::Completed(_) => debug!(
                target: "durabletask::runtime",
                instance_id = %engine.instance_id(),
                worker_id = %self.worker_id,
                "orchestration completed"
            ),
            TurnResult::ContinueAsNew { ref carryover_events, .. } => debug!(
                target: "durabletask::runtime",
                instance_id = %engine.instance_id(),
                worker_id = %self.worker_id,
                carryover = carryover_events.len(),
                "orchestration continued as new"
            ),
            TurnResult::Failed(details) if details.is_nondeterminism() => tracing::error!(
                target: "durabletask::runtime",
                instance_id = %engine.instance_id(),
                worker_id = %self.worker_id,
                error = %details,
                "nondeterministic orchestration"
            ),
            TurnResult::Failed(details) => tracing::warn!(
                target: "durabletask::runtime",
                instance_id = %engine.instance_id(),
                worker_id = %self.worker_id,
                category = details.category(),
                error = %details,
                "orchestration failed"
            ),
        }
        OrchestrationCompletion {
            orchestration_version: Some(version.to_string()),
            ..engine.into_completion()
        }
    }

    /// Stop fetching new work and wait for the dispatch loops to finish their
    /// current item.
    pub async fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let joins: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        for join in joins {
            let _ = join.await;
        }
        info!(target: "durabletask::runtime", worker_id = %self.worker_id, "task hub worker stopped");
    }
}
