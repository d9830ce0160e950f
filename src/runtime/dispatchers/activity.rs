use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{ActivityCompletion, ActivityWorkItem};
use crate::runtime::{ActivityContext, TaskHubWorker};
use crate::{AppErrorKind, ConfigErrorKind, ErrorDetails};

impl TaskHubWorker {
    /// Spawns `activity_concurrency` loops executing activities independently.
    pub(in crate::runtime) fn start_activity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.activity_concurrency.max(1);
        let shutdown = Arc::clone(&self.shutdown_flag);

        tokio::spawn(async move {
            let mut loops = Vec::with_capacity(concurrency);
            for idx in 0..concurrency {
                let worker = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let loop_id = format!("work-{idx}-{}", worker.worker_id);
                loops.push(tokio::spawn(async move {
                    while !shutdown.load(Ordering::Relaxed) {
                        match worker.transport.fetch_activity_work_item().await {
                            Ok(Some(item)) => worker.run_activity(item, &loop_id).await,
                            Ok(None) => tokio::time::sleep(worker.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(
                                    target: "durabletask::runtime::dispatchers::activity",
                                    worker_id = %loop_id,
                                    error = %e,
                                    "failed to fetch activity work item"
                                );
                                tokio::time::sleep(worker.options.transport_error_backoff).await;
                            }
                        }
                    }
                }));
            }
            for handle in loops {
                let _ = handle.await;
            }
        })
    }

    async fn run_activity(&self, item: ActivityWorkItem, loop_id: &str) {
        let completion = self.execute_activity(item, loop_id).await;
        let (instance_id, task_id) = (completion.instance_id.clone(), completion.task_id);
        if let Err(e) = self.transport.complete_activity_work_item(completion).await {
            warn!(
                target: "durabletask::runtime::dispatchers::activity",
                instance_id = %instance_id,
                task_id,
                worker_id = %loop_id,
                error = %e,
                "failed to complete activity work item"
            );
        }
    }

    /// Runs the registered handler. Errors returned by the activity and unknown
    /// activity names both become a failed completion.
    pub(in crate::runtime) async fn execute_activity(&self, item: ActivityWorkItem, loop_id: &str) -> ActivityCompletion {
        let ActivityWorkItem {
            instance_id,
            execution_id,
            name,
            task_id,
            input,
        } = item;

        let result = match self.activities.resolve_handler(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext::new(instance_id.clone(), execution_id.clone(), name.clone(), task_id);
                let started = std::time::Instant::now();
                let result = handler.invoke(ctx, input).await;
                let outcome = if result.is_ok() { "success" } else { "app_error" };
                debug!(
                    target: "durabletask::runtime::dispatchers::activity",
                    instance_id = %instance_id,
                    activity_name = %name,
                    task_id,
                    worker_id = %loop_id,
                    outcome,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "activity finished"
                );
                result.map_err(|message| ErrorDetails::Application {
                    kind: AppErrorKind::ActivityFailed,
                    message,
                    retryable: false,
                })
            }
            None => {
                warn!(
                    target: "durabletask::runtime::dispatchers::activity",
                    instance_id = %instance_id,
                    activity_name = %name,
                    worker_id = %loop_id,
                    "activity is not registered"
                );
                Err(ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredActivity,
                    resource: name,
                    message: None,
                })
            }
        };

        ActivityCompletion {
            instance_id,
            execution_id,
            task_id,
            result,
        }
    }
}
