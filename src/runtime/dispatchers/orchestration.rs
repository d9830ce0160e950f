use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::OrchestrationWorkItem;
use crate::runtime::TaskHubWorker;

impl TaskHubWorker {
    /// Spawns `orchestration_concurrency` loops. The task hub guarantees that an
    /// instance is never handed to two loops at once.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = Arc::clone(&self.shutdown_flag);

        tokio::spawn(async move {
            let mut loops = Vec::with_capacity(concurrency);
            for idx in 0..concurrency {
                let worker = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let loop_id = format!("orch-{idx}-{}", worker.worker_id);
                loops.push(tokio::spawn(async move {
                    while !shutdown.load(Ordering::Relaxed) {
                        match worker.transport.fetch_orchestration_work_item().await {
                            Ok(Some(item)) => worker.run_orchestration_pass(item, &loop_id).await,
                            Ok(None) => tokio::time::sleep(worker.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(
                                    target: "durabletask::runtime::dispatchers::orchestration",
                                    worker_id = %loop_id,
                                    error = %e,
                                    retryable = e.is_retryable(),
                                    "failed to fetch orchestration work item"
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

    async fn run_orchestration_pass(&self, item: OrchestrationWorkItem, loop_id: &str) {
        let instance_id = item.instance_id.clone();
        let execution_id = item.execution_id.clone();
        debug!(
            target: "durabletask::runtime::dispatchers::orchestration",
            instance_id = %instance_id,
            execution_id = %execution_id,
            worker_id = %loop_id,
            past_events = item.past_events.len(),
            new_events = item.new_events.len(),
            "orchestration pass started"
        );

        let completion = self.process_orchestration_work_item(item);
        let action_count = completion.actions.len();

        match self.transport.complete_orchestration_work_item(completion).await {
            Ok(()) => debug!(
                target: "durabletask::runtime::dispatchers::orchestration",
                instance_id = %instance_id,
                execution_id = %execution_id,
                worker_id = %loop_id,
                actions = action_count,
                "orchestration pass completed"
            ),
            Err(e) => {
                warn!(
                    target: "durabletask::runtime::dispatchers::orchestration",
                    instance_id = %instance_id,
                    execution_id = %execution_id,
                    worker_id = %loop_id,
                    error = %e,
                    "failed to complete orchestration work item; abandoning for redelivery"
                );
                if let Err(e) = self
                    .transport
                    .abandon_orchestration_work_item(&instance_id, &execution_id)
                    .await
                {
                    warn!(
                        target: "durabletask::runtime::dispatchers::orchestration",
                        instance_id = %instance_id,
                        worker_id = %loop_id,
                        error = %e,
                        "failed to abandon orchestration work item"
                    );
                }
            }
        }
    }
}
