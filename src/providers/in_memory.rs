use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ActivityCompletion, ActivityWorkItem, OrchestrationCompletion, OrchestrationWorkItem, TaskHubTransport,
    TransportError,
};
use crate::_typed_codec::{Codec, Json};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::{Action, ErrorDetails, Event, EventKind, ParentInstance};

/// Task hub that keeps everything in process memory.
///
/// It plays the durable side of the protocol: it stores history per instance,
/// turns actions into history events, fires timers with tokio, runs child
/// orchestrations and restarts instances that continue as new. Nothing
/// survives the process.
#[derive(Clone, Default)]
pub struct InMemoryTaskHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    instances: HashMap<String, InstanceRecord>,
    /// Instances with undelivered events and no pass in flight.
    ready: VecDeque<String>,
    activities: VecDeque<ActivityWorkItem>,
    executions: u64,
}

struct InstanceRecord {
    name: String,
    execution_id: String,
    history: Vec<Event>,
    /// Events waiting for the next pass; ids are assigned at dispatch.
    inbox: Vec<Event>,
    /// New events of the pass currently being replayed.
    in_flight: Option<Vec<Event>>,
    status: OrchestrationStatus,
    custom_status: Option<String>,
    parent: Option<ParentInstance>,
}

impl InstanceRecord {
    fn append(&mut self, kind: EventKind) {
        let event_id = self.history.len() as u64 + 1;
        self.history.push(Event::new(event_id, Utc::now(), kind));
    }
}

/// Side effects of a completion that reach beyond the completed instance.
enum Effect {
    Activity(ActivityWorkItem),
    Timer { task_id: u32, fire_at: DateTime<Utc> },
    Child {
        instance_id: String,
        name: String,
        input: Option<String>,
        parent: ParentInstance,
    },
    NotifyParent(Result<Option<String>, ErrorDetails>),
    Restart {
        input: Option<String>,
        carryover_events: Vec<Event>,
    },
}

impl HubState {
    fn next_execution_id(&mut self) -> String {
        self.executions += 1;
        self.executions.to_string()
    }

    fn create_instance(
        &mut self,
        instance_id: &str,
        name: &str,
        version: Option<String>,
        input: Option<String>,
        parent: Option<ParentInstance>,
    ) -> Result<(), TransportError> {
        if self.instances.contains_key(instance_id) {
            return Err(TransportError::permanent(
                "start_orchestration",
                format!("instance already exists: {instance_id}"),
            ));
        }
        let execution_id = self.next_execution_id();
        let start = Event::new(
            0,
            Utc::now(),
            EventKind::ExecutionStarted {
                name: name.to_string(),
                version,
                input,
                parent: parent.clone(),
            },
        );
        self.instances.insert(
            instance_id.to_string(),
            InstanceRecord {
                name: name.to_string(),
                execution_id,
                history: Vec::new(),
                inbox: vec![start],
                in_flight: None,
                status: OrchestrationStatus::Running,
                custom_status: None,
                parent,
            },
        );
        self.mark_ready(instance_id);
        Ok(())
    }

    /// Queue an event for the instance. Events for finished instances or for a
    /// previous execution are dropped.
    fn deliver(&mut self, instance_id: &str, execution_id: Option<&str>, kind: EventKind) {
        let Some(record) = self.instances.get_mut(instance_id) else {
            debug!(target: "durabletask::providers::in_memory", instance_id, "dropping event for unknown instance");
            return;
        };
        let current = execution_id.is_none_or(|e| e == record.execution_id);
        if record.status != OrchestrationStatus::Running || !current {
            debug!(
                target: "durabletask::providers::in_memory",
                instance_id,
                ?execution_id,
                "dropping event for finished or replaced execution"
            );
            return;
        }
        record.inbox.push(Event::new(0, Utc::now(), kind));
        self.mark_ready(instance_id);
    }

    fn mark_ready(&mut self, instance_id: &str) {
        let Some(record) = self.instances.get(instance_id) else {
            return;
        };
        if record.in_flight.is_none()
            && !record.inbox.is_empty()
            && record.status == OrchestrationStatus::Running
            && !self.ready.iter().any(|id| id == instance_id)
        {
            self.ready.push_back(instance_id.to_string());
        }
    }
}

impl InMemoryTaskHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance and queue its `ExecutionStarted` event.
    pub async fn start_orchestration(
        &self,
        instance_id: &str,
        name: &str,
        input: &(impl Serialize + ?Sized),
    ) -> Result<(), TransportError> {
        let input = Json::encode(input).map_err(|e| TransportError::permanent("start_orchestration", e))?;
        self.state
            .lock()
            .await
            .create_instance(instance_id, name, None, Some(input), None)
    }

    /// Like [`start_orchestration`](Self::start_orchestration), pinned to one
    /// registered version instead of whatever the worker's policy picks.
    pub async fn start_orchestration_versioned(
        &self,
        instance_id: &str,
        name: &str,
        version: &str,
        input: &(impl Serialize + ?Sized),
    ) -> Result<(), TransportError> {
        let input = Json::encode(input).map_err(|e| TransportError::permanent("start_orchestration", e))?;
        self.state
            .lock()
            .await
            .create_instance(instance_id, name, Some(version.to_string()), Some(input), None)
    }

    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: &str,
        data: &(impl Serialize + ?Sized),
    ) -> Result<(), TransportError> {
        let input = Json::encode(data).map_err(|e| TransportError::permanent("raise_event", e))?;
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(instance_id) {
            return Err(TransportError::permanent(
                "raise_event",
                format!("unknown instance: {instance_id}"),
            ));
        }
        state.deliver(
            instance_id,
            None,
            EventKind::EventRaised {
                name: name.to_string(),
                input: Some(input),
            },
        );
        Ok(())
    }

    pub async fn get_status(&self, instance_id: &str) -> OrchestrationStatus {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|r| r.status.clone())
            .unwrap_or(OrchestrationStatus::NotFound)
    }

    pub async fn get_custom_status(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .and_then(|r| r.custom_status.clone())
    }

    /// Committed history of the current execution.
    pub async fn get_history(&self, instance_id: &str) -> Vec<Event> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    pub async fn get_execution_id(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|r| r.execution_id.clone())
    }

    /// Poll until the instance completes or fails.
    pub async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let wait = async {
            loop {
                match self.get_status(instance_id).await {
                    OrchestrationStatus::NotFound => {
                        return Err(WaitError::Other(format!("unknown instance: {instance_id}")));
                    }
                    status if status.is_terminal() => return Ok(status),
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WaitError::Timeout)?
    }

    fn schedule_timer(&self, instance_id: String, execution_id: String, task_id: u32, fire_at: DateTime<Utc>) {
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state
                .lock()
                .await
                .deliver(&instance_id, Some(&execution_id), EventKind::TimerFired { task_id, fire_at });
        });
    }
}

#[async_trait::async_trait]
impl TaskHubTransport for InMemoryTaskHub {
    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TransportError> {
        let mut state = self.state.lock().await;
        while let Some(instance_id) = state.ready.pop_front() {
            let Some(record) = state.instances.get_mut(&instance_id) else {
                continue;
            };
            if record.in_flight.is_some() || record.inbox.is_empty() || record.status != OrchestrationStatus::Running {
                continue;
            }
            let first_id = record.history.len() as u64 + 1;
            let new_events: Vec<Event> = std::iter::once(Event::new(0, Utc::now(), EventKind::OrchestratorStarted))
                .chain(record.inbox.drain(..))
                .zip(first_id..)
                .map(|(event, event_id)| Event { event_id, ..event })
                .collect();
            record.in_flight = Some(new_events.clone());
            return Ok(Some(OrchestrationWorkItem {
                instance_id,
                execution_id: record.execution_id.clone(),
                past_events: record.history.clone(),
                new_events,
            }));
        }
        Ok(None)
    }

    async fn complete_orchestration_work_item(
        &self,
        completion: OrchestrationCompletion,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let OrchestrationCompletion {
            instance_id,
            execution_id,
            actions,
            custom_status,
            orchestration_version,
        } = completion;

        let Some(record) = state.instances.get_mut(&instance_id) else {
            return Err(TransportError::permanent(
                "complete_orchestration_work_item",
                format!("unknown instance: {instance_id}"),
            ));
        };
        if record.execution_id != execution_id {
            return Err(TransportError::permanent(
                "complete_orchestration_work_item",
                format!("stale execution {execution_id} for {instance_id}"),
            ));
        }
        let Some(dispatched) = record.in_flight.take() else {
            return Err(TransportError::permanent(
                "complete_orchestration_work_item",
                format!("no pass in flight for {instance_id}"),
            ));
        };
        record.history.extend(dispatched.into_iter().map(|mut event| {
            if let EventKind::ExecutionStarted { version, .. } = &mut event.kind
                && version.is_none()
            {
                version.clone_from(&orchestration_version);
            }
            event
        }));
        record.custom_status = custom_status;

        let mut effects = Vec::new();
        for action in actions {
            match action {
                Action::ScheduleActivity { id, name, input } => {
                    record.append(EventKind::TaskScheduled {
                        task_id: id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    effects.push(Effect::Activity(ActivityWorkItem {
                        instance_id: instance_id.clone(),
                        execution_id: execution_id.clone(),
                        name,
                        task_id: id,
                        input,
                    }));
                }
                Action::CreateTimer { id, fire_at } => {
                    record.append(EventKind::TimerCreated { task_id: id, fire_at });
                    effects.push(Effect::Timer { task_id: id, fire_at });
                }
                Action::CreateSubOrchestration {
                    id,
                    name,
                    instance_id: child,
                    input,
                } => {
                    record.append(EventKind::SubOrchestrationCreated {
                        task_id: id,
                        name: name.clone(),
                        instance_id: child.clone(),
                        input: input.clone(),
                    });
                    effects.push(Effect::Child {
                        instance_id: child,
                        name,
                        input,
                        parent: ParentInstance {
                            name: record.name.clone(),
                            instance_id: instance_id.clone(),
                            execution_id: execution_id.clone(),
                            task_id: id,
                        },
                    });
                }
                Action::CompleteOrchestration { outcome, .. } => {
                    record.status = match &outcome {
                        Ok(output) => OrchestrationStatus::Completed { output: output.clone() },
                        Err(details) => OrchestrationStatus::Failed {
                            details: details.clone(),
                        },
                    };
                    effects.push(Effect::NotifyParent(outcome));
                }
                Action::ContinueAsNew {
                    new_input,
                    carryover_events,
                    ..
                } => effects.push(Effect::Restart {
                    input: new_input,
                    carryover_events,
                }),
            }
        }
        let parent = record.parent.clone();
        let name = record.name.clone();

        for effect in effects {
            match effect {
                Effect::Activity(item) => state.activities.push_back(item),
                Effect::Timer { task_id, fire_at } => {
                    self.schedule_timer(instance_id.clone(), execution_id.clone(), task_id, fire_at)
                }
                Effect::Child {
                    instance_id: child,
                    name,
                    input,
                    parent,
                } => {
                    if let Err(e) = state.create_instance(&child, &name, None, input, Some(parent.clone())) {
                        state.deliver(
                            &parent.instance_id,
                            Some(&execution_id),
                            EventKind::SubOrchestrationFailed {
                                task_id: parent.task_id,
                                details: e.to_infrastructure_error(),
                            },
                        );
                    }
                }
                Effect::NotifyParent(outcome) => {
                    if let Some(parent) = &parent {
                        let kind = match outcome {
                            Ok(result) => EventKind::SubOrchestrationCompleted {
                                task_id: parent.task_id,
                                result,
                            },
                            Err(details) => EventKind::SubOrchestrationFailed {
                                task_id: parent.task_id,
                                details,
                            },
                        };
                        state.deliver(&parent.instance_id, Some(&parent.execution_id), kind);
                    }
                }
                Effect::Restart {
                    input,
                    carryover_events,
                } => {
                    let next_execution = state.next_execution_id();
                    if let Some(record) = state.instances.get_mut(&instance_id) {
                        debug!(
                            target: "durabletask::providers::in_memory",
                            instance_id = %instance_id,
                            execution_id = %next_execution,
                            carryover = carryover_events.len(),
                            "continuing as new"
                        );
                        let start = Event::new(
                            0,
                            Utc::now(),
                            EventKind::ExecutionStarted {
                                name: name.clone(),
                                version: None,
                                input,
                                parent: parent.clone(),
                            },
                        );
                        // completions addressed to the old execution's tasks die with it
                        let raised = std::mem::take(&mut record.inbox)
                            .into_iter()
                            .filter(|e| matches!(e.kind, EventKind::EventRaised { .. }));
                        record.inbox = std::iter::once(start).chain(carryover_events).chain(raised).collect();
                        record.execution_id = next_execution;
                        record.history.clear();
                        record.status = OrchestrationStatus::Running;
                    }
                }
            }
        }
        state.mark_ready(&instance_id);
        Ok(())
    }

    async fn abandon_orchestration_work_item(
        &self,
        instance_id: &str,
        execution_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.instances.get_mut(instance_id) else {
            return Err(TransportError::permanent(
                "abandon_orchestration_work_item",
                format!("unknown instance: {instance_id}"),
            ));
        };
        if record.execution_id == execution_id
            && let Some(dispatched) = record.in_flight.take()
        {
            // the pass marker is regenerated on redelivery
            let pending = std::mem::take(&mut record.inbox);
            record.inbox = dispatched
                .into_iter()
                .filter(|e| !matches!(e.kind, EventKind::OrchestratorStarted))
                .chain(pending)
                .collect();
        }
        state.mark_ready(instance_id);
        Ok(())
    }

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TransportError> {
        Ok(self.state.lock().await.activities.pop_front())
    }

    async fn complete_activity_work_item(&self, completion: ActivityCompletion) -> Result<(), TransportError> {
        let kind = match completion.result {
            Ok(result) => EventKind::TaskCompleted {
                task_id: completion.task_id,
                result,
            },
            Err(details) => EventKind::TaskFailed {
                task_id: completion.task_id,
                details,
            },
        };
        self.state
            .lock()
            .await
            .deliver(&completion.instance_id, Some(&completion.execution_id), kind);
        Ok(())
    }
}
