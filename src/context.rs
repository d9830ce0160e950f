use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::futures::{ContinueAsNewFuture, Task, WhenAll, WhenAny};
use crate::{Action, AppErrorKind, ErrorDetails, Event, EventKind};

/// What a sequence number was handed out for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Activity { name: String },
    Timer,
    SubOrchestration { name: String, instance_id: String },
    ExternalEvent { name: String },
}

impl TaskKind {
    pub(crate) fn describe(&self) -> String {
        match self {
            TaskKind::Activity { name } => format!("activity '{name}'"),
            TaskKind::Timer => "timer".to_string(),
            TaskKind::SubOrchestration { name, instance_id } => {
                format!("sub-orchestration '{name}' ({instance_id})")
            }
            TaskKind::ExternalEvent { name } => format!("wait for external event '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskState {
    Pending,
    Completed(Option<String>),
    Failed(ErrorDetails),
}

impl TaskState {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TaskSlot {
    pub(crate) kind: TaskKind,
    pub(crate) state: TaskState,
    /// Order in which the task reached a terminal state during this pass.
    pub(crate) resolved_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct ContinueAsNewRequest {
    /// Encoded input, or why it could not be encoded.
    pub(crate) input: Result<String, ErrorDetails>,
    pub(crate) save_events: bool,
}

/// Per-pass state shared between the context, every task handle and the engine.
#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    /// Set when the pass ends; handles from a closed pass must not be awaited.
    pub(crate) closed: bool,
    pub(crate) is_replaying: bool,
    pub(crate) current_utc: DateTime<Utc>,
    sequence: u32,
    resolutions: u64,
    /// Actions issued this pass that history has not confirmed yet, keyed by sequence number.
    pub(crate) pending_actions: BTreeMap<u32, Action>,
    pub(crate) tasks: HashMap<u32, TaskSlot>,
    /// Lowercased event name -> waiting task ids in creation order.
    event_waiters: HashMap<String, VecDeque<u32>>,
    /// Raised events nobody has waited for yet, in arrival order.
    pub(crate) received_events: VecDeque<Event>,
    pub(crate) custom_status: Option<String>,
    pub(crate) continue_as_new: Option<ContinueAsNewRequest>,
}

impl CtxInner {
    fn new(instance_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            closed: false,
            is_replaying: true,
            current_utc: start_time,
            sequence: 0,
            resolutions: 0,
            pending_actions: BTreeMap::new(),
            tasks: HashMap::new(),
            event_waiters: HashMap::new(),
            received_events: VecDeque::new(),
            custom_status: None,
            continue_as_new: None,
        }
    }

    pub(crate) fn next_sequence(&mut self) -> u32 {
        let id = self.sequence;
        self.sequence += 1;
        id
    }

    fn open_task(&mut self, id: u32, kind: TaskKind) {
        self.tasks.insert(
            id,
            TaskSlot {
                kind,
                state: TaskState::Pending,
                resolved_at: None,
            },
        );
    }

    fn schedule(&mut self, kind: TaskKind, build: impl FnOnce(u32) -> Action) -> u32 {
        let id = self.next_sequence();
        self.pending_actions.insert(id, build(id));
        self.open_task(id, kind);
        id
    }

    /// Task that failed before anything could be scheduled. It still takes a
    /// sequence number so later ids do not shift between passes.
    fn failed_task(&mut self, kind: TaskKind, details: ErrorDetails) -> u32 {
        let id = self.next_sequence();
        self.open_task(id, kind);
        self.resolve(id, TaskState::Failed(details));
        id
    }

    /// Moves a pending task to a terminal state. Returns false if the task was
    /// unknown or already terminal.
    pub(crate) fn resolve(&mut self, id: u32, state: TaskState) -> bool {
        let order = self.resolutions;
        match self.tasks.get_mut(&id) {
            Some(slot) if slot.state.is_pending() => {
                slot.state = state;
                slot.resolved_at = Some(order);
                self.resolutions += 1;
                true
            }
            _ => false,
        }
    }

    fn wait_for_event(&mut self, name: &str) -> u32 {
        let id = self.next_sequence();
        self.open_task(
            id,
            TaskKind::ExternalEvent {
                name: name.to_string(),
            },
        );
        let key = name.to_lowercase();
        let buffered = self
            .received_events
            .iter()
            .position(|ev| matches!(&ev.kind, EventKind::EventRaised { name, .. } if name.to_lowercase() == key));
        match buffered.and_then(|pos| self.received_events.remove(pos)) {
            Some(Event {
                kind: EventKind::EventRaised { input, .. },
                ..
            }) => {
                self.resolve(id, TaskState::Completed(input));
            }
            _ => self.event_waiters.entry(key).or_default().push_back(id),
        }
        id
    }

    /// Hands a raised event to the oldest waiter with that name, or buffers it.
    /// Returns the resumed task id.
    pub(crate) fn deliver_event(&mut self, event: &Event) -> Option<u32> {
        let EventKind::EventRaised { name, input } = &event.kind else {
            return None;
        };
        let waiter = self
            .event_waiters
            .get_mut(&name.to_lowercase())
            .and_then(|waiters| waiters.pop_front());
        match waiter {
            Some(id) => {
                self.resolve(id, TaskState::Completed(input.clone()));
                Some(id)
            }
            None => {
                self.received_events.push_back(event.clone());
                None
            }
        }
    }
}

/// Handle given to an orchestrator function for one replay pass.
///
/// All durable operations go through the context. Each call takes the next
/// sequence number, so the order of calls must depend only on the orchestration
/// input and the results of earlier durable operations.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), start_time))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        lock_inner(&self.inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// Deterministic "now": the timestamp of the latest `OrchestratorStarted`
    /// event processed so far. Never reads the system clock.
    pub fn current_utc_datetime(&self) -> DateTime<Utc> {
        self.lock().current_utc
    }

    /// True while the engine is walking events that a previous pass already saw.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().custom_status = Some(status.into());
    }

    pub fn clear_custom_status(&self) {
        self.lock().custom_status = None;
    }

    pub fn custom_status(&self) -> Option<String> {
        self.lock().custom_status.clone()
    }

    /// Schedule an activity. The action is recorded immediately, whether or not
    /// the returned task is ever awaited.
    pub fn call_activity<Out>(&self, name: impl Into<String>, input: &(impl Serialize + ?Sized)) -> Task<Out> {
        let name = name.into();
        let kind = TaskKind::Activity { name: name.clone() };
        let mut inner = self.lock();
        let id = match Json::encode(input) {
            Ok(payload) => inner.schedule(kind, |id| Action::ScheduleActivity {
                id,
                name,
                input: Some(payload),
            }),
            Err(e) => inner.failed_task(kind, encode_failure(&e)),
        };
        drop(inner);
        Task::new(id, Arc::clone(&self.inner))
    }

    /// Durable timer firing at `fire_at`.
    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> Task<()> {
        let id = self
            .lock()
            .schedule(TaskKind::Timer, |id| Action::CreateTimer { id, fire_at });
        Task::new(id, Arc::clone(&self.inner))
    }

    /// Durable timer relative to [`current_utc_datetime`](Self::current_utc_datetime).
    pub fn create_timer_in(&self, delay: Duration) -> Task<()> {
        let now = self.current_utc_datetime();
        let fire_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.create_timer(fire_at)
    }

    /// Start a child orchestration. Without an explicit `instance_id` the child
    /// gets `"{parent}:{sequence:04x}"`, which is stable across replays.
    pub fn call_sub_orchestrator<Out>(
        &self,
        name: impl Into<String>,
        input: &(impl Serialize + ?Sized),
        instance_id: Option<&str>,
    ) -> Task<Out> {
        let name = name.into();
        let mut inner = self.lock();
        let encoded = Json::encode(input);
        let id = inner.next_sequence();
        let child = match instance_id {
            Some(explicit) => explicit.to_string(),
            None => format!("{}:{id:04x}", inner.instance_id),
        };
        let kind = TaskKind::SubOrchestration {
            name: name.clone(),
            instance_id: child.clone(),
        };
        match encoded {
            Ok(payload) => {
                inner.pending_actions.insert(
                    id,
                    Action::CreateSubOrchestration {
                        id,
                        name,
                        instance_id: child,
                        input: Some(payload),
                    },
                );
                inner.open_task(id, kind);
            }
            Err(e) => {
                inner.open_task(id, kind);
                inner.resolve(id, TaskState::Failed(encode_failure(&e)));
            }
        }
        drop(inner);
        Task::new(id, Arc::clone(&self.inner))
    }

    /// Wait for the next external event with this name (case-insensitive).
    /// Events raised before anyone waited are consumed oldest first.
    pub fn wait_for_external_event<T: DeserializeOwned>(&self, name: impl AsRef<str>) -> Task<T> {
        let id = self.lock().wait_for_event(name.as_ref());
        Task::new(id, Arc::clone(&self.inner))
    }

    /// End this execution and restart the instance with `input`. When
    /// `save_events` is set, raised events nobody consumed are carried into the
    /// next execution. The returned future never resolves.
    pub fn continue_as_new<T>(&self, input: &(impl Serialize + ?Sized), save_events: bool) -> ContinueAsNewFuture<T> {
        let input = Json::encode(input).map_err(|e| encode_failure(&e));
        self.lock().continue_as_new = Some(ContinueAsNewRequest { input, save_events });
        ContinueAsNewFuture::new()
    }

    pub fn when_all<T>(&self, tasks: impl IntoIterator<Item = Task<T>>) -> WhenAll<T> {
        WhenAll::new(tasks.into_iter().collect())
    }

    pub fn when_any<T>(&self, tasks: impl IntoIterator<Item = Task<T>>) -> WhenAny<T> {
        WhenAny::new(tasks.into_iter().collect())
    }
}

pub(crate) fn lock_inner(inner: &Mutex<CtxInner>) -> MutexGuard<'_, CtxInner> {
    // Orchestrator code never runs while the lock is held.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_failure(message: &str) -> ErrorDetails {
    ErrorDetails::application(AppErrorKind::OrchestrationFailed, format!("failed to encode input: {message}"))
}
