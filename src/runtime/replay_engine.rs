//! Deterministic replay of one orchestration pass.
//!
//! The orchestrator function is re-run from the start on every pass. Durable
//! calls record their action eagerly, in program order, under the next sequence
//! number. The engine then walks history:
//!
//! - scheduling events (`TaskScheduled`, `TimerCreated`, `SubOrchestrationCreated`)
//!   confirm the pending action with the same sequence number, which must be of
//!   the same kind and name
//! - completion events resolve the matching task, after which the orchestrator
//!   is polled once so it can advance
//! - `EventRaised` wakes the oldest waiter with that name or is buffered
//!
//! Whatever is still pending after the last event is the new work for the
//! task hub.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::OrchestrationHandler;
use super::history::HistoryReader;
use super::limits::{MAX_CARRY_FORWARD_EVENTS, MAX_CUSTOM_STATUS_BYTES};
use crate::context::{CtxInner, TaskKind, TaskState};
use crate::providers::{OrchestrationCompletion, OrchestrationWorkItem};
use crate::{Action, AppErrorKind, ErrorDetails, Event, EventKind, OrchestrationContext};

type OrchestrationFuture = Pin<Box<dyn Future<Output = Result<Option<String>, String>> + Send>>;

/// Outcome of one replay pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// The orchestrator is waiting on durable operations.
    Continue,
    Completed(Option<String>),
    /// User failure, panic, nondeterminism or a violated limit.
    Failed(ErrorDetails),
    ContinueAsNew {
        input: Option<String>,
        carryover_events: Vec<Event>,
    },
}

/// Replays one work item and collects the resulting actions.
pub struct ReplayEngine {
    instance: String,
    execution_id: String,
    past_events: Vec<Event>,
    new_events: Vec<Event>,
    actions: Vec<Action>,
    custom_status: Option<String>,
}

impl ReplayEngine {
    pub fn new(
        instance: impl Into<String>,
        execution_id: impl Into<String>,
        past_events: Vec<Event>,
        new_events: Vec<Event>,
    ) -> Self {
        Self {
            instance: instance.into(),
            execution_id: execution_id.into(),
            past_events,
            new_events,
            actions: Vec::new(),
            custom_status: None,
        }
    }

    pub fn from_work_item(item: OrchestrationWorkItem) -> Self {
        Self::new(item.instance_id, item.execution_id, item.past_events, item.new_events)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// Actions produced by the last call to [`execute_orchestration`](Self::execute_orchestration),
    /// in sequence order, terminal action last.
    pub fn pending_actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn custom_status(&self) -> Option<&str> {
        self.custom_status.as_deref()
    }

    pub fn into_completion(self) -> OrchestrationCompletion {
        OrchestrationCompletion {
            instance_id: self.instance,
            execution_id: self.execution_id,
            actions: self.actions,
            custom_status: self.custom_status,
            orchestration_version: None,
        }
    }

    /// Run the orchestrator against the whole history. Never panics and never
    /// returns an error: every failure becomes [`TurnResult::Failed`].
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
        self.actions.clear();
        self.custom_status = None;

        let reader = HistoryReader::from_events(self.past_events.iter().chain(&self.new_events));
        if reader.is_continued_as_new {
            warn!(
                target: "durabletask::runtime::replay",
                instance_id = %self.instance,
                "history already ended with continue-as-new; nothing to replay"
            );
            return TurnResult::Continue;
        }

        let ctx = OrchestrationContext::new(self.instance.clone(), DateTime::<Utc>::UNIX_EPOCH);
        let mut pass = Pass::new(ctx.clone(), handler);
        let failure = match corruption(&reader) {
            Some(details) => Some(details),
            None => {
                let replayed = catch_unwind(AssertUnwindSafe(|| {
                    replay_history(&mut pass, &self.past_events, &self.new_events)
                }));
                match replayed {
                    Ok(Ok(())) => None,
                    Ok(Err(details)) => Some(details),
                    Err(panic) => Some(ErrorDetails::application(AppErrorKind::Panicked, panic_message(panic.as_ref()))),
                }
            }
        };

        // drop user state before the pass is closed
        pass.future = None;
        let output = pass.output.take();

        let mut inner = ctx.lock();
        let result = self.finish(&mut inner, output, failure);
        inner.closed = true;
        drop(inner);

        debug!(
            target: "durabletask::runtime::replay",
            instance_id = %self.instance,
            execution_id = %self.execution_id,
            past_events = self.past_events.len(),
            new_events = self.new_events.len(),
            actions = self.actions.len(),
            outcome = ?result,
            "replay pass finished"
        );
        result
    }

    fn finish(
        &mut self,
        inner: &mut CtxInner,
        output: Option<Result<Option<String>, String>>,
        failure: Option<ErrorDetails>,
    ) -> TurnResult {
        let mut result = if let Some(details) = failure {
            TurnResult::Failed(details)
        } else if let Some(request) = inner.continue_as_new.take() {
            match request.input {
                Err(details) => TurnResult::Failed(details),
                Ok(input) => {
                    let carryover_events = if request.save_events {
                        carryover(&self.instance, inner.received_events.drain(..).collect())
                    } else {
                        Vec::new()
                    };
                    TurnResult::ContinueAsNew {
                        input: Some(input),
                        carryover_events,
                    }
                }
            }
        } else {
            match output {
                Some(Ok(out)) => TurnResult::Completed(out),
                Some(Err(message)) => {
                    TurnResult::Failed(ErrorDetails::application(AppErrorKind::OrchestrationFailed, message))
                }
                None => TurnResult::Continue,
            }
        };

        let mut custom_status = inner.custom_status.take();
        if let Some(status) = &custom_status
            && status.len() > MAX_CUSTOM_STATUS_BYTES
            && !matches!(result, TurnResult::Failed(_))
        {
            result = TurnResult::Failed(ErrorDetails::Infrastructure {
                operation: "set_custom_status".to_string(),
                message: format!(
                    "custom status is {} bytes, limit is {MAX_CUSTOM_STATUS_BYTES}",
                    status.len()
                ),
                retryable: false,
            });
            custom_status = None;
        }
        self.custom_status = custom_status;

        let terminal_id = inner.next_sequence();
        self.actions = match &result {
            TurnResult::Continue => inner.pending_actions.values().cloned().collect(),
            TurnResult::Completed(out) => {
                let mut actions: Vec<Action> = inner.pending_actions.values().cloned().collect();
                actions.push(Action::CompleteOrchestration {
                    id: terminal_id,
                    outcome: Ok(out.clone()),
                });
                actions
            }
            TurnResult::Failed(details) => vec![Action::CompleteOrchestration {
                id: terminal_id,
                outcome: Err(details.clone()),
            }],
            TurnResult::ContinueAsNew {
                input,
                carryover_events,
            } => vec![Action::ContinueAsNew {
                id: terminal_id,
                new_input: input.clone(),
                carryover_events: carryover_events.clone(),
            }],
        };
        result
    }
}

/// Convenience wrapper: replay and return the outcome with the new actions.
pub fn run_turn(
    instance: impl Into<String>,
    past_events: Vec<Event>,
    new_events: Vec<Event>,
    handler: Arc<dyn OrchestrationHandler>,
) -> (TurnResult, Vec<Action>) {
    let mut engine = ReplayEngine::new(instance, "", past_events, new_events);
    let result = engine.execute_orchestration(handler);
    (result, engine.actions)
}

fn carryover(instance: &str, mut events: Vec<Event>) -> Vec<Event> {
    if events.len() > MAX_CARRY_FORWARD_EVENTS {
        let dropped = events.len() - MAX_CARRY_FORWARD_EVENTS;
        warn!(
            target: "durabletask::runtime::replay",
            instance_id = %instance,
            dropped,
            limit = MAX_CARRY_FORWARD_EVENTS,
            "too many unconsumed events to carry over; dropping the oldest"
        );
        events.drain(..dropped);
    }
    events
}

/// Histories the orchestrator cannot be replayed against at all.
fn corruption(reader: &HistoryReader) -> Option<ErrorDetails> {
    match reader.started_count {
        0 => Some(ErrorDetails::nondeterminism("history has no ExecutionStarted event")),
        1 => None,
        n => Some(ErrorDetails::nondeterminism(format!(
            "history contains {n} ExecutionStarted events"
        ))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn replay_history(pass: &mut Pass, past_events: &[Event], new_events: &[Event]) -> Result<(), ErrorDetails> {
    pass.ctx.lock().is_replaying = true;
    for event in past_events {
        pass.apply(event)?;
    }
    pass.ctx.lock().is_replaying = false;
    for event in new_events {
        pass.apply(event)?;
    }
    Ok(())
}

enum Step {
    Idle,
    Start(Option<String>),
    Resume,
}

/// Mutable state of one pass: the user future and what it returned.
struct Pass {
    ctx: OrchestrationContext,
    handler: Arc<dyn OrchestrationHandler>,
    future: Option<OrchestrationFuture>,
    output: Option<Result<Option<String>, String>>,
    clock_set: bool,
}

impl Pass {
    fn new(ctx: OrchestrationContext, handler: Arc<dyn OrchestrationHandler>) -> Self {
        Self {
            ctx,
            handler,
            future: None,
            output: None,
            clock_set: false,
        }
    }

    fn apply(&mut self, event: &Event) -> Result<(), ErrorDetails> {
        let step = {
            let mut inner = self.ctx.lock();
            match &event.kind {
                EventKind::OrchestratorStarted => {
                    inner.current_utc = event.timestamp;
                    self.clock_set = true;
                    Step::Idle
                }
                EventKind::ExecutionStarted { input, .. } => {
                    if !self.clock_set {
                        inner.current_utc = event.timestamp;
                    }
                    Step::Start(input.clone())
                }
                EventKind::TaskScheduled { task_id, name, .. } => {
                    confirm(&mut inner, event, *task_id, TaskKind::Activity { name: name.clone() })?
                }
                EventKind::TimerCreated { task_id, .. } => confirm(&mut inner, event, *task_id, TaskKind::Timer)?,
                EventKind::SubOrchestrationCreated {
                    task_id,
                    name,
                    instance_id,
                    ..
                } => confirm(
                    &mut inner,
                    event,
                    *task_id,
                    TaskKind::SubOrchestration {
                        name: name.clone(),
                        instance_id: instance_id.clone(),
                    },
                )?,
                EventKind::TaskCompleted { task_id, result } => complete(
                    &mut inner,
                    event,
                    *task_id,
                    |k| matches!(k, TaskKind::Activity { .. }),
                    TaskState::Completed(result.clone()),
                )?,
                EventKind::TaskFailed { task_id, details } => complete(
                    &mut inner,
                    event,
                    *task_id,
                    |k| matches!(k, TaskKind::Activity { .. }),
                    TaskState::Failed(details.clone()),
                )?,
                EventKind::TimerFired { task_id, .. } => complete(
                    &mut inner,
                    event,
                    *task_id,
                    |k| matches!(k, TaskKind::Timer),
                    TaskState::Completed(None),
                )?,
                EventKind::SubOrchestrationCompleted { task_id, result } => complete(
                    &mut inner,
                    event,
                    *task_id,
                    |k| matches!(k, TaskKind::SubOrchestration { .. }),
                    TaskState::Completed(result.clone()),
                )?,
                EventKind::SubOrchestrationFailed { task_id, details } => complete(
                    &mut inner,
                    event,
                    *task_id,
                    |k| matches!(k, TaskKind::SubOrchestration { .. }),
                    TaskState::Failed(details.clone()),
                )?,
                EventKind::EventRaised { .. } => match inner.deliver_event(event) {
                    Some(_) => Step::Resume,
                    None => Step::Idle,
                },
                EventKind::ContinueAsNewRequested { .. } => Step::Idle,
            }
        };

        match step {
            Step::Idle => {}
            Step::Start(input) => self.start(input),
            Step::Resume => self.poll(),
        }
        Ok(())
    }

    fn start(&mut self, input: Option<String>) {
        let handler = Arc::clone(&self.handler);
        let ctx = self.ctx.clone();
        self.future = Some(Box::pin(async move { handler.invoke(ctx, input).await }));
        self.poll();
    }

    /// Polls the orchestrator once. After it returns or requests continue-as-new
    /// the future is dropped and history is only used for bookkeeping.
    fn poll(&mut self) {
        let Some(future) = self.future.as_mut() else {
            return;
        };
        let mut cx = Context::from_waker(Waker::noop());
        if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
            self.output = Some(out);
            self.future = None;
        }
        if self.ctx.lock().continue_as_new.is_some() {
            self.future = None;
        }
    }
}

/// Matches a scheduling event in history against the action issued this pass.
fn confirm(inner: &mut CtxInner, event: &Event, task_id: u32, recorded: TaskKind) -> Result<Step, ErrorDetails> {
    let issued = inner.tasks.get(&task_id).map(|slot| slot.kind.clone());
    match (inner.pending_actions.remove(&task_id), issued) {
        (Some(_), Some(issued)) if issued == recorded => Ok(Step::Idle),
        (None, Some(issued)) if issued == recorded => Err(ErrorDetails::nondeterminism(format!(
            "task {task_id}: history records {} twice ({})",
            recorded.describe(),
            event.kind_name()
        ))),
        (_, Some(issued)) => Err(ErrorDetails::nondeterminism(format!(
            "task {task_id}: history recorded {} ({}) but the orchestrator issued {}",
            recorded.describe(),
            event.kind_name(),
            issued.describe()
        ))),
        (_, None) => Err(ErrorDetails::nondeterminism(format!(
            "task {task_id}: history recorded {} ({}) but the orchestrator issued nothing with that id",
            recorded.describe(),
            event.kind_name()
        ))),
    }
}

/// Applies a completion event to its task. A second completion for a task that
/// is already terminal is ignored.
fn complete(
    inner: &mut CtxInner,
    event: &Event,
    task_id: u32,
    kind_matches: fn(&TaskKind) -> bool,
    state: TaskState,
) -> Result<Step, ErrorDetails> {
    let Some(slot) = inner.tasks.get(&task_id) else {
        return Err(ErrorDetails::nondeterminism(format!(
            "{} for task {task_id}, which the orchestrator never scheduled",
            event.kind_name()
        )));
    };
    if !kind_matches(&slot.kind) {
        return Err(ErrorDetails::nondeterminism(format!(
            "{} for task {task_id}, which is a {}",
            event.kind_name(),
            slot.kind.describe()
        )));
    }
    if !slot.state.is_pending() {
        warn!(
            target: "durabletask::runtime::replay",
            instance_id = %inner.instance_id,
            task_id,
            event = event.kind_name(),
            "ignoring duplicate completion"
        );
        return Ok(Step::Idle);
    }
    if inner.pending_actions.contains_key(&task_id) {
        return Err(ErrorDetails::nondeterminism(format!(
            "{} for task {task_id} arrived before the task was scheduled",
            event.kind_name()
        )));
    }
    inner.resolve(task_id, state);
    Ok(Step::Resume)
}
