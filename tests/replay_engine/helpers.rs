//! Test helpers for replay engine tests
//!
//! Provides history builders, mock orchestrators and assertions on
//! `TurnResult` outcomes.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use durabletask::runtime::FnOrchestration;
use durabletask::runtime::replay_engine::{ReplayEngine, TurnResult};
use durabletask::{Action, ErrorDetails, Event, EventKind, OrchestrationContext, OrchestrationHandler};
use std::future::Future;
use std::sync::Arc;

// ============================================================================
// Test Constants
// ============================================================================

pub const TEST_INSTANCE: &str = "test-instance";
pub const TEST_EXECUTION_ID: &str = "1";
pub const TEST_ORCH_NAME: &str = "TestOrch";

/// Logical time of the first pass.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(secs)
}

// ============================================================================
// Event Builders
// ============================================================================

pub fn event(event_id: u64, kind: EventKind) -> Event {
    Event::new(event_id, at(event_id as i64), kind)
}

/// Create an OrchestratorStarted event whose timestamp is the pass time
pub fn orchestrator_started(event_id: u64, timestamp: DateTime<Utc>) -> Event {
    Event::new(event_id, timestamp, EventKind::OrchestratorStarted)
}

/// Create an ExecutionStarted event with JSON input
pub fn execution_started(event_id: u64, input: &str) -> Event {
    event(
        event_id,
        EventKind::ExecutionStarted {
            name: TEST_ORCH_NAME.to_string(),
            version: None,
            input: Some(input.to_string()),
            parent: None,
        },
    )
}

/// OrchestratorStarted(1) + ExecutionStarted(2), the head of every history
pub fn started(input: &str) -> Vec<Event> {
    vec![orchestrator_started(1, t0()), execution_started(2, input)]
}

pub fn task_scheduled(event_id: u64, task_id: u32, name: &str, input: &str) -> Event {
    event(
        event_id,
        EventKind::TaskScheduled {
            task_id,
            name: name.to_string(),
            input: Some(input.to_string()),
        },
    )
}

pub fn task_completed(event_id: u64, task_id: u32, result: &str) -> Event {
    event(
        event_id,
        EventKind::TaskCompleted {
            task_id,
            result: Some(result.to_string()),
        },
    )
}

pub fn task_failed(event_id: u64, task_id: u32, message: &str) -> Event {
    event(
        event_id,
        EventKind::TaskFailed {
            task_id,
            details: activity_failure(message),
        },
    )
}

pub fn timer_created(event_id: u64, task_id: u32, fire_at: DateTime<Utc>) -> Event {
    event(event_id, EventKind::TimerCreated { task_id, fire_at })
}

pub fn timer_fired(event_id: u64, task_id: u32, fire_at: DateTime<Utc>) -> Event {
    event(event_id, EventKind::TimerFired { task_id, fire_at })
}

pub fn sub_orch_created(event_id: u64, task_id: u32, name: &str, instance_id: &str, input: &str) -> Event {
    event(
        event_id,
        EventKind::SubOrchestrationCreated {
            task_id,
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            input: Some(input.to_string()),
        },
    )
}

pub fn sub_orch_completed(event_id: u64, task_id: u32, result: &str) -> Event {
    event(
        event_id,
        EventKind::SubOrchestrationCompleted {
            task_id,
            result: Some(result.to_string()),
        },
    )
}

pub fn sub_orch_failed(event_id: u64, task_id: u32, message: &str) -> Event {
    event(
        event_id,
        EventKind::SubOrchestrationFailed {
            task_id,
            details: ErrorDetails::Application {
                kind: durabletask::AppErrorKind::OrchestrationFailed,
                message: message.to_string(),
                retryable: false,
            },
        },
    )
}

pub fn event_raised(event_id: u64, name: &str, input: &str) -> Event {
    event(
        event_id,
        EventKind::EventRaised {
            name: name.to_string(),
            input: Some(input.to_string()),
        },
    )
}

pub fn activity_failure(message: &str) -> ErrorDetails {
    ErrorDetails::Application {
        kind: durabletask::AppErrorKind::ActivityFailed,
        message: message.to_string(),
        retryable: false,
    }
}

// ============================================================================
// Mock Handlers
// ============================================================================

/// Wrap a closure as an orchestration handler.
pub fn orchestration<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

/// Returns its input (or a fixed error) without any durable call.
pub struct ImmediateHandler {
    result: Result<Option<String>, String>,
}

impl ImmediateHandler {
    pub fn ok(output: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(Some(output.to_string())),
        })
    }

    pub fn err(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.to_string()),
        })
    }
}

#[async_trait]
impl OrchestrationHandler for ImmediateHandler {
    async fn invoke(&self, _ctx: OrchestrationContext, _input: Option<String>) -> Result<Option<String>, String> {
        self.result.clone()
    }
}

/// `Add(x, y)` orchestrator: one activity, returns its result.
pub struct AddHandler;

impl AddHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl OrchestrationHandler for AddHandler {
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, String> {
        let args: serde_json::Value = serde_json::from_str(input.as_deref().unwrap_or("null")).map_err(|e| e.to_string())?;
        let sum: i64 = ctx.call_activity("Add", &args).await?;
        Ok(Some(sum.to_string()))
    }
}

/// Calls the activities in order, each with the previous result as input.
pub struct ChainHandler {
    names: Vec<&'static str>,
}

impl ChainHandler {
    pub fn new(names: &[&'static str]) -> Arc<Self> {
        Arc::new(Self { names: names.to_vec() })
    }
}

#[async_trait]
impl OrchestrationHandler for ChainHandler {
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, String> {
        let mut value: serde_json::Value =
            serde_json::from_str(input.as_deref().unwrap_or("null")).map_err(|e| e.to_string())?;
        for name in &self.names {
            value = ctx.call_activity(*name, &value).await?;
        }
        Ok(Some(value.to_string()))
    }
}

/// Waits on one timer `delay_secs` after the pass time, then returns "done".
pub struct SingleTimerHandler {
    delay_secs: i64,
}

impl SingleTimerHandler {
    pub fn new(delay_secs: i64) -> Arc<Self> {
        Arc::new(Self { delay_secs })
    }
}

#[async_trait]
impl OrchestrationHandler for SingleTimerHandler {
    async fn invoke(&self, ctx: OrchestrationContext, _input: Option<String>) -> Result<Option<String>, String> {
        let fire_at = ctx.current_utc_datetime() + TimeDelta::seconds(self.delay_secs);
        ctx.create_timer(fire_at).await?;
        Ok(Some("\"done\"".to_string()))
    }
}

// ============================================================================
// Engine Helpers
// ============================================================================

pub fn create_engine(past: Vec<Event>, new: Vec<Event>) -> ReplayEngine {
    ReplayEngine::new(TEST_INSTANCE, TEST_EXECUTION_ID, past, new)
}

pub fn execute(engine: &mut ReplayEngine, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
    engine.execute_orchestration(handler)
}

// ============================================================================
// Assertions
// ============================================================================

pub fn assert_continue(result: &TurnResult) {
    assert_eq!(result, &TurnResult::Continue, "expected Continue, got {result:?}");
}

pub fn assert_completed(result: &TurnResult, expected: &str) {
    match result {
        TurnResult::Completed(Some(output)) => assert_eq!(output, expected),
        other => panic!("expected Completed({expected}), got {other:?}"),
    }
}

/// Returns the failure details for further checks.
pub fn assert_failed(result: &TurnResult) -> ErrorDetails {
    match result {
        TurnResult::Failed(details) => details.clone(),
        other => panic!("expected Failed, got {other:?}"),
    }
}

pub fn assert_nondeterminism(result: &TurnResult) -> String {
    let details = assert_failed(result);
    assert!(details.is_nondeterminism(), "expected nondeterminism, got {details:?}");
    details.display_message()
}

pub fn activity_actions(engine: &ReplayEngine) -> Vec<(u32, String)> {
    engine
        .pending_actions()
        .iter()
        .filter_map(|a| match a {
            Action::ScheduleActivity { id, name, .. } => Some((*id, name.clone())),
            _ => None,
        })
        .collect()
}

pub fn has_activity_action(engine: &ReplayEngine, name: &str) -> bool {
    activity_actions(engine).iter().any(|(_, n)| n == name)
}

pub fn terminal_outcome(engine: &ReplayEngine) -> Option<Result<Option<String>, ErrorDetails>> {
    match engine.pending_actions().last() {
        Some(Action::CompleteOrchestration { outcome, .. }) => Some(outcome.clone()),
        _ => None,
    }
}
