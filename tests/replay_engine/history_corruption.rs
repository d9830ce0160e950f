//! Malformed histories.

use super::helpers::*;
use durabletask::EventKind;

/// No ExecutionStarted anywhere: nothing to run.
#[test]
fn missing_execution_started() {
    let mut engine = create_engine(vec![orchestrator_started(1, t0())], vec![]);
    let result = execute(&mut engine, ImmediateHandler::ok("1"));

    let message = assert_nondeterminism(&result);
    assert!(message.contains("ExecutionStarted"), "{message}");
}

/// Two ExecutionStarted events in one execution. The orchestrator is never
/// started, so only the failing terminal action comes out.
#[test]
fn duplicate_execution_started() {
    let mut engine = create_engine(started("null"), vec![execution_started(3, "null")]);
    let result = execute(&mut engine, SingleTimerHandler::new(1));

    let message = assert_nondeterminism(&result);
    assert!(message.contains("2 ExecutionStarted events"), "{message}");
    assert_eq!(engine.pending_actions().len(), 1);
    assert!(matches!(terminal_outcome(&engine), Some(Err(_))));
}

/// An execution that already continued as new is not replayed again.
#[test]
fn history_ending_in_continue_as_new_is_inert() {
    let mut past = started("1");
    past.push(event(3, EventKind::ContinueAsNewRequested { input: Some("2".into()) }));
    let mut engine = create_engine(past, vec![]);
    let result = execute(&mut engine, ImmediateHandler::ok("1"));

    assert_continue(&result);
    assert!(engine.pending_actions().is_empty());
}

/// Empty history is the same as a missing start.
#[test]
fn empty_history() {
    let mut engine = create_engine(vec![], vec![]);
    let result = execute(&mut engine, ImmediateHandler::ok("1"));

    assert_nondeterminism(&result);
}
