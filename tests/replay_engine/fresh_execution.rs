//! Fresh execution: the first pass, with only the start events in history.

use super::helpers::*;
use durabletask::Action;

/// An orchestrator that returns immediately completes in its first pass.
///
/// Orchestration code:
/// ```ignore
/// Ok(Some("\"hello\""))
/// ```
#[test]
fn immediate_return_completes() {
    let mut engine = create_engine(vec![], started("null"));
    let result = execute(&mut engine, ImmediateHandler::ok("\"hello\""));

    assert_completed(&result, "\"hello\"");
    assert_eq!(
        engine.pending_actions(),
        &[Action::CompleteOrchestration {
            id: 0,
            outcome: Ok(Some("\"hello\"".to_string())),
        }]
    );
}

/// Calling an activity with no history suspends the orchestrator and emits
/// exactly one ScheduleActivity action carrying the encoded input.
///
/// Orchestration code:
/// ```ignore
/// let sum: i64 = ctx.call_activity("Add", &json!({"x": 1, "y": 2})).await?;
/// ```
#[test]
fn first_activity_suspends_and_schedules() {
    let mut engine = create_engine(vec![], started(r#"{"x":1,"y":2}"#));
    let result = execute(&mut engine, AddHandler::new());

    assert_continue(&result);
    assert_eq!(
        engine.pending_actions(),
        &[Action::ScheduleActivity {
            id: 0,
            name: "Add".to_string(),
            input: Some(r#"{"x":1,"y":2}"#.to_string()),
        }]
    );
}

/// Actions are recorded at call time, so tasks that are never awaited still
/// produce actions, in program order.
///
/// Orchestration code:
/// ```ignore
/// let _a = ctx.call_activity::<()>("A", &1);
/// let _t = ctx.create_timer(t0 + 60s);
/// let b: i32 = ctx.call_activity("B", &2).await?;
/// ```
#[test]
fn unawaited_calls_still_produce_actions() {
    let handler = orchestration(|ctx, _input| async move {
        let _a = ctx.call_activity::<()>("A", &1);
        let _t = ctx.create_timer(ctx.current_utc_datetime() + chrono::TimeDelta::seconds(60));
        let b: i32 = ctx.call_activity("B", &2).await?;
        Ok(Some(b.to_string()))
    });
    let mut engine = create_engine(vec![], started("null"));
    let result = execute(&mut engine, handler);

    assert_continue(&result);
    let ids: Vec<u32> = engine.pending_actions().iter().map(Action::id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(activity_actions(&engine), vec![(0, "A".to_string()), (2, "B".to_string())]);
    assert!(matches!(
        engine.pending_actions()[1],
        Action::CreateTimer { fire_at, .. } if fire_at == at(60)
    ));
}

/// The terminal action takes the sequence number after the last durable call.
///
/// Orchestration code:
/// ```ignore
/// let _ = ctx.call_activity::<()>("Fire", &());
/// Ok(Some("1"))
/// ```
#[test]
fn terminal_action_follows_pending_actions() {
    let handler = orchestration(|ctx, _input| async move {
        let _ = ctx.call_activity::<()>("Fire", &());
        Ok(Some("1".to_string()))
    });
    let mut engine = create_engine(vec![], started("null"));
    let result = execute(&mut engine, handler);

    assert_completed(&result, "1");
    let actions = engine.pending_actions();
    assert_eq!(actions.len(), 2);
    assert!(matches!(&actions[0], Action::ScheduleActivity { id: 0, name, .. } if name == "Fire"));
    assert!(matches!(&actions[1], Action::CompleteOrchestration { id: 1, outcome: Ok(_) }));
}

/// Orchestrator time comes from the OrchestratorStarted event, not the wall clock.
///
/// Orchestration code:
/// ```ignore
/// Ok(Some(ctx.current_utc_datetime().timestamp().to_string()))
/// ```
#[test]
fn current_time_is_the_pass_time() {
    let handler = orchestration(|ctx, _input| async move { Ok(Some(ctx.current_utc_datetime().timestamp().to_string())) });
    let mut engine = create_engine(vec![], started("null"));
    let result = execute(&mut engine, handler);

    assert_completed(&result, &t0().timestamp().to_string());
}

/// Without an OrchestratorStarted event the ExecutionStarted timestamp is used.
#[test]
fn current_time_falls_back_to_execution_start() {
    let handler = orchestration(|ctx, _input| async move { Ok(Some(ctx.current_utc_datetime().timestamp().to_string())) });
    let mut engine = create_engine(vec![], vec![execution_started(7, "null")]);
    let result = execute(&mut engine, handler);

    assert_completed(&result, &at(7).timestamp().to_string());
}

/// Custom status set during the pass travels with the completion.
#[test]
fn custom_status_is_reported() {
    let handler = orchestration(|ctx, _input| async move {
        ctx.set_custom_status("warming up");
        let _ = ctx.call_activity::<()>("Work", &());
        Ok(None)
    });
    let mut engine = create_engine(vec![], started("null"));
    execute(&mut engine, handler);

    assert_eq!(engine.custom_status(), Some("warming up"));
    let completion = engine.into_completion();
    assert_eq!(completion.instance_id, TEST_INSTANCE);
    assert_eq!(completion.execution_id, TEST_EXECUTION_ID);
    assert_eq!(completion.custom_status.as_deref(), Some("warming up"));
}
