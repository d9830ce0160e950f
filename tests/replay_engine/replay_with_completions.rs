//! Replay with completions: history already holds schedules and results.

use super::helpers::*;
use durabletask::Action;

/// Add(1, 2) whose activity completed with 3 resumes past the await and
/// completes without scheduling the activity again.
///
/// Orchestration code:
/// ```ignore
/// let sum: i64 = ctx.call_activity("Add", &json!({"x": 1, "y": 2})).await?;
/// Ok(sum)
/// ```
#[test]
fn completed_activity_resumes_to_completion() {
    let input = r#"{"x":1,"y":2}"#;
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, input),
        task_scheduled(3, 0, "Add", input),
    ];
    let new = vec![orchestrator_started(4, at(30)), task_completed(5, 0, "3")];
    let mut engine = create_engine(past, new);
    let result = execute(&mut engine, AddHandler::new());

    assert_completed(&result, "3");
    assert!(!has_activity_action(&engine, "Add"));
    assert_eq!(
        engine.pending_actions(),
        &[Action::CompleteOrchestration {
            id: 1,
            outcome: Ok(Some("3".to_string())),
        }]
    );
}

/// Scheduled but not yet completed: nothing new to do.
#[test]
fn scheduled_activity_without_result_waits() {
    let input = r#"{"x":1,"y":2}"#;
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, input),
        task_scheduled(3, 0, "Add", input),
    ];
    let mut engine = create_engine(past, vec![orchestrator_started(4, at(5))]);
    let result = execute(&mut engine, AddHandler::new());

    assert_continue(&result);
    assert!(engine.pending_actions().is_empty());
}

/// A chain advances one step per completion and only emits the next call.
///
/// Orchestration code:
/// ```ignore
/// let a = ctx.call_activity("A", &input).await?;
/// let b = ctx.call_activity("B", &a).await?;
/// let c = ctx.call_activity("C", &b).await?;
/// ```
#[test]
fn chain_emits_only_the_next_step() {
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "0"),
        task_scheduled(3, 0, "A", "0"),
        task_completed(4, 0, "1"),
        task_scheduled(5, 1, "B", "1"),
    ];
    let new = vec![task_completed(6, 1, "2")];
    let mut engine = create_engine(past, new);
    let result = execute(&mut engine, ChainHandler::new(&["A", "B", "C"]));

    assert_continue(&result);
    assert_eq!(
        engine.pending_actions(),
        &[Action::ScheduleActivity {
            id: 2,
            name: "C".to_string(),
            input: Some("2".to_string()),
        }]
    );
}

/// The whole chain in history completes with the last result.
#[test]
fn full_chain_completes() {
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "0"),
        task_scheduled(3, 0, "A", "0"),
        task_completed(4, 0, "1"),
        task_scheduled(5, 1, "B", "1"),
        task_completed(6, 1, "2"),
        task_scheduled(7, 2, "C", "2"),
    ];
    let mut engine = create_engine(past, vec![task_completed(8, 2, "3")]);
    let result = execute(&mut engine, ChainHandler::new(&["A", "B", "C"]));

    assert_completed(&result, "3");
    assert!(activity_actions(&engine).is_empty());
}

/// A fired timer resumes the orchestrator.
#[test]
fn fired_timer_resumes() {
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "null"),
        timer_created(3, 0, at(10)),
    ];
    let new = vec![orchestrator_started(4, at(10)), timer_fired(5, 0, at(10))];
    let mut engine = create_engine(past, new);
    let result = execute(&mut engine, SingleTimerHandler::new(10));

    assert_completed(&result, "\"done\"");
}

/// The timer's fire time is computed from the replayed pass time, so it is
/// the same on every pass even though later passes start later.
#[test]
fn timer_fire_time_is_stable_across_passes() {
    let first = {
        let mut engine = create_engine(vec![], started("null"));
        execute(&mut engine, SingleTimerHandler::new(10));
        engine.pending_actions().to_vec()
    };
    assert_eq!(first, vec![Action::CreateTimer { id: 0, fire_at: at(10) }]);

    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "null"),
        timer_created(3, 0, at(10)),
    ];
    let mut engine = create_engine(past, vec![orchestrator_started(4, at(3))]);
    let result = execute(&mut engine, SingleTimerHandler::new(10));
    assert_continue(&result);
    assert!(engine.pending_actions().is_empty());
}

/// A second completion for the same task is ignored.
#[test]
fn duplicate_completion_is_ignored() {
    let input = r#"{"x":1,"y":2}"#;
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, input),
        task_scheduled(3, 0, "Add", input),
        task_completed(4, 0, "3"),
    ];
    let mut engine = create_engine(past, vec![task_completed(5, 0, "4")]);
    let result = execute(&mut engine, AddHandler::new());

    assert_completed(&result, "3");
}

/// Typed results decode from the JSON stored in history.
#[test]
fn typed_results_decode_from_history() {
    #[derive(serde::Deserialize)]
    struct Quote {
        symbol: String,
        price: f64,
    }

    let handler = orchestration(|ctx, _input| async move {
        let quote: Quote = ctx.call_activity("Quote", "MSFT").await?;
        Ok(Some(format!("\"{}@{}\"", quote.symbol, quote.price)))
    });
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "null"),
        task_scheduled(3, 0, "Quote", "\"MSFT\""),
    ];
    let new = vec![task_completed(4, 0, r#"{"symbol":"MSFT","price":412.5}"#)];
    let mut engine = create_engine(past, new);
    let result = execute(&mut engine, handler);

    assert_completed(&result, "\"MSFT@412.5\"");
}

/// A result that does not decode into the requested type fails the await,
/// which the orchestrator propagates as its own failure.
#[test]
fn undecodable_result_fails_the_await() {
    let handler = orchestration(|ctx, _input| async move {
        let n: i64 = ctx.call_activity("Count", &()).await?;
        Ok(Some(n.to_string()))
    });
    let past = vec![
        orchestrator_started(1, t0()),
        execution_started(2, "null"),
        task_scheduled(3, 0, "Count", "null"),
    ];
    let mut engine = create_engine(past, vec![task_completed(4, 0, "\"many\"")]);
    let result = execute(&mut engine, handler);

    let details = assert_failed(&result);
    assert!(details.display_message().contains("could not be decoded"), "{details}");
}
