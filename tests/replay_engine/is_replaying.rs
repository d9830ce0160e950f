//! is_replaying: true while the engine walks past events, false for new ones.

use super::helpers::*;
use durabletask::{OrchestrationContext, OrchestrationHandler, durable_debug, durable_info};
use std::sync::Arc;

/// Records the replay flag before and after one activity in custom status.
///
/// Orchestration code:
/// ```ignore
/// let before = ctx.is_replaying();
/// ctx.call_activity("Step", &()).await?;
/// let after = ctx.is_replaying();
/// ```
fn logging_orchestration() -> Arc<dyn OrchestrationHandler> {
    orchestration(|ctx: OrchestrationContext, _input| async move {
        let before = ctx.is_replaying();
        durable_info!(ctx, before, "starting step");
        ctx.set_custom_status(format!("{before}"));
        let _: () = ctx.call_activity("Step", &()).await?;
        let after = ctx.is_replaying();
        durable_debug!(ctx, after, "step finished");
        ctx.set_custom_status(format!("{before},{after}"));
        Ok(None)
    })
}

#[test]
fn fresh_start_is_not_replaying() {
    let mut engine = create_engine(vec![], started("null"));
    execute(&mut engine, logging_orchestration());
    assert_eq!(engine.custom_status(), Some("false"));
}

#[test]
fn replay_then_live() {
    let mut past = started("null");
    past.push(task_scheduled(3, 0, "Step", "null"));
    let mut engine = create_engine(past, vec![task_completed(4, 0, "null")]);
    execute(&mut engine, logging_orchestration());
    assert_eq!(engine.custom_status(), Some("true,false"));
}

#[test]
fn fully_replayed_history_stays_replaying() {
    let mut past = started("null");
    past.extend([task_scheduled(3, 0, "Step", "null"), task_completed(4, 0, "null")]);
    let mut engine = create_engine(past, vec![]);
    execute(&mut engine, logging_orchestration());
    assert_eq!(engine.custom_status(), Some("true,true"));
}
