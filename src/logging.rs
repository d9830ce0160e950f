//! Replay-aware logging for orchestrator code.
//!
//! A replay pass re-executes everything the orchestrator already did, so plain
//! `tracing` calls inside an orchestrator repeat on every pass. These macros
//! only emit while the engine is processing new events.
//!
//! ```rust,no_run
//! # async fn body(ctx: durabletask::OrchestrationContext) {
//! durabletask::durable_info!(ctx, order = 42, "charging card");
//! # }
//! ```

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            $crate::__tracing::info!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            $crate::__tracing::warn!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            $crate::__tracing::error!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            $crate::__tracing::debug!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
