//! Replay engine tests
//!
//! Each test builds a history by hand, runs one replay pass and checks the
//! resulting `TurnResult` and action batch. No task hub or worker involved.

mod helpers;

mod fresh_execution;
mod history_corruption;
mod is_replaying;
mod replay_with_completions;
