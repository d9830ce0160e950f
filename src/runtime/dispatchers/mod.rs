//! Background dispatch loops of a `TaskHubWorker`.
//!
//! - `orchestration`: fetch, replay and complete orchestration work items
//! - `activity`: fetch, execute and complete activity work items

mod activity;
mod orchestration;
