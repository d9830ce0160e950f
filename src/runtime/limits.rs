//! Hard limits enforced by the replay engine.

/// Maximum number of unconsumed external events carried into the next
/// execution by `continue_as_new(.., save_events = true)`.
///
/// When more are buffered the oldest are dropped and a warning is logged.
pub const MAX_CARRY_FORWARD_EVENTS: usize = 20;

/// Maximum size in bytes of the custom status attached to a completion.
///
/// A pass that ends with a larger status fails the orchestration with an
/// `Infrastructure` error instead of handing the status to the task hub.
pub const MAX_CUSTOM_STATUS_BYTES: usize = 256 * 1024;
