use crate::{Event, EventKind};

/// Facts about an execution derived from its history.
///
/// Built once per work item so the worker and the replay engine do not rescan
/// the log for every question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryReader {
    /// From the first `ExecutionStarted`
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    /// Number of `ExecutionStarted` events seen. Anything but one is corrupt.
    pub started_count: usize,
    /// A `ContinueAsNewRequested` marker ends the execution.
    pub is_continued_as_new: bool,
}

impl HistoryReader {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut reader = Self::default();
        for event in events {
            match &event.kind {
                EventKind::ExecutionStarted { name, version, .. } => {
                    reader.started_count += 1;
                    if reader.orchestration_name.is_none() {
                        reader.orchestration_name = Some(name.clone());
                        reader.orchestration_version = version.clone();
                    }
                }
                EventKind::ContinueAsNewRequested { .. } => reader.is_continued_as_new = true,
                _ => {}
            }
        }
        reader
    }
}
