//! Task handles and combinators returned by [`OrchestrationContext`](crate::OrchestrationContext).
//!
//! None of these futures ever registers a waker. The replay engine polls the
//! orchestrator once after every history event that can change a task's state,
//! so readiness is decided purely by history.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::ErrorDetails;
use crate::context::{CtxInner, TaskState, lock_inner};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The activity, sub-orchestration or input encoding failed.
    #[error("{details}")]
    Failed { task_id: u32, details: ErrorDetails },
    /// One entry per failed member of a [`WhenAll`].
    #[error("{} of the awaited tasks failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<TaskError>),
    #[error("task {task_id} result could not be decoded: {message}")]
    Decode { task_id: u32, message: String },
    /// A handle created during an earlier replay pass was awaited.
    #[error("task {task_id} belongs to a replay pass that has already ended")]
    AccessViolation { task_id: u32 },
    #[error("when_any needs at least one task")]
    EmptyWhenAny,
}

impl TaskError {
    pub fn details(&self) -> Option<&ErrorDetails> {
        match self {
            TaskError::Failed { details, .. } => Some(details),
            _ => None,
        }
    }
}

impl From<TaskError> for String {
    fn from(e: TaskError) -> Self {
        e.to_string()
    }
}

fn join_errors(errors: &[TaskError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Handle to one durable operation. Cloning is cheap and every clone observes
/// the same result.
pub struct Task<T = serde_json::Value> {
    id: u32,
    inner: Arc<Mutex<CtxInner>>,
    _out: PhantomData<fn() -> T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
            _out: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl<T> Task<T> {
    pub(crate) fn new(id: u32, inner: Arc<Mutex<CtxInner>>) -> Self {
        Self {
            id,
            inner,
            _out: PhantomData,
        }
    }

    /// Sequence number assigned when the operation was created.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.snapshot(), Ok((state, _)) if !state.is_pending())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.snapshot(), Ok((TaskState::Failed(_), _)))
    }

    /// Same task, results read as raw JSON.
    pub fn untyped(&self) -> Task<serde_json::Value> {
        Task::new(self.id, Arc::clone(&self.inner))
    }

    fn snapshot(&self) -> Result<(TaskState, Option<u64>), TaskError> {
        let inner = lock_inner(&self.inner);
        if inner.closed {
            return Err(TaskError::AccessViolation { task_id: self.id });
        }
        inner
            .tasks
            .get(&self.id)
            .map(|slot| (slot.state.clone(), slot.resolved_at))
            .ok_or(TaskError::AccessViolation { task_id: self.id })
    }
}

impl<T: DeserializeOwned> Task<T> {
    fn output(&self, state: TaskState) -> Result<T, TaskError> {
        match state {
            TaskState::Completed(payload) => Json::decode(payload.as_deref()).map_err(|message| TaskError::Decode {
                task_id: self.id,
                message,
            }),
            TaskState::Failed(details) => Err(TaskError::Failed {
                task_id: self.id,
                details,
            }),
            TaskState::Pending => Err(TaskError::AccessViolation { task_id: self.id }),
        }
    }
}

impl<T: DeserializeOwned> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.snapshot() {
            Err(e) => Poll::Ready(Err(e)),
            Ok((TaskState::Pending, _)) => Poll::Pending,
            Ok((state, _)) => Poll::Ready(self.output(state)),
        }
    }
}

/// Resolves once every member is terminal: all values in input order, or the
/// failures gathered into [`TaskError::Aggregate`].
pub struct WhenAll<T> {
    tasks: Vec<Task<T>>,
}

impl<T> WhenAll<T> {
    pub(crate) fn new(tasks: Vec<Task<T>>) -> Self {
        Self { tasks }
    }
}

impl<T: DeserializeOwned> Future for WhenAll<T> {
    type Output = Result<Vec<T>, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut states = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            match task.snapshot() {
                Err(e) => return Poll::Ready(Err(e)),
                Ok((TaskState::Pending, _)) => return Poll::Pending,
                Ok((state, _)) => states.push(state),
            }
        }

        let mut values = Vec::with_capacity(states.len());
        let mut failures = Vec::new();
        for (task, state) in self.tasks.iter().zip(states) {
            match task.output(state) {
                Ok(v) => values.push(v),
                Err(e) => failures.push(e),
            }
        }
        if failures.is_empty() {
            Poll::Ready(Ok(values))
        } else {
            Poll::Ready(Err(TaskError::Aggregate(failures)))
        }
    }
}

/// Resolves to the member that reached a terminal state first in history
/// order, together with its position in the input. Failure of the winner is
/// not an error of the combinator; await the returned task to observe it.
pub struct WhenAny<T> {
    tasks: Vec<Task<T>>,
}

impl<T> WhenAny<T> {
    pub(crate) fn new(tasks: Vec<Task<T>>) -> Self {
        Self { tasks }
    }
}

impl<T> Future for WhenAny<T> {
    type Output = Result<(usize, Task<T>), TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.tasks.is_empty() {
            return Poll::Ready(Err(TaskError::EmptyWhenAny));
        }
        let mut winner: Option<(u64, usize)> = None;
        for (idx, task) in self.tasks.iter().enumerate() {
            match task.snapshot() {
                Err(e) => return Poll::Ready(Err(e)),
                Ok((_, Some(order))) if winner.is_none_or(|(best, _)| order < best) => {
                    winner = Some((order, idx));
                }
                Ok(_) => {}
            }
        }
        match winner {
            Some((_, idx)) => Poll::Ready(Ok((idx, self.tasks[idx].clone()))),
            None => Poll::Pending,
        }
    }
}

/// Returned by [`continue_as_new`](crate::OrchestrationContext::continue_as_new).
/// Never resolves; the engine ends the pass once it has been requested.
pub struct ContinueAsNewFuture<T = Option<String>> {
    _out: PhantomData<fn() -> T>,
}

impl<T> ContinueAsNewFuture<T> {
    pub(crate) fn new() -> Self {
        Self { _out: PhantomData }
    }
}

impl<T> Future for ContinueAsNewFuture<T> {
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}
