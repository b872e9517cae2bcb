use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Scheduler-assigned operation identifier. Monotonically increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle of a scheduled operation.
///
/// `Scheduled → Running → {Completed | Cancelled | Failed}`. Terminal states
/// are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Operation trait
// ---------------------------------------------------------------------------

/// Per-operation context handed to [`Operation::run`].
pub struct OperationContext {
    id: OperationId,
    state: Arc<watch::Sender<TaskState>>,
}

impl OperationContext {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Move to `next`. Transitions out of a terminal state are ignored.
    pub fn transition(&self, next: TaskState) {
        transition(&self.state, next);
    }
}

/// A unit of work the scheduler can run.
#[async_trait]
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    /// Short name used in in-flight dumps and logs.
    const KIND: &'static str;

    async fn run(self, ctx: OperationContext) -> Self::Output;
}

fn transition(state: &watch::Sender<TaskState>, next: TaskState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

// ---------------------------------------------------------------------------
// Handle and future
// ---------------------------------------------------------------------------

/// Query/cancel handle for a scheduled operation.
///
/// Never used to re-enter the operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    kind: &'static str,
    state: Arc<watch::Sender<TaskState>>,
    abort: AbortHandle,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Cancel the operation. No-op once it has reached a terminal state.
    pub fn cancel(&self) {
        if transition(&self.state, TaskState::Cancelled) {
            debug!(op = %self.id, kind = self.kind, "operation cancelled");
        }
        self.abort.abort();
    }
}

/// Awaitable result of a scheduled operation.
///
/// Resolves to `None` if the operation was cancelled before producing output.
/// Dropping it detaches the operation; it keeps running.
pub struct OperationFuture<T> {
    join: JoinHandle<T>,
}

impl<T> Future for OperationFuture<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(Result::ok)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Snapshot entry for an operation that has not finished yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightOperation {
    pub id: OperationId,
    pub kind: String,
    pub state: TaskState,
}

struct InFlight {
    kind: &'static str,
    state: Arc<watch::Sender<TaskState>>,
}

#[derive(Default)]
struct SchedulerInner {
    next_id: AtomicU64,
    in_flight: Mutex<BTreeMap<OperationId, InFlight>>,
    started: Mutex<HashMap<&'static str, u64>>,
}

/// Removes an operation from the in-flight table when its future finishes
/// or is aborted.
struct Retire {
    inner: Arc<SchedulerInner>,
    id: OperationId,
}

impl Drop for Retire {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(&self.id);
        }
    }
}

/// Starts operations on the tokio runtime and tracks them while in flight.
///
/// Shared by every placement group on a node; clones share state.
#[derive(Clone, Default)]
pub struct OperationScheduler {
    inner: Arc<SchedulerInner>,
}

impl OperationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `op` and return its handle plus an awaitable for its output.
    ///
    /// Must be called from within a tokio runtime. Does not suspend.
    pub fn start_operation<O: Operation>(
        &self,
        op: O,
    ) -> (OperationHandle, OperationFuture<O::Output>) {
        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (state, _) = watch::channel(TaskState::Scheduled);
        let state = Arc::new(state);

        self.inner
            .in_flight
            .lock()
            .expect("scheduler lock poisoned")
            .insert(
                id,
                InFlight {
                    kind: O::KIND,
                    state: Arc::clone(&state),
                },
            );
        *self
            .inner
            .started
            .lock()
            .expect("scheduler lock poisoned")
            .entry(O::KIND)
            .or_default() += 1;

        let ctx = OperationContext {
            id,
            state: Arc::clone(&state),
        };
        let retire = Retire {
            inner: Arc::clone(&self.inner),
            id,
        };
        let join = tokio::spawn(async move {
            let _retire = retire;
            ctx.transition(TaskState::Running);
            op.run(ctx).await
        });

        debug!(op = %id, kind = O::KIND, "operation started");
        let handle = OperationHandle {
            id,
            kind: O::KIND,
            state,
            abort: join.abort_handle(),
        };
        (handle, OperationFuture { join })
    }

    /// Total operations of `kind` started since creation.
    pub fn started_count(&self, kind: &str) -> u64 {
        self.inner
            .started
            .lock()
            .expect("scheduler lock poisoned")
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    /// Operations that have not finished yet, ordered by id.
    pub fn dump_in_flight(&self) -> Vec<InFlightOperation> {
        self.inner
            .in_flight
            .lock()
            .expect("scheduler lock poisoned")
            .iter()
            .map(|(id, op)| InFlightOperation {
                id: *id,
                kind: op.kind.to_string(),
                state: *op.state.borrow(),
            })
            .collect()
    }
}
