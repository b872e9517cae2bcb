use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use shardgate_pg::Interrupted;
use shardgate_types::{Epoch, ObjectId, ObjectVersion};

use crate::scheduler::{OperationHandle, OperationId, TaskState};

/// Completion handle held by the registry on behalf of a suspended caller.
pub type Completion = oneshot::Sender<Result<(), Interrupted>>;

/// Position of a waiter within its session, in attach order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaiterId(pub u32);

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RecoverySession
// ---------------------------------------------------------------------------

/// One in-flight recovery of one object, plus everyone waiting on it.
#[derive(Debug)]
pub struct RecoverySession {
    soid: ObjectId,
    version: ObjectVersion,
    epoch: Epoch,
    task: OperationHandle,
    waiters: Vec<(WaiterId, Completion)>,
    next_waiter: u32,
}

impl RecoverySession {
    fn new(soid: ObjectId, version: ObjectVersion, epoch: Epoch, task: OperationHandle) -> Self {
        Self {
            soid,
            version,
            epoch,
            task,
            waiters: Vec::new(),
            next_waiter: 0,
        }
    }

    /// Attach a waiter. It is resolved exactly once, when the session
    /// completes or is interrupted.
    pub fn attach_waiter(&mut self, completion: Completion) -> WaiterId {
        let id = WaiterId(self.next_waiter);
        self.next_waiter += 1;
        self.waiters.push((id, completion));
        id
    }

    pub fn soid(&self) -> &ObjectId {
        &self.soid
    }

    /// Target version of the recovery.
    pub fn version(&self) -> ObjectVersion {
        self.version
    }

    /// Epoch the session was created under.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn operation_id(&self) -> OperationId {
        self.task.id()
    }

    pub fn task_state(&self) -> TaskState {
        self.task.state()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve every waiter with `outcome`. A waiter whose caller has gone
    /// away still counts as resolved.
    fn resolve(self, outcome: Result<(), Interrupted>) -> usize {
        let count = self.waiters.len();
        for (_, completion) in self.waiters {
            let _ = completion.send(outcome.clone());
        }
        count
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            soid: self.soid.clone(),
            version: self.version,
            epoch: self.epoch,
            operation: self.task.id(),
            task_state: self.task.state(),
            waiters: self.waiters.len(),
        }
    }
}

/// Serializable view of a session for dumps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub soid: ObjectId,
    pub version: ObjectVersion,
    pub epoch: Epoch,
    pub operation: OperationId,
    pub task_state: TaskState,
    pub waiters: usize,
}

// ---------------------------------------------------------------------------
// RecoveryRegistry
// ---------------------------------------------------------------------------

/// Result of [`RecoveryRegistry::create_session`].
pub enum SessionSlot<'a> {
    Created(&'a mut RecoverySession),
    /// A session already existed; the offered task was cancelled.
    Existing(&'a mut RecoverySession),
}

impl<'a> SessionSlot<'a> {
    pub fn into_session(self) -> &'a mut RecoverySession {
        match self {
            Self::Created(s) | Self::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Per-placement-group table of in-flight recoveries, keyed by object.
///
/// At most one session exists per object. The registry is owned by exactly
/// one backend task and is never shared, so it carries no locks: a lookup
/// followed by an insert cannot be interleaved with another request.
#[derive(Debug, Default)]
pub struct RecoveryRegistry {
    sessions: HashMap<ObjectId, RecoverySession>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recovering(&self, soid: &ObjectId) -> bool {
        self.sessions.contains_key(soid)
    }

    pub fn get_session(&self, soid: &ObjectId) -> Option<&RecoverySession> {
        self.sessions.get(soid)
    }

    pub fn get_session_mut(&mut self, soid: &ObjectId) -> Option<&mut RecoverySession> {
        self.sessions.get_mut(soid)
    }

    /// Register a session for `soid` owned by `task`.
    ///
    /// If one already exists it is returned unchanged and `task` is
    /// cancelled, since nothing would ever collect its result.
    pub fn create_session(
        &mut self,
        soid: ObjectId,
        version: ObjectVersion,
        epoch: Epoch,
        task: OperationHandle,
    ) -> SessionSlot<'_> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(soid) {
            Entry::Occupied(entry) => {
                warn!(soid = %entry.key(), op = %task.id(), "session already exists; cancelling duplicate task");
                task.cancel();
                SessionSlot::Existing(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                let soid = entry.key().clone();
                SessionSlot::Created(entry.insert(RecoverySession::new(soid, version, epoch, task)))
            }
        }
    }

    /// Attach a waiter to the session for `soid`, if there is one.
    pub fn attach_waiter(&mut self, soid: &ObjectId, completion: Completion) -> Result<WaiterId, Completion> {
        match self.sessions.get_mut(soid) {
            Some(session) => Ok(session.attach_waiter(completion)),
            None => Err(completion),
        }
    }

    /// Resolve every waiter of the session for `soid` with `outcome` and
    /// remove it. Returns the number of waiters resolved.
    ///
    /// # Panics
    ///
    /// Panics if there is no session for `soid`. Completing a session twice
    /// breaks the exactly-once guarantee given to waiters.
    pub fn complete_session(&mut self, soid: &ObjectId, outcome: Result<(), Interrupted>) -> usize {
        let Some(session) = self.sessions.remove(soid) else {
            panic!("double completion of recovery session for {soid}");
        };
        session.resolve(outcome)
    }

    /// Cancel every session's task and resolve all of its waiters with the
    /// interruption produced by `reason`. Leaves the registry empty.
    ///
    /// Returns the number of sessions and waiters interrupted.
    pub fn interrupt_all<F>(&mut self, mut reason: F) -> (usize, usize)
    where
        F: FnMut(&RecoverySession) -> Interrupted,
    {
        let sessions = self.sessions.len();
        let mut waiters = 0;
        for (_, session) in self.sessions.drain() {
            session.task.cancel();
            let interrupted = reason(&session);
            waiters += session.resolve(Err(interrupted));
        }
        (sessions, waiters)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions ordered by object.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.values().map(RecoverySession::info).collect();
        infos.sort_by(|a, b| a.soid.cmp(&b.soid));
        infos
    }
}
