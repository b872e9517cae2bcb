use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use shardgate_pg::{InterruptReason, Interrupted, PgLifecycle, PlacementGroupView};
use shardgate_types::{Epoch, ObjectId, ObjectVersion, PgId};

use crate::config::RecoveryConfig;
use crate::error::RecoveryResult;
use crate::protocol::RecoveryProtocol;
use crate::registry::{Completion, RecoveryRegistry, SessionInfo};
use crate::scheduler::{OperationId, OperationScheduler};
use crate::task::{RecoveryTask, TaskOutcome};

// ---------------------------------------------------------------------------
// Commands and links
// ---------------------------------------------------------------------------

pub(crate) enum BackendCommand {
    /// Wait for `soid` to be recovered to `version`, starting a recovery if
    /// none is in flight.
    Ensure {
        soid: ObjectId,
        version: ObjectVersion,
        epoch: Epoch,
        completion: Completion,
    },
    /// A recovery task reached a terminal state.
    TaskFinished {
        soid: ObjectId,
        operation: OperationId,
        outcome: TaskOutcome,
    },
    Snapshot {
        reply: oneshot::Sender<BackendSnapshot>,
    },
}

/// Weak route from a recovery task back to the backend that started it.
///
/// Does not keep the backend (and so the registry) alive.
#[derive(Clone)]
pub(crate) struct BackendLink {
    tx: mpsc::WeakSender<BackendCommand>,
}

impl BackendLink {
    pub(crate) fn new(tx: mpsc::WeakSender<BackendCommand>) -> Self {
        Self { tx }
    }

    pub(crate) async fn finish(&self, soid: ObjectId, operation: OperationId, outcome: TaskOutcome) {
        let Some(tx) = self.tx.upgrade() else {
            debug!(%soid, op = %operation, "backend gone; dropping task outcome");
            return;
        };
        let cmd = BackendCommand::TaskFinished {
            soid,
            operation,
            outcome,
        };
        if tx.send(cmd).await.is_err() {
            debug!(op = %operation, "backend stopped before task outcome was delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Stats and snapshots
// ---------------------------------------------------------------------------

/// Counters kept by a recovery backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub sessions_created: u64,
    pub waiters_attached: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Task outcomes that arrived for a session that no longer exists.
    pub stale_completions: u64,
    /// Requests rejected because they were made under an older epoch.
    pub stale_requests: u64,
}

/// Point-in-time view of a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub pgid: PgId,
    pub epoch: Epoch,
    pub sessions: Vec<SessionInfo>,
    pub stats: RecoveryStats,
}

impl BackendSnapshot {
    pub fn session(&self, soid: &ObjectId) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| &s.soid == soid)
    }
}

// ---------------------------------------------------------------------------
// RecoveryBackend (handle)
// ---------------------------------------------------------------------------

/// Handle to a placement group's recovery backend.
///
/// The backend is a single task that exclusively owns the group's
/// [`RecoveryRegistry`]; every registry mutation arrives as a message and is
/// applied without suspending. Clones share the same backend. It stops once
/// the group is torn down or every handle has been dropped.
#[derive(Clone)]
pub struct RecoveryBackend {
    pgid: PgId,
    tx: mpsc::Sender<BackendCommand>,
}

impl RecoveryBackend {
    /// Start the backend for `view`. Must be called within a tokio runtime.
    pub fn spawn(
        view: Arc<dyn PlacementGroupView>,
        scheduler: OperationScheduler,
        protocol: Arc<dyn RecoveryProtocol>,
        config: RecoveryConfig,
    ) -> RecoveryResult<Self> {
        config.validate()?;
        let pgid = view.pgid();
        let (tx, rx) = mpsc::channel(config.command_queue_depth);
        let lifecycle = view.lifecycle();
        let epoch = lifecycle.borrow().epoch;

        let actor = BackendActor {
            pgid,
            epoch,
            lifecycle,
            view,
            scheduler,
            protocol,
            config,
            registry: RecoveryRegistry::new(),
            stats: RecoveryStats::default(),
            link: BackendLink::new(tx.downgrade()),
        };
        let span = info_span!("pg", pgid = %pgid);
        tokio::spawn(actor.run(rx).instrument(span));

        Ok(Self { pgid, tx })
    }

    pub fn pgid(&self) -> PgId {
        self.pgid
    }

    /// Ask for `soid` to be recovered to `version` under `epoch`.
    ///
    /// Suspends only while the command queue is full. The returned receiver
    /// resolves exactly once; a closed receiver means the backend stopped.
    pub async fn request_recovery(
        &self,
        soid: ObjectId,
        version: ObjectVersion,
        epoch: Epoch,
    ) -> Result<oneshot::Receiver<Result<(), Interrupted>>, Interrupted> {
        let (completion, waiter) = oneshot::channel();
        let cmd = BackendCommand::Ensure {
            soid,
            version,
            epoch,
            completion,
        };
        self.tx.send(cmd).await.map_err(|_| self.unavailable())?;
        Ok(waiter)
    }

    /// Current sessions and counters.
    pub async fn snapshot(&self) -> Result<BackendSnapshot, Interrupted> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BackendCommand::Snapshot { reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Returns `true` once the backend task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn unavailable(&self) -> Interrupted {
        Interrupted::new(self.pgid, InterruptReason::BackendUnavailable)
    }

    /// Deliver a task outcome as if a recovery task had reported it.
    #[cfg(test)]
    pub(crate) async fn report_outcome(&self, soid: ObjectId, operation: OperationId, outcome: TaskOutcome) {
        let cmd = BackendCommand::TaskFinished {
            soid,
            operation,
            outcome,
        };
        let _ = self.tx.send(cmd).await;
    }
}

// ---------------------------------------------------------------------------
// BackendActor
// ---------------------------------------------------------------------------

struct BackendActor {
    pgid: PgId,
    epoch: Epoch,
    lifecycle: watch::Receiver<PgLifecycle>,
    view: Arc<dyn PlacementGroupView>,
    scheduler: OperationScheduler,
    protocol: Arc<dyn RecoveryProtocol>,
    config: RecoveryConfig,
    registry: RecoveryRegistry,
    stats: RecoveryStats,
    link: BackendLink,
}

impl BackendActor {
    async fn run(mut self, mut rx: mpsc::Receiver<BackendCommand>) {
        debug!(epoch = %self.epoch, "recovery backend started");
        let reason = loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(reason) = self.sync_lifecycle() {
                            self.reject(cmd, &reason);
                            break reason;
                        }
                        self.handle(cmd);
                    }
                    None => break InterruptReason::BackendUnavailable,
                },
                changed = self.lifecycle.changed() => {
                    if changed.is_err() {
                        break InterruptReason::PgTornDown;
                    }
                    if let Err(reason) = self.sync_lifecycle() {
                        break reason;
                    }
                }
            }
        };
        self.shut_down(rx, reason).await;
    }

    /// Catch up with the published lifecycle before touching the registry,
    /// so that no request is ever attached to a session from an older epoch.
    fn sync_lifecycle(&mut self) -> Result<(), InterruptReason> {
        let state = *self.lifecycle.borrow_and_update();
        if !state.active {
            return Err(InterruptReason::PgTornDown);
        }
        if state.epoch != self.epoch {
            self.on_new_epoch(state.epoch);
        }
        Ok(())
    }

    fn on_new_epoch(&mut self, current: Epoch) {
        let pgid = self.pgid;
        let (sessions, waiters) = self.registry.interrupt_all(|session| {
            Interrupted::new(
                pgid,
                InterruptReason::EpochChanged {
                    bound: session.epoch(),
                    current,
                },
            )
        });
        self.stats.cancelled += sessions as u64;
        info!(from = %self.epoch, to = %current, sessions, waiters, "epoch changed; interrupted recoveries");
        self.epoch = current;
    }

    fn handle(&mut self, cmd: BackendCommand) {
        match cmd {
            BackendCommand::Ensure {
                soid,
                version,
                epoch,
                completion,
            } => self.ensure(soid, version, epoch, completion),
            BackendCommand::TaskFinished {
                soid,
                operation,
                outcome,
            } => self.task_finished(soid, operation, outcome),
            BackendCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn ensure(&mut self, soid: ObjectId, version: ObjectVersion, epoch: Epoch, completion: Completion) {
        if epoch != self.epoch {
            self.stats.stale_requests += 1;
            debug!(%soid, request_epoch = %epoch, "rejecting request from stale epoch");
            let _ = completion.send(Err(Interrupted::new(
                self.pgid,
                InterruptReason::EpochChanged {
                    bound: epoch,
                    current: self.epoch,
                },
            )));
            return;
        }

        self.stats.waiters_attached += 1;
        if let Some(session) = self.registry.get_session_mut(&soid) {
            let waiter = session.attach_waiter(completion);
            debug!(%soid, op = %session.operation_id(), %waiter, "joined in-flight recovery");
            return;
        }

        let task = RecoveryTask::new(
            soid.clone(),
            version,
            epoch,
            Arc::clone(&self.view),
            Arc::clone(&self.protocol),
            self.config.recovery_timeout(),
            self.link.clone(),
        );
        let (handle, _) = self.scheduler.start_operation(task);
        let slot = self.registry.create_session(soid.clone(), version, epoch, handle);
        if slot.is_created() {
            self.stats.sessions_created += 1;
        }
        let session = slot.into_session();
        session.attach_waiter(completion);
        debug!(%soid, %version, op = %session.operation_id(), "started urgent recovery");
    }

    fn task_finished(&mut self, soid: ObjectId, operation: OperationId, outcome: TaskOutcome) {
        let owned = self
            .registry
            .get_session(&soid)
            .is_some_and(|s| s.operation_id() == operation);
        if !owned {
            self.stats.stale_completions += 1;
            debug!(%soid, op = %operation, "discarding outcome of retired recovery");
            return;
        }

        match &outcome {
            TaskOutcome::Completed { .. } => self.stats.completed += 1,
            TaskOutcome::Cancelled { .. } => self.stats.cancelled += 1,
            TaskOutcome::Failed { .. } => self.stats.failed += 1,
        }
        let resolved = self
            .registry
            .complete_session(&soid, outcome.into_result(self.pgid));
        debug!(%soid, op = %operation, resolved, "recovery session closed");
    }

    fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            pgid: self.pgid,
            epoch: self.epoch,
            sessions: self.registry.snapshot(),
            stats: self.stats.clone(),
        }
    }

    fn reject(&mut self, cmd: BackendCommand, reason: &InterruptReason) {
        match cmd {
            BackendCommand::Ensure { completion, .. } => {
                let _ = completion.send(Err(Interrupted::new(self.pgid, reason.clone())));
            }
            BackendCommand::TaskFinished { .. } => self.stats.stale_completions += 1,
            BackendCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Interrupt everything still registered, then refuse whatever is left
    /// in the queue.
    async fn shut_down(mut self, mut rx: mpsc::Receiver<BackendCommand>, reason: InterruptReason) {
        let pgid = self.pgid;
        let (sessions, waiters) = self
            .registry
            .interrupt_all(|_| Interrupted::new(pgid, reason.clone()));
        self.stats.cancelled += sessions as u64;
        if sessions > 0 {
            warn!(sessions, waiters, %reason, "recovery backend stopping with sessions in flight");
        }

        rx.close();
        while let Some(cmd) = rx.recv().await {
            self.reject(cmd, &reason);
        }
        info!(%reason, "recovery backend stopped");
    }
}
