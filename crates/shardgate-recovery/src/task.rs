use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use shardgate_pg::{interruptible, InterruptCondition, InterruptReason, Interrupted, PlacementGroupView};
use shardgate_types::{Epoch, ObjectId, ObjectVersion, PgId};

use crate::backend::BackendLink;
use crate::protocol::RecoveryProtocol;
use crate::scheduler::{Operation, OperationContext, TaskState};

/// Terminal result of one recovery task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The object is back at (or past) the target version and healthy.
    Completed { version: ObjectVersion },
    /// The owning context went stale before recovery finished.
    Cancelled { reason: InterruptReason },
    /// The protocol could not bring the object back.
    Failed { reason: InterruptReason },
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed { .. } => TaskState::Completed,
            Self::Cancelled { .. } => TaskState::Cancelled,
            Self::Failed { .. } => TaskState::Failed,
        }
    }

    /// What waiters see. Cancelled and failed are both a retry signal.
    pub fn into_result(self, pgid: PgId) -> Result<(), Interrupted> {
        match self {
            Self::Completed { .. } => Ok(()),
            Self::Cancelled { reason } | Self::Failed { reason } => {
                Err(Interrupted::new(pgid, reason))
            }
        }
    }
}

/// Urgent recovery of a single object, started on behalf of a client
/// request that is blocked on it.
pub struct RecoveryTask {
    pgid: PgId,
    soid: ObjectId,
    version: ObjectVersion,
    epoch: Epoch,
    view: Arc<dyn PlacementGroupView>,
    protocol: Arc<dyn RecoveryProtocol>,
    timeout: Option<Duration>,
    link: BackendLink,
}

impl RecoveryTask {
    pub(crate) fn new(
        soid: ObjectId,
        version: ObjectVersion,
        epoch: Epoch,
        view: Arc<dyn PlacementGroupView>,
        protocol: Arc<dyn RecoveryProtocol>,
        timeout: Option<Duration>,
        link: BackendLink,
    ) -> Self {
        Self {
            pgid: view.pgid(),
            soid,
            version,
            epoch,
            view,
            protocol,
            timeout,
            link,
        }
    }

    async fn recover(&self) -> TaskOutcome {
        let mut cond = InterruptCondition::with_epoch(self.pgid, self.epoch, self.view.lifecycle());
        let recovery = self
            .protocol
            .recover_object(self.pgid, &self.soid, self.version);
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, recovery).await.ok(),
                None => Some(recovery.await),
            }
        };

        match interruptible(&mut cond, bounded).await {
            Err(interrupted) => TaskOutcome::Cancelled {
                reason: interrupted.reason,
            },
            Ok(None) => TaskOutcome::Failed {
                reason: InterruptReason::TimedOut,
            },
            Ok(Some(Err(e))) => TaskOutcome::Failed {
                reason: InterruptReason::RecoveryFailed {
                    detail: e.to_string(),
                },
            },
            Ok(Some(Ok(recovered))) => self.confirm(recovered),
        }
    }

    /// The protocol's word alone is not enough: the view must agree.
    fn confirm(&self, recovered: ObjectVersion) -> TaskOutcome {
        if !recovered.satisfies(&self.version) {
            return TaskOutcome::Failed {
                reason: InterruptReason::RecoveryFailed {
                    detail: format!("recovered to {recovered}, below target {}", self.version),
                },
            };
        }
        if self.view.is_unreadable_object(&self.soid).is_some()
            || self.view.is_degraded_or_backfilling_object(&self.soid)
        {
            return TaskOutcome::Failed {
                reason: InterruptReason::RecoveryFailed {
                    detail: "object still degraded after recovery".into(),
                },
            };
        }
        TaskOutcome::Completed { version: recovered }
    }
}

#[async_trait]
impl Operation for RecoveryTask {
    type Output = TaskOutcome;
    const KIND: &'static str = "urgent_recovery";

    async fn run(self, ctx: OperationContext) -> TaskOutcome {
        debug!(op = %ctx.id(), soid = %self.soid, version = %self.version, epoch = %self.epoch, "recovery running");
        let outcome = self.recover().await;
        ctx.transition(outcome.state());

        match &outcome {
            TaskOutcome::Completed { version } => {
                debug!(op = %ctx.id(), soid = %self.soid, %version, "recovery completed");
            }
            TaskOutcome::Cancelled { reason } => {
                info!(op = %ctx.id(), soid = %self.soid, %reason, "recovery cancelled");
            }
            TaskOutcome::Failed { reason } => {
                warn!(op = %ctx.id(), soid = %self.soid, %reason, "recovery failed");
            }
        }

        self.link
            .finish(self.soid.clone(), ctx.id(), outcome.clone())
            .await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCommand;
    use crate::protocol::{ProtocolError, SimulatedRecoveryProtocol};
    use crate::scheduler::OperationScheduler;
    use shardgate_pg::InMemoryPlacementGroup;
    use tokio::sync::mpsc;

    /// Protocol that reports a fixed version without touching the view.
    struct Claims(Result<ObjectVersion, ()>);

    #[async_trait]
    impl RecoveryProtocol for Claims {
        async fn recover_object(
            &self,
            _pgid: PgId,
            soid: &ObjectId,
            _version: ObjectVersion,
        ) -> Result<ObjectVersion, ProtocolError> {
            self.0
                .map_err(|_| ProtocolError::NoSourceReplica(soid.clone()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl RecoveryProtocol for Stuck {
        async fn recover_object(
            &self,
            _pgid: PgId,
            _soid: &ObjectId,
            _version: ObjectVersion,
        ) -> Result<ObjectVersion, ProtocolError> {
            std::future::pending().await
        }
    }

    fn setup() -> (InMemoryPlacementGroup, ObjectId) {
        let pg = InMemoryPlacementGroup::new(PgId::new(1, 7), Epoch(5));
        let soid = ObjectId::new("obj-1").unwrap();
        pg.mark_unreadable(&soid, ObjectVersion::new(5, 3));
        (pg, soid)
    }

    fn task(
        pg: &InMemoryPlacementGroup,
        soid: &ObjectId,
        protocol: Arc<dyn RecoveryProtocol>,
        timeout: Option<Duration>,
        link: BackendLink,
    ) -> RecoveryTask {
        RecoveryTask::new(
            soid.clone(),
            ObjectVersion::new(5, 3),
            Epoch(5),
            Arc::new(pg.clone()),
            protocol,
            timeout,
            link,
        )
    }

    #[tokio::test]
    async fn completes_and_reports_to_backend() {
        let (pg, soid) = setup();
        let (tx, mut rx) = mpsc::channel(4);
        let protocol = Arc::new(SimulatedRecoveryProtocol::new(pg.clone(), Duration::ZERO, Duration::ZERO));
        let scheduler = OperationScheduler::new();

        let (handle, fut) = scheduler.start_operation(task(&pg, &soid, protocol, None, BackendLink::new(tx.downgrade())));
        let outcome = fut.await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed { version: ObjectVersion::new(5, 3) });
        assert_eq!(handle.state(), TaskState::Completed);

        match rx.recv().await {
            Some(BackendCommand::TaskFinished { soid: got, operation, outcome: reported }) => {
                assert_eq!(got, soid);
                assert_eq!(operation, handle.id());
                assert_eq!(reported, outcome);
            }
            _ => panic!("expected a TaskFinished command"),
        }
    }

    #[tokio::test]
    async fn protocol_error_is_failed() {
        let (pg, soid) = setup();
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = OperationScheduler::new();
        let (handle, fut) = scheduler.start_operation(task(&pg, &soid, Arc::new(Claims(Err(()))), None, BackendLink::new(tx.downgrade())));
        let outcome = fut.await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { reason: InterruptReason::RecoveryFailed { .. } }));
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn short_version_is_failed() {
        let (pg, soid) = setup();
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = OperationScheduler::new();
        let claims = Claims(Ok(ObjectVersion::new(5, 2)));
        let (_, fut) = scheduler.start_operation(task(&pg, &soid, Arc::new(claims), None, BackendLink::new(tx.downgrade())));
        let outcome = fut.await.unwrap();
        match outcome {
            TaskOutcome::Failed { reason: InterruptReason::RecoveryFailed { detail } } => {
                assert!(detail.contains("below target"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn still_degraded_is_failed() {
        let (pg, soid) = setup();
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = OperationScheduler::new();
        // Claims success but leaves the view untouched.
        let claims = Claims(Ok(ObjectVersion::new(5, 3)));
        let (_, fut) = scheduler.start_operation(task(&pg, &soid, Arc::new(claims), None, BackendLink::new(tx.downgrade())));
        assert!(matches!(fut.await.unwrap(), TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn epoch_change_cancels() {
        let (pg, soid) = setup();
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = OperationScheduler::new();
        let (handle, fut) = scheduler.start_operation(task(&pg, &soid, Arc::new(Stuck), None, BackendLink::new(tx.downgrade())));
        tokio::time::sleep(Duration::from_millis(5)).await;
        pg.advance_epoch();

        let outcome = fut.await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Cancelled {
                reason: InterruptReason::EpochChanged { bound: Epoch(5), current: Epoch(6) }
            }
        );
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn timeout_is_failed() {
        let (pg, soid) = setup();
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = OperationScheduler::new();
        let (_, fut) = scheduler.start_operation(task(
            &pg,
            &soid,
            Arc::new(Stuck),
            Some(Duration::from_millis(10)),
            BackendLink::new(tx.downgrade()),
        ));
        assert_eq!(fut.await.unwrap(), TaskOutcome::Failed { reason: InterruptReason::TimedOut });
    }

    #[tokio::test]
    async fn dead_backend_is_tolerated() {
        let (pg, soid) = setup();
        let (tx, rx) = mpsc::channel(4);
        let link = BackendLink::new(tx.downgrade());
        drop(tx);
        drop(rx);
        let protocol = Arc::new(SimulatedRecoveryProtocol::new(pg.clone(), Duration::ZERO, Duration::ZERO));
        let scheduler = OperationScheduler::new();
        let (_, fut) = scheduler.start_operation(task(&pg, &soid, protocol, None, link));
        assert!(matches!(fut.await.unwrap(), TaskOutcome::Completed { .. }));
    }

    #[test]
    fn outcome_maps_to_waiter_result() {
        let pgid = PgId::new(1, 7);
        assert_eq!(TaskOutcome::Completed { version: ObjectVersion::ZERO }.into_result(pgid), Ok(()));
        let err = TaskOutcome::Failed { reason: InterruptReason::TimedOut }
            .into_result(pgid)
            .unwrap_err();
        assert!(err.is_recovery_failure());
        let err = TaskOutcome::Cancelled { reason: InterruptReason::PgTornDown }
            .into_result(pgid)
            .unwrap_err();
        assert!(!err.is_recovery_failure());
    }
}
