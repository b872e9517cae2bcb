use std::sync::Arc;

use tracing::debug;

use shardgate_pg::{interruptible, InterruptCondition, Interrupted, PlacementGroupView};
use shardgate_types::{ObjectId, ObjectVersion};

use crate::backend::RecoveryBackend;
use crate::config::RecoveryConfig;
use crate::error::RecoveryResult;
use crate::protocol::RecoveryProtocol;
use crate::scheduler::OperationScheduler;

/// A placement group as seen by client-request handling: its observable
/// state plus the recovery backend that houses its session registry.
///
/// Cheap to clone; clones share the view and the backend.
#[derive(Clone)]
pub struct PlacementGroup {
    view: Arc<dyn PlacementGroupView>,
    backend: RecoveryBackend,
}

impl PlacementGroup {
    /// Wrap `view` and start its recovery backend.
    pub fn new(
        view: Arc<dyn PlacementGroupView>,
        scheduler: OperationScheduler,
        protocol: Arc<dyn RecoveryProtocol>,
        config: RecoveryConfig,
    ) -> RecoveryResult<Self> {
        let backend = RecoveryBackend::spawn(Arc::clone(&view), scheduler, protocol, config)?;
        Ok(Self { view, backend })
    }

    pub fn view(&self) -> &dyn PlacementGroupView {
        self.view.as_ref()
    }

    pub fn recovery_backend(&self) -> &RecoveryBackend {
        &self.backend
    }

    /// See [`ensure_recovered`].
    pub async fn ensure_recovered(&self, soid: &ObjectId) -> Result<(), Interrupted> {
        ensure_recovered(self, soid).await
    }
}

/// Wait until `soid` is safe to serve in `pg`.
///
/// Returns immediately for an object that is neither unreadable nor
/// degraded/backfilling. Otherwise joins the in-flight recovery for the
/// object, or starts one, and waits for it. The wait is bound to the epoch
/// current at call time: if the group moves on or is torn down before the
/// recovery finishes, the result is [`Interrupted`] and the caller must
/// retry against fresh state. A failed recovery is reported the same way.
///
/// There is no timeout unless one is configured on the backend.
pub async fn ensure_recovered(pg: &PlacementGroup, soid: &ObjectId) -> Result<(), Interrupted> {
    let view = pg.view();
    let mut cond = InterruptCondition::bind(view);
    debug!(pgid = %view.pgid(), %soid, "check for recovery");

    let unreadable = view.is_unreadable_object(soid);
    if unreadable.is_none() && !view.is_degraded_or_backfilling_object(soid) {
        return Ok(());
    }

    let version = unreadable.unwrap_or(ObjectVersion::ZERO);
    let epoch = cond.bound_epoch();
    debug!(pgid = %view.pgid(), %soid, %version, %epoch, "need to wait for recovery");

    let backend = pg.recovery_backend();
    let waiter = interruptible(
        &mut cond,
        backend.request_recovery(soid.clone(), version, epoch),
    )
    .await??;

    match interruptible(&mut cond, waiter).await? {
        Ok(outcome) => outcome,
        Err(_) => Err(backend.unavailable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SimulatedRecoveryProtocol;
    use shardgate_pg::{InMemoryPlacementGroup, InterruptReason};
    use shardgate_types::{Epoch, PgId};
    use std::time::Duration;

    fn start(pg: &InMemoryPlacementGroup) -> (PlacementGroup, OperationScheduler) {
        let scheduler = OperationScheduler::new();
        let protocol = Arc::new(SimulatedRecoveryProtocol::new(
            pg.clone(),
            Duration::from_millis(1),
            Duration::from_millis(3),
        ));
        let handle = PlacementGroup::new(
            Arc::new(pg.clone()),
            scheduler.clone(),
            protocol,
            RecoveryConfig::default(),
        )
        .unwrap();
        (handle, scheduler)
    }

    #[tokio::test]
    async fn clean_object_takes_fast_path() {
        let pg = InMemoryPlacementGroup::new(PgId::new(1, 0), Epoch(5));
        let (handle, scheduler) = start(&pg);
        let soid = ObjectId::new("clean").unwrap();

        handle.ensure_recovered(&soid).await.unwrap();
        assert_eq!(scheduler.started_count("urgent_recovery"), 0);
        assert!(handle.recovery_backend().snapshot().await.unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn degraded_object_is_recovered() {
        let pg = InMemoryPlacementGroup::new(PgId::new(1, 0), Epoch(5));
        let (handle, scheduler) = start(&pg);
        let soid = ObjectId::new("obj-1").unwrap();
        pg.mark_degraded(&soid);

        ensure_recovered(&handle, &soid).await.unwrap();
        assert!(!pg.is_degraded_or_backfilling_object(&soid));
        assert_eq!(scheduler.started_count("urgent_recovery"), 1);
    }

    #[tokio::test]
    async fn torn_down_group_interrupts_immediately() {
        let pg = InMemoryPlacementGroup::new(PgId::new(1, 0), Epoch(5));
        let (handle, _) = start(&pg);
        let soid = ObjectId::new("obj-1").unwrap();
        pg.mark_degraded(&soid);
        pg.tear_down();

        let err = handle.ensure_recovered(&soid).await.unwrap_err();
        assert_eq!(err.reason, InterruptReason::PgTornDown);
    }
}
