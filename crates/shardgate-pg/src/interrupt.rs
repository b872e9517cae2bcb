use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use shardgate_types::{Epoch, PgId};

use crate::view::{PgLifecycle, PlacementGroupView};

/// Why a wait bound to a placement-group context did not resolve with success.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum InterruptReason {
    /// The group moved to a new epoch while the caller was waiting.
    #[error("epoch changed from {bound} to {current}")]
    EpochChanged { bound: Epoch, current: Epoch },

    /// The group was torn down on this node.
    #[error("placement group torn down")]
    PgTornDown,

    /// The recovery backend for the group is gone.
    #[error("recovery backend unavailable")]
    BackendUnavailable,

    /// The recovery protocol could not bring the object back.
    #[error("recovery failed: {detail}")]
    RecoveryFailed { detail: String },

    /// The recovery protocol did not finish within the configured bound.
    #[error("recovery timed out")]
    TimedOut,
}

/// A wait on a placement-group context that must be retried against fresh
/// state.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("pg {pgid} interrupted: {reason}")]
pub struct Interrupted {
    pub pgid: PgId,
    pub reason: InterruptReason,
}

impl Interrupted {
    pub fn new(pgid: PgId, reason: InterruptReason) -> Self {
        Self { pgid, reason }
    }

    /// Returns `true` if the recovery protocol itself gave up, as opposed to
    /// the context going stale underneath the caller.
    pub fn is_recovery_failure(&self) -> bool {
        matches!(
            self.reason,
            InterruptReason::RecoveryFailed { .. } | InterruptReason::TimedOut
        )
    }
}

/// An epoch-bound validity check for one placement-group context.
///
/// Captures the epoch at bind time. The condition is violated as soon as
/// the published lifecycle shows a different epoch, the group is torn down,
/// or the publisher goes away.
#[derive(Clone, Debug)]
pub struct InterruptCondition {
    pgid: PgId,
    bound: Epoch,
    lifecycle: watch::Receiver<PgLifecycle>,
}

impl InterruptCondition {
    /// Bind to the view's current incarnation.
    pub fn bind(view: &dyn PlacementGroupView) -> Self {
        Self::from_receiver(view.pgid(), view.lifecycle())
    }

    /// Bind to whatever epoch the receiver currently holds.
    pub fn from_receiver(pgid: PgId, lifecycle: watch::Receiver<PgLifecycle>) -> Self {
        let bound = lifecycle.borrow().epoch;
        Self::with_epoch(pgid, bound, lifecycle)
    }

    /// Bind to an epoch captured earlier. Already violated if the group has
    /// moved on since.
    pub fn with_epoch(pgid: PgId, bound: Epoch, lifecycle: watch::Receiver<PgLifecycle>) -> Self {
        Self {
            pgid,
            bound,
            lifecycle,
        }
    }

    pub fn pgid(&self) -> PgId {
        self.pgid
    }

    /// The epoch this condition was bound under.
    pub fn bound_epoch(&self) -> Epoch {
        self.bound
    }

    /// Check the condition against the live lifecycle without suspending.
    pub fn check(&self) -> Result<(), Interrupted> {
        let state = *self.lifecycle.borrow();
        self.evaluate(state)
    }

    /// Resolves once the condition is violated.
    pub async fn invalidated(&mut self) -> Interrupted {
        loop {
            if let Err(interrupted) = self.check() {
                return interrupted;
            }
            if self.lifecycle.changed().await.is_err() {
                return Interrupted::new(self.pgid, InterruptReason::PgTornDown);
            }
        }
    }

    fn evaluate(&self, state: PgLifecycle) -> Result<(), Interrupted> {
        if !state.active {
            return Err(Interrupted::new(self.pgid, InterruptReason::PgTornDown));
        }
        if state.epoch != self.bound {
            return Err(Interrupted::new(
                self.pgid,
                InterruptReason::EpochChanged {
                    bound: self.bound,
                    current: state.epoch,
                },
            ));
        }
        Ok(())
    }
}

/// Race `fut` against `cond`.
///
/// The condition is checked before suspending and again on resumption, so a
/// future that completes in the same instant the epoch moves still reports
/// the interruption.
pub async fn interruptible<F>(cond: &mut InterruptCondition, fut: F) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    cond.check()?;
    let output = tokio::select! {
        biased;
        interrupted = cond.invalidated() => return Err(interrupted),
        output = fut => output,
    };
    cond.check()?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlacementGroup;
    use std::time::Duration;

    fn pg() -> InMemoryPlacementGroup {
        InMemoryPlacementGroup::new(PgId::new(1, 0x2a), Epoch(5))
    }

    #[test]
    fn bound_epoch_is_captured_at_bind() {
        let pg = pg();
        let cond = InterruptCondition::bind(&pg);
        assert_eq!(cond.bound_epoch(), Epoch(5));
        assert!(cond.check().is_ok());
    }

    #[test]
    fn check_fails_after_epoch_advance() {
        let pg = pg();
        let cond = InterruptCondition::bind(&pg);
        pg.advance_epoch();
        let err = cond.check().unwrap_err();
        assert_eq!(
            err.reason,
            InterruptReason::EpochChanged {
                bound: Epoch(5),
                current: Epoch(6)
            }
        );
        assert!(!err.is_recovery_failure());
    }

    #[test]
    fn earlier_epoch_binding_is_already_violated() {
        let pg = pg();
        pg.advance_epoch();
        let cond = InterruptCondition::with_epoch(pg.pgid(), Epoch(5), pg.lifecycle());
        assert!(cond.check().is_err());
    }

    #[test]
    fn check_fails_after_teardown() {
        let pg = pg();
        let cond = InterruptCondition::bind(&pg);
        pg.tear_down();
        assert_eq!(cond.check().unwrap_err().reason, InterruptReason::PgTornDown);
    }

    #[test]
    fn dropped_publisher_counts_as_teardown() {
        let (tx, rx) = watch::channel(PgLifecycle::active(Epoch(1)));
        let mut cond = InterruptCondition::from_receiver(PgId::new(0, 0), rx);
        drop(tx);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let interrupted = rt.block_on(cond.invalidated());
        assert_eq!(interrupted.reason, InterruptReason::PgTornDown);
    }

    #[tokio::test]
    async fn interruptible_passes_through_output() {
        let pg = pg();
        let mut cond = InterruptCondition::bind(&pg);
        let out = interruptible(&mut cond, async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn interruptible_resolves_on_epoch_change() {
        let pg = pg();
        let mut cond = InterruptCondition::bind(&pg);
        let advancer = pg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            advancer.advance_epoch();
        });
        let out = interruptible(&mut cond, std::future::pending::<()>()).await;
        assert!(matches!(
            out.unwrap_err().reason,
            InterruptReason::EpochChanged { .. }
        ));
    }

    #[tokio::test]
    async fn interruptible_refuses_stale_context_up_front() {
        let pg = pg();
        let mut cond = InterruptCondition::bind(&pg);
        pg.advance_epoch();
        let out = interruptible(&mut cond, async { 1 }).await;
        assert!(out.is_err());
    }

    #[test]
    fn recovery_failures_are_distinguishable() {
        let failed = Interrupted::new(
            PgId::new(1, 1),
            InterruptReason::RecoveryFailed {
                detail: "no source replica".into(),
            },
        );
        assert!(failed.is_recovery_failure());
        assert!(Interrupted::new(PgId::new(1, 1), InterruptReason::TimedOut).is_recovery_failure());
        assert_eq!(
            failed.to_string(),
            "pg 1.1 interrupted: recovery failed: no source replica"
        );
    }

    #[test]
    fn reason_serializes() {
        let json = serde_json::to_string(&InterruptReason::PgTornDown).unwrap();
        assert_eq!(json, "\"PgTornDown\"");
    }
}
