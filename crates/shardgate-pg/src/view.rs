use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use shardgate_types::{Epoch, ObjectId, ObjectVersion, PgId};

/// Published incarnation state of a placement group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLifecycle {
    /// Current membership epoch.
    pub epoch: Epoch,
    /// `false` once the group has been torn down on this node.
    pub active: bool,
}

impl PgLifecycle {
    pub const fn active(epoch: Epoch) -> Self {
        Self {
            epoch,
            active: true,
        }
    }
}

/// Read-only view of a placement group's object state.
///
/// Implemented by whatever owns peering and the object store. The recovery
/// core only ever queries it; it never drives peering or epoch advancement.
pub trait PlacementGroupView: Send + Sync {
    /// Identifier of the group.
    fn pgid(&self) -> PgId;

    /// Returns the version to recover to if the object is missing locally.
    fn is_unreadable_object(&self, soid: &ObjectId) -> Option<ObjectVersion>;

    /// Returns `true` if the object is degraded on some replica or sits in
    /// a range that is still being backfilled.
    fn is_degraded_or_backfilling_object(&self, soid: &ObjectId) -> bool;

    /// The current membership epoch.
    fn current_epoch(&self) -> Epoch;

    /// Subscribe to lifecycle changes (epoch advance, teardown).
    fn lifecycle(&self) -> watch::Receiver<PgLifecycle>;
}
