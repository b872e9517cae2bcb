use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use shardgate_types::{Epoch, ObjectId, ObjectVersion, PgId};

use crate::view::{PgLifecycle, PlacementGroupView};

/// Health of one object as seen by the local replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectHealth {
    Clean,
    /// Missing locally; readable again once recovered to at least this version.
    Unreadable(ObjectVersion),
    /// Present locally but missing on some peer.
    Degraded,
    /// Inside a range that is still being backfilled.
    Backfilling,
}

#[derive(Clone, Copy, Debug)]
struct ObjectState {
    version: ObjectVersion,
    health: ObjectHealth,
}

struct Inner {
    pgid: PgId,
    objects: RwLock<HashMap<ObjectId, ObjectState>>,
    lifecycle: watch::Sender<PgLifecycle>,
}

/// In-memory placement group.
///
/// Intended for tests and the simulator. Object health is held behind a
/// `RwLock`; the lifecycle is published on a watch channel so that every
/// bound [`InterruptCondition`](crate::InterruptCondition) observes epoch
/// changes and teardown. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryPlacementGroup {
    inner: Arc<Inner>,
}

impl InMemoryPlacementGroup {
    /// Create an active group at the given epoch with no objects.
    pub fn new(pgid: PgId, epoch: Epoch) -> Self {
        let (lifecycle, _) = watch::channel(PgLifecycle::active(epoch));
        Self {
            inner: Arc::new(Inner {
                pgid,
                objects: RwLock::new(HashMap::new()),
                lifecycle,
            }),
        }
    }

    /// Record a healthy object at `version`.
    pub fn mark_clean(&self, soid: &ObjectId, version: ObjectVersion) {
        self.set(soid, version, ObjectHealth::Clean);
    }

    /// Mark an object missing locally; it must be recovered to `version`.
    pub fn mark_unreadable(&self, soid: &ObjectId, version: ObjectVersion) {
        let current = self.version_of(soid).unwrap_or_default();
        self.set(soid, current, ObjectHealth::Unreadable(version));
    }

    pub fn mark_degraded(&self, soid: &ObjectId) {
        let current = self.version_of(soid).unwrap_or_default();
        self.set(soid, current, ObjectHealth::Degraded);
    }

    pub fn mark_backfilling(&self, soid: &ObjectId) {
        let current = self.version_of(soid).unwrap_or_default();
        self.set(soid, current, ObjectHealth::Backfilling);
    }

    /// Health of an object. Unknown objects are clean.
    pub fn health_of(&self, soid: &ObjectId) -> ObjectHealth {
        self.inner
            .objects
            .read()
            .expect("lock poisoned")
            .get(soid)
            .map(|s| s.health)
            .unwrap_or(ObjectHealth::Clean)
    }

    /// Locally held version of an object, if known.
    pub fn version_of(&self, soid: &ObjectId) -> Option<ObjectVersion> {
        self.inner
            .objects
            .read()
            .expect("lock poisoned")
            .get(soid)
            .map(|s| s.version)
    }

    /// Objects that currently need recovery, sorted by name.
    pub fn unhealthy_objects(&self) -> Vec<ObjectId> {
        let map = self.inner.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map
            .iter()
            .filter(|(_, s)| s.health != ObjectHealth::Clean)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Move the group to the next epoch and return it.
    ///
    /// Epochs saturate at `u32::MAX`. Once there, nothing is published and
    /// bound conditions stay valid; the returned epoch is unchanged.
    pub fn advance_epoch(&self) -> Epoch {
        let mut next = Epoch::default();
        let advanced = self.inner.lifecycle.send_if_modified(|state| {
            next = state.epoch.next();
            if next == state.epoch {
                return false;
            }
            state.epoch = next;
            true
        });
        if advanced {
            debug!(pgid = %self.inner.pgid, epoch = %next, "epoch advanced");
        } else {
            warn!(pgid = %self.inner.pgid, epoch = %next, "epoch exhausted; not advanced");
        }
        next
    }

    /// Tear the group down on this node.
    pub fn tear_down(&self) {
        self.inner.lifecycle.send_modify(|state| state.active = false);
        debug!(pgid = %self.inner.pgid, "placement group torn down");
    }

    pub fn is_active(&self) -> bool {
        self.inner.lifecycle.borrow().active
    }

    fn set(&self, soid: &ObjectId, version: ObjectVersion, health: ObjectHealth) {
        self.inner
            .objects
            .write()
            .expect("lock poisoned")
            .insert(soid.clone(), ObjectState { version, health });
    }
}

impl PlacementGroupView for InMemoryPlacementGroup {
    fn pgid(&self) -> PgId {
        self.inner.pgid
    }

    fn is_unreadable_object(&self, soid: &ObjectId) -> Option<ObjectVersion> {
        match self.health_of(soid) {
            ObjectHealth::Unreadable(version) => Some(version),
            _ => None,
        }
    }

    fn is_degraded_or_backfilling_object(&self, soid: &ObjectId) -> bool {
        matches!(
            self.health_of(soid),
            ObjectHealth::Degraded | ObjectHealth::Backfilling
        )
    }

    fn current_epoch(&self) -> Epoch {
        self.inner.lifecycle.borrow().epoch
    }

    fn lifecycle(&self) -> watch::Receiver<PgLifecycle> {
        self.inner.lifecycle.subscribe()
    }
}
