use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use shardgate_pg::InMemoryPlacementGroup;
use shardgate_types::{ObjectId, ObjectVersion, PgId};

/// Errors reported by a recovery protocol.
///
/// These never cross the gate: the recovery task folds them into a failed
/// outcome.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no eligible source replica for {0}")]
    NoSourceReplica(ObjectId),

    #[error("transport error: {0}")]
    Transport(String),
}

/// The data-movement protocol that brings one object back to a target
/// version (push/pull between replicas). Only startable and awaitable here.
#[async_trait]
pub trait RecoveryProtocol: Send + Sync {
    /// Recover `soid` to at least `version` and return the version now held.
    async fn recover_object(
        &self,
        pgid: PgId,
        soid: &ObjectId,
        version: ObjectVersion,
    ) -> Result<ObjectVersion, ProtocolError>;
}

/// Recovery protocol that heals objects of an [`InMemoryPlacementGroup`]
/// after a random delay.
pub struct SimulatedRecoveryProtocol {
    pg: InMemoryPlacementGroup,
    min_latency: Duration,
    max_latency: Duration,
    unrecoverable: RwLock<HashSet<ObjectId>>,
    calls: AtomicU64,
}

impl SimulatedRecoveryProtocol {
    pub fn new(pg: InMemoryPlacementGroup, min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            pg,
            min_latency,
            max_latency: max_latency.max(min_latency),
            unrecoverable: RwLock::new(HashSet::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every future recovery of `soid` fail.
    pub fn mark_unrecoverable(&self, soid: &ObjectId) {
        self.unrecoverable
            .write()
            .expect("lock poisoned")
            .insert(soid.clone());
    }

    /// Number of recoveries started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn pick_latency(&self) -> Duration {
        if self.max_latency == self.min_latency {
            return self.min_latency;
        }
        rand::thread_rng().gen_range(self.min_latency..=self.max_latency)
    }
}

#[async_trait]
impl RecoveryProtocol for SimulatedRecoveryProtocol {
    async fn recover_object(
        &self,
        _pgid: PgId,
        soid: &ObjectId,
        version: ObjectVersion,
    ) -> Result<ObjectVersion, ProtocolError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.pick_latency();
        tokio::time::sleep(latency).await;

        if self
            .unrecoverable
            .read()
            .expect("lock poisoned")
            .contains(soid)
        {
            return Err(ProtocolError::NoSourceReplica(soid.clone()));
        }

        let held = self.pg.version_of(soid).unwrap_or_default();
        let recovered = held.max(version);
        self.pg.mark_clean(soid, recovered);
        Ok(recovered)
    }
}
