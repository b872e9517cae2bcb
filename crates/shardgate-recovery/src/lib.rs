//! Recovery gate for shardgate.
//!
//! Before a client operation may touch an object, the object's replica must
//! not be missing, degraded, or mid-backfill. [`ensure_recovered`] is the
//! single entry point that guarantees this. It returns immediately for clean
//! objects; otherwise it joins (or starts) exactly one recovery per object and
//! waits for it, bound to the placement group's current epoch.
//!
//! # Pieces
//!
//! - [`RecoveryRegistry`]: per-group table of in-flight [`RecoverySession`]s,
//!   owned by one [`RecoveryBackend`] task and never shared
//! - [`RecoveryTask`]: one urgent recovery, run by the [`OperationScheduler`]
//!   on top of a [`RecoveryProtocol`]
//! - [`PlacementGroup`]: view + backend, what request handling holds
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardgate_pg::InMemoryPlacementGroup;
//! use shardgate_recovery::{
//!     OperationScheduler, PlacementGroup, RecoveryConfig, SimulatedRecoveryProtocol,
//! };
//! use shardgate_types::{Epoch, ObjectId, PgId};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let state = InMemoryPlacementGroup::new(PgId::new(1, 0), Epoch(5));
//! let soid = ObjectId::new("obj-1")?;
//! state.mark_degraded(&soid);
//!
//! let protocol = Arc::new(SimulatedRecoveryProtocol::new(
//!     state.clone(),
//!     Duration::from_millis(1),
//!     Duration::from_millis(5),
//! ));
//! let pg = PlacementGroup::new(
//!     Arc::new(state),
//!     OperationScheduler::new(),
//!     protocol,
//!     RecoveryConfig::default(),
//! )?;
//! pg.ensure_recovered(&soid).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod task;

// Re-exports for convenience.
pub use backend::{BackendSnapshot, RecoveryBackend, RecoveryStats};
pub use config::RecoveryConfig;
pub use error::{RecoveryError, RecoveryResult};
pub use gate::{ensure_recovered, PlacementGroup};
pub use protocol::{ProtocolError, RecoveryProtocol, SimulatedRecoveryProtocol};
pub use registry::{Completion, RecoveryRegistry, RecoverySession, SessionInfo, SessionSlot, WaiterId};
pub use scheduler::{
    InFlightOperation, Operation, OperationContext, OperationFuture, OperationHandle, OperationId,
    OperationScheduler, TaskState,
};
pub use task::{RecoveryTask, TaskOutcome};
