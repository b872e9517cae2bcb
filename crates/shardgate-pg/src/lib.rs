//! Placement-group view and interruption for shardgate.
//!
//! The recovery core never owns placement-group state. It consumes the
//! observable part of it through [`PlacementGroupView`] and binds every wait
//! to an [`InterruptCondition`] captured from the group's lifecycle, so that
//! an epoch change or teardown resolves outstanding waits as
//! [`Interrupted`] instead of letting them resume against stale state.

pub mod interrupt;
pub mod memory;
pub mod view;

pub use interrupt::{interruptible, InterruptCondition, InterruptReason, Interrupted};
pub use memory::{InMemoryPlacementGroup, ObjectHealth};
pub use view::{PgLifecycle, PlacementGroupView};
