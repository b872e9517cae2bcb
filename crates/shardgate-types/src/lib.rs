//! Foundation types for shardgate.
//!
//! This crate provides the identity and ordering primitives shared by the
//! placement-group view and the recovery core. Every other shardgate crate
//! depends on `shardgate-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: Identity of a logical object within one placement group
//! - [`Epoch`]: Placement-group membership incarnation counter
//! - [`ObjectVersion`]: `(epoch, counter)` pair naming a known-good object version
//! - [`PgId`]: Placement-group identifier (pool + seed)

pub mod error;
pub mod object;
pub mod pg;
pub mod version;

pub use error::TypeError;
pub use object::ObjectId;
pub use pg::PgId;
pub use version::{Epoch, ObjectVersion};
