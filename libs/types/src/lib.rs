//! Types library for the PulseNoHo live venue feed
//!
//! Core type definitions shared by the feed service and tooling.
//!
//! # Modules
//! - `ids`: Identifiers (SubjectId, UserId, RecordId)
//! - `rating`: Rating records and validated scores
//! - `snapshot`: Aggregate snapshots and feed states
//! - `errors`: Error taxonomy

pub mod ids;
pub mod rating;
pub mod snapshot;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::rating::*;
    pub use crate::snapshot::*;
    pub use crate::errors::*;
}
