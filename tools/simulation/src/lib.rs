//! Venue Rating Simulation
//!
//! Seeded simulation of raters scoring venues while an observer watches the
//! live aggregates. Used to exercise the engine end to end and to check that
//! teardown leaves no feed open.
//!
//! # Modules
//! - `raters` — Seeded rater bots
//! - `metrics` — Submission and update counters
//! - `scenario` — Scenario configuration and runner
//! - `export` — Report JSON export

pub mod export;
pub mod metrics;
pub mod raters;
pub mod scenario;

/// Crate version constant
pub const VERSION: &str = "1.0.0";
