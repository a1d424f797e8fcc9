//! Live Feed Service
//!
//! Turns a stream of per-venue busyness ratings into live aggregate
//! statistics and keeps every open feed accountable to the signed-in user:
//! - Live aggregation over an all-time and a trailing-window feed
//! - A process-wide subscription registry for bulk teardown
//! - Identity scope that cancels all feeds on sign-out or user switch
//! - Rating submission with re-rate replacement
//! - An in-memory document store with pushed full resnapshots
//!
//! # Architecture
//!
//! ```text
//!  RatingService
//!        │ write
//! ┌──────▼───────┐
//! │DocumentStore │
//! └──┬────────┬──┘
//!    │all-time│windowed
//! ┌──▼────────▼──┐
//! │    Engine    │── on_update ──▶ UI
//! └──────┬───────┘
//!        │ handle
//! ┌──────▼───────┐
//! │   Registry   │◀── cancel_all ── Session
//! └──────────────┘
//! ```

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod engine;
mod mailbox;
pub mod memory;
pub mod presentation;
pub mod ratings;
pub mod registry;
pub mod session;
pub mod store;

pub use engine::LiveAggregationEngine;
pub use registry::{SubscriptionHandle, SubscriptionRegistry};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
