//! Aggregate snapshot types
//!
//! The read model handed to UI consumers: derived statistics for one subject
//! plus the state of the feed that produced them. Data and failure travel
//! through the same `AggregateState` so consumers inspect exactly one value.

use serde::{Deserialize, Serialize};

use crate::ids::SubjectId;

/// A mean score, or the explicit absence of one.
///
/// Carries full floating-point precision; rounding is a presentation concern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Mean {
    /// No samples to average.
    NoData,
    Value(f64),
}

impl Mean {
    /// Mean of `sum` over `count` samples.
    pub fn from_sum(sum: f64, count: usize) -> Self {
        if count == 0 {
            Mean::NoData
        } else {
            Mean::Value(sum / count as f64)
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Mean::NoData => None,
            Mean::Value(v) => Some(*v),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Mean::NoData)
    }
}

/// Derived statistics for one subject, recomputed from scratch on every push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub subject_id: SubjectId,
    /// Records in the all-time set.
    pub sample_count: usize,
    pub mean_score: Mean,
    /// Records inside the trailing window.
    pub windowed_sample_count: usize,
    pub windowed_mean_score: Mean,
    /// Unix nanoseconds at which the snapshot was computed.
    pub computed_at: i64,
}

impl AggregateSnapshot {
    /// A snapshot with no samples.
    pub fn empty(subject_id: SubjectId, computed_at: i64) -> Self {
        Self {
            subject_id,
            sample_count: 0,
            mean_score: Mean::NoData,
            windowed_sample_count: 0,
            windowed_mean_score: Mean::NoData,
            computed_at,
        }
    }
}

/// State of an observed subject as seen by UI code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AggregateState {
    /// Feeds are open but have not delivered yet.
    Loading,
    /// Current statistics.
    Ready(AggregateSnapshot),
    /// The caller's identity may not read this subject.
    AccessDenied,
    /// The feed failed; no further updates will follow.
    Error { reason: String },
}

impl AggregateState {
    /// Whether no further updates can follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AggregateState::AccessDenied | AggregateState::Error { .. })
    }

    pub fn snapshot(&self) -> Option<&AggregateSnapshot> {
        match self {
            AggregateState::Ready(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            AggregateState::Loading => "loading",
            AggregateState::Ready(_) => "ready",
            AggregateState::AccessDenied => "access_denied",
            AggregateState::Error { .. } => "error",
        }
    }
}
