//! Configuration for the live feed

use serde::{Deserialize, Serialize};
use types::rating::MAX_NOTE_CHARS;

use crate::clock::NANOS_PER_HOUR;

/// How a record whose score is missing or outside `[1, 5]` is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedScorePolicy {
    /// Counted as one sample contributing 0 to the sum.
    #[default]
    CountAsZero,
    /// Left out of both the sum and the count.
    Exclude,
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Collection holding rating records.
    pub ratings_collection: String,
    /// Length of the trailing window for the windowed mean (default: 1h).
    pub window_nanos: i64,
    /// Treatment of malformed scores.
    pub malformed_policy: MalformedScorePolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ratings_collection: "ratings".to_string(),
            window_nanos: NANOS_PER_HOUR,
            malformed_policy: MalformedScorePolicy::CountAsZero,
        }
    }
}

/// Configuration for rating submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingConfig {
    /// Collection holding rating records.
    pub ratings_collection: String,
    /// Collection holding venue documents.
    pub venues_collection: String,
    /// Maximum note length in characters.
    pub max_note_chars: usize,
    /// A second rating by the same author inside this window replaces the
    /// first instead of adding a record (default: 1h).
    pub rerate_window_nanos: i64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            ratings_collection: "ratings".to_string(),
            venues_collection: "venues".to_string(),
            max_note_chars: MAX_NOTE_CHARS,
            rerate_window_nanos: NANOS_PER_HOUR,
        }
    }
}
