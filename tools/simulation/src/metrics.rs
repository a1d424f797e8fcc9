//! Counters for a simulation run
//!
//! Tracks submissions, replacements, rejections, injected legacy records and
//! observer updates, plus a histogram of submitted scores.

use serde::{Deserialize, Serialize};
use types::rating::{MAX_SCORE, MIN_SCORE};

/// Something that happened during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    RatingCreated { score: u8 },
    RatingReplaced { score: u8 },
    RatingRejected,
    MalformedInjected,
    UpdateReceived,
}

/// Score histogram bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub score: u8,
    pub count: u64,
}

/// Aggregated simulation counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMetrics {
    pub ratings_created: u64,
    pub ratings_replaced: u64,
    pub ratings_rejected: u64,
    pub malformed_injected: u64,
    pub updates_received: u64,
    pub score_buckets: Vec<ScoreBucket>,
}

impl SimMetrics {
    /// Create empty metrics with one bucket per valid score.
    pub fn new() -> Self {
        Self {
            ratings_created: 0,
            ratings_replaced: 0,
            ratings_rejected: 0,
            malformed_injected: 0,
            updates_received: 0,
            score_buckets: (MIN_SCORE..=MAX_SCORE)
                .filter_map(|score| u8::try_from(score).ok())
                .map(|score| ScoreBucket { score, count: 0 })
                .collect(),
        }
    }

    /// Record a single event.
    pub fn record_event(&mut self, event: &SimEvent) {
        match *event {
            SimEvent::RatingCreated { score } => {
                self.ratings_created += 1;
                self.record_score(score);
            }
            SimEvent::RatingReplaced { score } => {
                self.ratings_replaced += 1;
                self.record_score(score);
            }
            SimEvent::RatingRejected => self.ratings_rejected += 1,
            SimEvent::MalformedInjected => self.malformed_injected += 1,
            SimEvent::UpdateReceived => self.updates_received += 1,
        }
    }

    fn record_score(&mut self, score: u8) {
        if let Some(bucket) = self.score_buckets.iter_mut().find(|b| b.score == score) {
            bucket.count += 1;
        }
    }

    /// Submissions that reached the store.
    pub fn submissions(&self) -> u64 {
        self.ratings_created + self.ratings_replaced
    }

    /// Mean of every submitted score, replaced ones included.
    pub fn submitted_mean(&self) -> Option<f64> {
        let total: u64 = self.score_buckets.iter().map(|b| b.count).sum();
        if total == 0 {
            return None;
        }
        let sum: u64 = self
            .score_buckets
            .iter()
            .map(|b| u64::from(b.score) * b.count)
            .sum();
        Some(sum as f64 / total as f64)
    }

    /// Build a summary string.
    pub fn summary(&self) -> String {
        format!(
            "Created: {} | Replaced: {} | Rejected: {} | Malformed: {} | Updates: {}",
            self.ratings_created,
            self.ratings_replaced,
            self.ratings_rejected,
            self.malformed_injected,
            self.updates_received,
        )
    }
}

impl Default for SimMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = SimMetrics::new();
        assert_eq!(metrics.submissions(), 0);
        assert_eq!(metrics.score_buckets.len(), 5);
        assert_eq!(metrics.submitted_mean(), None);
    }

    #[test]
    fn test_record_submissions() {
        let mut metrics = SimMetrics::new();
        metrics.record_event(&SimEvent::RatingCreated { score: 2 });
        metrics.record_event(&SimEvent::RatingReplaced { score: 4 });
        metrics.record_event(&SimEvent::RatingRejected);

        assert_eq!(metrics.submissions(), 2);
        assert_eq!(metrics.ratings_rejected, 1);
        assert_eq!(metrics.score_buckets[1].count, 1);
        assert_eq!(metrics.score_buckets[3].count, 1);
        assert_eq!(metrics.submitted_mean(), Some(3.0));
    }

    #[test]
    fn test_summary() {
        let mut metrics = SimMetrics::new();
        metrics.record_event(&SimEvent::UpdateReceived);
        let summary = metrics.summary();
        assert!(summary.contains("Created: 0"));
        assert!(summary.contains("Updates: 1"));
    }
}
