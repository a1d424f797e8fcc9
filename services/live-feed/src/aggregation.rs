//! Rating aggregation
//!
//! Pure recomputation of summary statistics from a complete record set.
//! Nothing is kept between calls: every push recomputes from scratch, which
//! is fine at tens of records per subject.

use types::rating::RatingRecord;
use types::snapshot::Mean;

use crate::config::MalformedScorePolicy;

/// Count and mean over one record set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: Mean,
    /// Records whose score was missing or out of range.
    pub malformed: usize,
}

/// Summarize a record set under the given malformed-score policy.
pub fn summarize<'a, I>(records: I, policy: MalformedScorePolicy) -> Summary
where
    I: IntoIterator<Item = &'a RatingRecord>,
{
    let mut sum = 0.0_f64;
    let mut count = 0usize;
    let mut malformed = 0usize;

    for record in records {
        match record.valid_score() {
            Some(score) => {
                sum += f64::from(score.value());
                count += 1;
            }
            None => {
                malformed += 1;
                if policy == MalformedScorePolicy::CountAsZero {
                    count += 1;
                }
            }
        }
    }

    Summary {
        count,
        mean: Mean::from_sum(sum, count),
        malformed,
    }
}
