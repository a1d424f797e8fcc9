//! Rating record types
//!
//! A rating is one user's busyness score (plus an optional note) for a
//! subject at a point in time. The store does not enforce the score range,
//! so records read back from it are decoded leniently and validated here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{RatingError, StoreError};
use crate::ids::{RecordId, SubjectId, UserId};

/// Lowest accepted busyness score.
pub const MIN_SCORE: i64 = 1;
/// Highest accepted busyness score.
pub const MAX_SCORE: i64 = 5;
/// Upper bound on note length, in characters.
pub const MAX_NOTE_CHARS: usize = 280;

/// Document field names used by rating records.
pub mod fields {
    pub const SUBJECT_ID: &str = "subjectId";
    pub const AUTHOR_ID: &str = "authorId";
    pub const SCORE: &str = "score";
    pub const NOTE: &str = "note";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// A validated busyness score in `[1, 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    /// Validate a raw score.
    pub fn new(raw: i64) -> Result<Self, RatingError> {
        if (MIN_SCORE..=MAX_SCORE).contains(&raw) {
            Ok(Self(raw as u8))
        } else {
            Err(RatingError::InvalidScore(raw))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = RatingError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<Score> for i64 {
    fn from(score: Score) -> Self {
        score.0 as i64
    }
}

/// A rating record as read back from the store.
///
/// `score` is kept raw: persisted records may be missing it or carry a value
/// outside `[1, 5]`, and aggregation decides what to do with those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub id: RecordId,
    pub subject_id: SubjectId,
    pub author_id: Option<UserId>,
    pub score: Option<i64>,
    pub note: Option<String>,
    /// Unix nanoseconds; `None` while the server timestamp is pending.
    pub created_at: Option<i64>,
}

impl RatingRecord {
    /// Decode a record from its document fields.
    ///
    /// Only a missing or blank `subjectId` is an error. Every other field is
    /// decoded leniently: a non-integer score becomes `None`, a pending
    /// timestamp sentinel becomes `None`.
    pub fn from_fields(id: RecordId, fields: &Value) -> Result<Self, StoreError> {
        let subject_id = fields
            .get(fields::SUBJECT_ID)
            .and_then(Value::as_str)
            .and_then(SubjectId::try_new)
            .ok_or_else(|| StoreError::InvalidDocument {
                reason: format!("rating {} has no {}", id, fields::SUBJECT_ID),
            })?;

        Ok(Self {
            subject_id,
            author_id: fields
                .get(fields::AUTHOR_ID)
                .and_then(Value::as_str)
                .and_then(UserId::try_new),
            score: fields.get(fields::SCORE).and_then(Value::as_i64),
            note: fields
                .get(fields::NOTE)
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at: fields.get(fields::CREATED_AT).and_then(Value::as_i64),
            id,
        })
    }

    /// The score, if it satisfies the `[1, 5]` invariant.
    pub fn valid_score(&self) -> Option<Score> {
        self.score.and_then(|raw| Score::new(raw).ok())
    }

    /// Whether the record was created at or after `cutoff`.
    ///
    /// A pending timestamp belongs to a write that just happened, so it
    /// counts as recent.
    pub fn is_created_since(&self, cutoff: i64) -> bool {
        self.created_at.map_or(true, |ts| ts >= cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rid(s: &str) -> RecordId {
        RecordId::from_string(s)
    }

    #[test]
    fn test_score_bounds() {
        assert!(Score::new(0).is_err());
        assert_eq!(Score::new(1).unwrap().value(), 1);
        assert_eq!(Score::new(5).unwrap().value(), 5);
        assert_eq!(Score::new(6), Err(RatingError::InvalidScore(6)));
    }

    #[test]
    fn test_score_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<Score>("9").is_err());
        assert_eq!(serde_json::from_str::<Score>("3").unwrap().value(), 3);
    }

    #[test]
    fn test_decode_full_record() {
        let fields = json!({
            "subjectId": "the-roxy",
            "authorId": "u1",
            "score": 4,
            "note": "line out the door",
            "createdAt": 1_700_000_000_000_000_000i64,
        });
        let record = RatingRecord::from_fields(rid("r1"), &fields).unwrap();
        assert_eq!(record.subject_id.as_str(), "the-roxy");
        assert_eq!(record.author_id.as_ref().unwrap().as_str(), "u1");
        assert_eq!(record.valid_score().unwrap().value(), 4);
        assert_eq!(record.note.as_deref(), Some("line out the door"));
        assert_eq!(record.created_at, Some(1_700_000_000_000_000_000));
    }

    #[test]
    fn test_decode_malformed_score_is_kept() {
        let null_score = json!({ "subjectId": "s", "score": null });
        let record = RatingRecord::from_fields(rid("r1"), &null_score).unwrap();
        assert_eq!(record.score, None);
        assert!(record.valid_score().is_none());

        let text_score = json!({ "subjectId": "s", "score": "five" });
        let record = RatingRecord::from_fields(rid("r2"), &text_score).unwrap();
        assert!(record.valid_score().is_none());

        let out_of_range = json!({ "subjectId": "s", "score": 11 });
        let record = RatingRecord::from_fields(rid("r3"), &out_of_range).unwrap();
        assert_eq!(record.score, Some(11));
        assert!(record.valid_score().is_none());
    }

    #[test]
    fn test_decode_requires_subject() {
        let result = RatingRecord::from_fields(rid("r1"), &json!({ "score": 3 }));
        assert!(matches!(result, Err(StoreError::InvalidDocument { .. })));
    }

    #[test]
    fn test_pending_timestamp_counts_as_recent() {
        let pending = json!({ "subjectId": "s", "score": 3, "createdAt": { ".sv": "timestamp" } });
        let record = RatingRecord::from_fields(rid("r1"), &pending).unwrap();
        assert_eq!(record.created_at, None);
        assert!(record.is_created_since(i64::MAX));
    }

    #[test]
    fn test_created_since_cutoff() {
        let fields = json!({ "subjectId": "s", "score": 3, "createdAt": 100 });
        let record = RatingRecord::from_fields(rid("r1"), &fields).unwrap();
        assert!(record.is_created_since(100));
        assert!(!record.is_created_since(101));
    }

    proptest! {
        #[test]
        fn prop_score_serde_round_trip(raw in MIN_SCORE..=MAX_SCORE) {
            let score = Score::new(raw).unwrap();
            let encoded = serde_json::to_string(&score).unwrap();
            prop_assert_eq!(&encoded, &raw.to_string());
            prop_assert_eq!(serde_json::from_str::<Score>(&encoded).unwrap(), score);
            prop_assert_eq!(i64::from(score), raw);
        }

        #[test]
        fn prop_score_rejects_out_of_range(raw in any::<i64>().prop_filter("outside 1..=5", |r| !(MIN_SCORE..=MAX_SCORE).contains(r))) {
            prop_assert_eq!(Score::new(raw), Err(RatingError::InvalidScore(raw)));
            prop_assert!(serde_json::from_str::<Score>(&raw.to_string()).is_err());
        }
    }
}
