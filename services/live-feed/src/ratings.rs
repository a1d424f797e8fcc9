//! Rating submission
//!
//! Writes a user's busyness rating for a venue. A second rating from the
//! same author inside the re-rate window replaces the earlier record instead
//! of adding one. New ratings also bump the venue document's counter in a
//! second write; the two writes are not atomic and a failure between them
//! leaves the counter behind, which the venue screen tolerates.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};
use types::errors::RatingError;
use types::ids::{RecordId, SubjectId};
use types::rating::{fields, Score};

use crate::clock::Clock;
use crate::config::RatingConfig;
use crate::session::Session;
use crate::store::{server_timestamp, Direction, DocumentStore, Query};

/// Venue document fields touched on every new rating.
pub mod venue_fields {
    pub const RATING_COUNT: &str = "ratingCount";
    pub const LAST_RATED_AT: &str = "lastRatedAt";
}

/// What a submission did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new record was written.
    Created(RecordId),
    /// The author's recent record was overwritten.
    Replaced(RecordId),
}

impl SubmitOutcome {
    pub fn record_id(&self) -> &RecordId {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Replaced(id) => id,
        }
    }
}

pub struct RatingService {
    store: Arc<dyn DocumentStore>,
    session: Arc<Session>,
    clock: Arc<dyn Clock>,
    config: RatingConfig,
}

impl RatingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Arc<Session>,
        clock: Arc<dyn Clock>,
        config: RatingConfig,
    ) -> Self {
        Self {
            store,
            session,
            clock,
            config,
        }
    }

    /// Rate `subject` as the signed-in user.
    pub async fn submit(
        &self,
        subject: &SubjectId,
        score: Score,
        note: Option<String>,
    ) -> Result<SubmitOutcome, RatingError> {
        let author = self.session.current_user().ok_or(RatingError::SignedOut)?;
        let note = self.validate_note(note)?;

        let since = self.clock.now_nanos() - self.config.rerate_window_nanos;
        let recent = self
            .store
            .query_once(
                Query::collection(self.config.ratings_collection.as_str())
                    .where_eq(fields::SUBJECT_ID, json!(subject.as_str()))
                    .where_eq(fields::AUTHOR_ID, json!(author.as_str()))
                    .where_gt(fields::CREATED_AT, json!(since))
                    .order_by(fields::CREATED_AT, Direction::Descending),
            )
            .await?;

        if let Some(previous) = recent.into_iter().next() {
            let mut patch = Map::new();
            patch.insert(fields::SCORE.to_string(), json!(i64::from(score)));
            patch.insert(fields::NOTE.to_string(), note.map_or(Value::Null, Value::String));
            patch.insert(fields::UPDATED_AT.to_string(), server_timestamp());

            self.store
                .update(&self.config.ratings_collection, &previous.id, Value::Object(patch))
                .await?;

            info!(
                subject = %subject,
                author = %author,
                record = %previous.id,
                score = score.value(),
                "Rating replaced"
            );
            return Ok(SubmitOutcome::Replaced(previous.id));
        }

        let mut record = Map::new();
        record.insert(fields::SUBJECT_ID.to_string(), json!(subject.as_str()));
        record.insert(fields::AUTHOR_ID.to_string(), json!(author.as_str()));
        record.insert(fields::SCORE.to_string(), json!(i64::from(score)));
        if let Some(note) = note {
            record.insert(fields::NOTE.to_string(), Value::String(note));
        }
        record.insert(fields::CREATED_AT.to_string(), server_timestamp());

        let id = self
            .store
            .write(&self.config.ratings_collection, Value::Object(record))
            .await?;

        info!(
            subject = %subject,
            author = %author,
            record = %id,
            score = score.value(),
            "Rating created"
        );

        self.bump_venue(subject).await;
        Ok(SubmitOutcome::Created(id))
    }

    /// Trim the note, drop it when blank, and enforce the length bound.
    fn validate_note(&self, note: Option<String>) -> Result<Option<String>, RatingError> {
        let Some(note) = note else {
            return Ok(None);
        };
        let trimmed = note.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let len = trimmed.chars().count();
        if len > self.config.max_note_chars {
            return Err(RatingError::NoteTooLong {
                len,
                max: self.config.max_note_chars,
            });
        }
        Ok(Some(trimmed.to_string()))
    }

    /// Second, non-atomic step: advance the venue's rating counter.
    ///
    /// The rating itself is already stored, so failures here are logged and
    /// swallowed.
    async fn bump_venue(&self, subject: &SubjectId) {
        let venues = self.config.venues_collection.as_str();
        let venue_id = RecordId::from_string(subject.as_str());

        let venue = match self.store.get(venues, &venue_id).await {
            Ok(Some(venue)) => venue,
            Ok(None) => {
                warn!(subject = %subject, "Venue document missing, counter not updated");
                return;
            }
            Err(err) => {
                warn!(subject = %subject, error = %err, "Venue read failed, counter not updated");
                return;
            }
        };

        let count = venue
            .field(venue_fields::RATING_COUNT)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let patch = json!({
            venue_fields::RATING_COUNT: count + 1,
            venue_fields::LAST_RATED_AT: server_timestamp(),
        });

        if let Err(err) = self.store.update(venues, &venue_id, patch).await {
            warn!(subject = %subject, error = %err, "Venue counter update failed");
        }
    }
}
