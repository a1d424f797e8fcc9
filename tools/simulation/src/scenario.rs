//! Scenario runner
//!
//! Builds an in-memory store on a manual clock, lets an observer watch every
//! venue through the live aggregation engine, and drives seeded raters tick
//! by tick. Each rater submits from its own session, as separate devices
//! would. The observer may sign out mid-run; either way the run ends with a
//! full teardown and a leak check.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use live_feed::clock::{Clock, ManualClock, NANOS_PER_MINUTE};
use live_feed::config::{FeedConfig, RatingConfig};
use live_feed::memory::MemoryStore;
use live_feed::presentation::describe;
use live_feed::ratings::{RatingService, SubmitOutcome};
use live_feed::session::Session;
use live_feed::store::DocumentStore;
use live_feed::{LiveAggregationEngine, SubscriptionHandle, SubscriptionRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use types::errors::StoreError;
use types::ids::{RecordId, SubjectId, UserId};
use types::rating::{fields, Score};
use types::snapshot::AggregateState;

use crate::metrics::{SimEvent, SimMetrics};
use crate::raters::{Rater, RaterAction, RaterConfig};

/// A venue and the busyness raters perceive there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSpec {
    pub id: String,
    pub name: String,
    /// True busyness on the 1 to 5 scale
    pub busyness: i64,
}

impl VenueSpec {
    pub fn new(id: &str, name: &str, busyness: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            busyness,
        }
    }
}

/// Scenario configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub seed: u64,
    pub venues: Vec<VenueSpec>,
    pub raters: usize,
    pub ticks: u32,
    /// Simulated time between ticks
    pub tick_nanos: i64,
    /// Clock value at the first tick
    pub start_nanos: i64,
    /// Tick at which the observer signs out, if any
    pub sign_out_at_tick: Option<u32>,
    pub rater: RaterConfig,
    pub feed: FeedConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            venues: vec![
                VenueSpec::new("the-roxy", "The Roxy", 4),
                VenueSpec::new("gold-bar", "Gold Bar", 2),
                VenueSpec::new("the-box", "The Box", 5),
                VenueSpec::new("acme-lounge", "Acme Lounge", 1),
            ],
            raters: 12,
            ticks: 48,
            tick_nanos: 5 * NANOS_PER_MINUTE,
            start_nanos: 1_708_123_456_789_000_000,
            sign_out_at_tick: None,
            rater: RaterConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Invalid venue id: {0:?}")]
    InvalidVenue(String),

    #[error("Invalid user id: {0:?}")]
    InvalidUser(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome for one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueReport {
    pub subject_id: String,
    pub name: String,
    pub true_busyness: i64,
    /// Last state the observer saw
    pub final_state: AggregateState,
    pub display: String,
    /// Pushes the observer received
    pub updates: u64,
    pub ratings_created: u64,
    /// The venue document's counter, updated outside the rating write
    pub venue_rating_count: i64,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub version: String,
    pub seed: u64,
    pub ticks_run: u32,
    pub observer_signed_out_at: Option<u32>,
    /// Feeds still open in the store right after the mid-run sign-out
    pub feeds_open_after_sign_out: Option<usize>,
    pub venues: Vec<VenueReport>,
    pub metrics: SimMetrics,
    /// Feeds still open in the store after teardown
    pub feeds_open_after_teardown: usize,
    /// Handles still tracked by the observer's registry after teardown
    pub handles_tracked_after_teardown: usize,
}

impl ScenarioReport {
    /// True when teardown released every feed and handle.
    pub fn is_leak_free(&self) -> bool {
        self.feeds_open_after_teardown == 0 && self.handles_tracked_after_teardown == 0
    }
}

#[derive(Debug, Default)]
struct Track {
    last: Option<AggregateState>,
    updates: u64,
}

type Tracks = Arc<Mutex<BTreeMap<usize, Track>>>;

struct Device {
    rater: Rater,
    service: RatingService,
}

fn user_id(raw: &str) -> Result<UserId, ScenarioError> {
    UserId::try_new(raw).ok_or_else(|| ScenarioError::InvalidUser(raw.to_string()))
}

/// Leftovers counted once every observer handle has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Leftovers {
    feeds_open: usize,
    handles_tracked: usize,
}

/// Cancel the observer's handles one by one and count what is still open.
///
/// Runs before the observer signs out, so anything a handle failed to
/// release is still visible to the count.
fn cancel_handles(
    handles: &[SubscriptionHandle],
    store: &MemoryStore,
    registry: &SubscriptionRegistry,
) -> Leftovers {
    for handle in handles {
        handle.cancel();
    }
    let leftovers = Leftovers {
        feeds_open: store.live_feed_count(),
        handles_tracked: registry.len(),
    };
    if leftovers.feeds_open > 0 || leftovers.handles_tracked > 0 {
        warn!(
            feeds_open = leftovers.feeds_open,
            handles_tracked = leftovers.handles_tracked,
            "Teardown left subscriptions open"
        );
    }
    leftovers
}

/// Run a scenario to completion.
pub async fn run_scenario(config: ScenarioConfig) -> Result<ScenarioReport, ScenarioError> {
    info!(
        seed = config.seed,
        venues = config.venues.len(),
        raters = config.raters,
        ticks = config.ticks,
        "Scenario starting"
    );

    let subjects = config
        .venues
        .iter()
        .map(|venue| {
            SubjectId::try_new(venue.id.as_str())
                .ok_or_else(|| ScenarioError::InvalidVenue(venue.id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let busyness: Vec<i64> = config.venues.iter().map(|v| v.busyness).collect();

    let rating_config = RatingConfig {
        ratings_collection: config.feed.ratings_collection.clone(),
        ..RatingConfig::default()
    };

    let clock = Arc::new(ManualClock::new(config.start_nanos));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    for (venue, subject) in config.venues.iter().zip(&subjects) {
        store.insert_raw_at(
            &rating_config.venues_collection,
            RecordId::from_string(subject.as_str()),
            json!({ "name": venue.name, "ratingCount": 0 }),
        );
    }

    let registry = SubscriptionRegistry::new();
    let observer = Arc::new(Session::new(registry.clone()));
    observer.sign_in(user_id("observer")?);

    let engine = LiveAggregationEngine::new(
        store.clone(),
        registry.clone(),
        observer.clone(),
        clock.clone(),
        config.feed.clone(),
    );

    let tracks: Tracks = Arc::new(Mutex::new(BTreeMap::new()));
    let mut handles: Vec<SubscriptionHandle> = Vec::with_capacity(subjects.len());
    for (index, subject) in subjects.iter().enumerate() {
        let sink = Arc::clone(&tracks);
        let (initial, handle) = engine.observe(subject, move |state: &AggregateState| {
            let mut tracks = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let track = tracks.entry(index).or_default();
            track.last = Some(state.clone());
            track.updates += 1;
        });
        debug!(subject = %subject, state = initial.label(), "Observer attached");
        handles.push(handle);
    }

    let mut devices: Vec<Device> = Vec::with_capacity(config.raters);
    for i in 0..config.raters {
        let user = user_id(&format!("rater-{}", i))?;
        let session = Arc::new(Session::new(SubscriptionRegistry::new()));
        session.sign_in(user.clone());
        devices.push(Device {
            rater: Rater::new(
                user,
                config.rater.clone(),
                config.seed.wrapping_add(i as u64 * 7919),
            ),
            service: RatingService::new(
                store.clone(),
                session,
                clock.clone(),
                rating_config.clone(),
            ),
        });
    }

    let mut metrics = SimMetrics::new();
    let mut created_per_venue = vec![0u64; subjects.len()];
    let mut feeds_open_after_sign_out = None;

    for tick in 0..config.ticks {
        if config.sign_out_at_tick == Some(tick) {
            observer.sign_out();
            let open = store.live_feed_count();
            feeds_open_after_sign_out = Some(open);
            info!(tick, feeds_open = open, "Observer signed out");
        }

        for device in devices.iter_mut() {
            match device.rater.next_action(&busyness) {
                RaterAction::Idle => {}
                RaterAction::Rate { venue, score, note } => {
                    let submitted = match Score::new(score) {
                        Ok(score) => device
                            .service
                            .submit(&subjects[venue], score, note)
                            .await
                            .map(|outcome| (outcome, score)),
                        Err(err) => Err(err),
                    };
                    match submitted {
                        Ok((SubmitOutcome::Created(_), score)) => {
                            created_per_venue[venue] += 1;
                            metrics.record_event(&SimEvent::RatingCreated {
                                score: score.value(),
                            });
                        }
                        Ok((SubmitOutcome::Replaced(_), score)) => {
                            metrics.record_event(&SimEvent::RatingReplaced {
                                score: score.value(),
                            });
                        }
                        Err(err) => {
                            warn!(rater = %device.rater.user, error = %err, "Rating rejected");
                            metrics.record_event(&SimEvent::RatingRejected);
                        }
                    }
                }
                RaterAction::InjectMalformed { venue, score } => {
                    store.insert_raw(
                        &rating_config.ratings_collection,
                        json!({
                            fields::SUBJECT_ID: subjects[venue].as_str(),
                            fields::AUTHOR_ID: device.rater.user.as_str(),
                            fields::SCORE: score,
                            fields::CREATED_AT: clock.now_nanos(),
                        }),
                    );
                    metrics.record_event(&SimEvent::MalformedInjected);
                }
            }
        }

        clock.advance(config.tick_nanos);
    }

    let final_tracks: BTreeMap<usize, Track> = {
        let mut tracks = tracks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *tracks)
    };

    let leftovers = cancel_handles(&handles, &store, &registry);
    observer.sign_out();

    let mut venues = Vec::with_capacity(subjects.len());
    for (index, (venue, subject)) in config.venues.iter().zip(&subjects).enumerate() {
        let track = final_tracks.get(&index);
        let final_state = track
            .and_then(|t| t.last.clone())
            .unwrap_or(AggregateState::Loading);
        let updates = track.map_or(0, |t| t.updates);
        for _ in 0..updates {
            metrics.record_event(&SimEvent::UpdateReceived);
        }

        let venue_doc = store
            .get(
                &rating_config.venues_collection,
                &RecordId::from_string(subject.as_str()),
            )
            .await?;
        let venue_rating_count = venue_doc
            .as_ref()
            .and_then(|doc| doc.field("ratingCount"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        venues.push(VenueReport {
            subject_id: subject.to_string(),
            name: venue.name.clone(),
            true_busyness: venue.busyness,
            display: describe(&final_state),
            final_state,
            updates,
            ratings_created: created_per_venue[index],
            venue_rating_count,
        });
    }

    let report = ScenarioReport {
        version: crate::VERSION.to_string(),
        seed: config.seed,
        ticks_run: config.ticks,
        observer_signed_out_at: config.sign_out_at_tick.filter(|t| *t < config.ticks),
        feeds_open_after_sign_out,
        venues,
        feeds_open_after_teardown: leftovers.feeds_open,
        handles_tracked_after_teardown: leftovers.handles_tracked,
        metrics,
    };

    info!(
        seed = report.seed,
        summary = %report.metrics.summary(),
        leak_free = report.is_leak_free(),
        "Scenario finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::snapshot::Mean;

    fn small() -> ScenarioConfig {
        ScenarioConfig {
            raters: 4,
            ticks: 12,
            ..ScenarioConfig::default()
        }
    }

    #[tokio::test]
    async fn test_scenario_runs_leak_free() {
        let report = run_scenario(small()).await.unwrap();
        assert_eq!(report.venues.len(), 4);
        assert!(report.is_leak_free());
        assert!(report.metrics.submissions() > 0);
    }

    #[tokio::test]
    async fn test_venue_counter_matches_created_ratings() {
        let report = run_scenario(small()).await.unwrap();
        for venue in &report.venues {
            assert_eq!(venue.venue_rating_count, venue.ratings_created as i64);
        }
    }

    #[tokio::test]
    async fn test_all_time_count_covers_created_and_malformed() {
        let report = run_scenario(small()).await.unwrap();
        let sampled: usize = report
            .venues
            .iter()
            .filter_map(|v| v.final_state.snapshot())
            .map(|s| s.sample_count)
            .sum();
        let expected = report.metrics.ratings_created + report.metrics.malformed_injected;
        assert_eq!(sampled as u64, expected);
    }

    #[tokio::test]
    async fn test_quiet_run_reports_no_data() {
        let config = ScenarioConfig {
            rater: RaterConfig {
                activity: 0.0,
                ..RaterConfig::default()
            },
            ..small()
        };
        let report = run_scenario(config).await.unwrap();
        for venue in &report.venues {
            let snapshot = venue.final_state.snapshot().unwrap();
            assert_eq!(snapshot.mean_score, Mean::NoData);
            assert_eq!(venue.updates, 2);
        }
    }

    #[tokio::test]
    async fn test_mid_run_sign_out_closes_feeds_immediately() {
        let config = ScenarioConfig {
            sign_out_at_tick: Some(4),
            ..small()
        };
        let report = run_scenario(config).await.unwrap();
        assert_eq!(report.observer_signed_out_at, Some(4));
        assert_eq!(report.feeds_open_after_sign_out, Some(0));
        assert!(report.is_leak_free());
    }

    #[tokio::test]
    async fn test_no_sign_out_reports_none() {
        let report = run_scenario(small()).await.unwrap();
        assert_eq!(report.observer_signed_out_at, None);
        assert_eq!(report.feeds_open_after_sign_out, None);
    }

    #[test]
    fn test_cancel_handles_counts_what_cancel_missed() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock);
        let registry = SubscriptionRegistry::new();
        let cancelled = registry.register(SubscriptionHandle::noop("listed"));
        // Registered but never handed to the teardown list.
        let stray = registry.register(SubscriptionHandle::noop("stray"));
        let _feed = store.subscribe(
            live_feed::store::Query::collection("ratings"),
            Arc::new(|_docs: Vec<live_feed::store::Document>| {}),
            Arc::new(|_err: StoreError| {}),
        );

        let leftovers = cancel_handles(&[cancelled.clone()], &store, &registry);
        assert!(cancelled.is_cancelled());
        assert_eq!(
            leftovers,
            Leftovers {
                feeds_open: 1,
                handles_tracked: 1
            }
        );
        assert!(registry.contains(&stray));
    }

    #[tokio::test]
    async fn test_blank_venue_id_is_rejected() {
        let config = ScenarioConfig {
            venues: vec![VenueSpec::new("  ", "Nowhere", 3)],
            ..small()
        };
        assert!(matches!(
            run_scenario(config).await,
            Err(ScenarioError::InvalidVenue(_))
        ));
    }
}
