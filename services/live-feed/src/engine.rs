//! Live aggregation engine
//!
//! Keeps an `AggregateState` for one subject current by listening to two
//! push feeds on the ratings collection:
//! - all-time: every record for the subject
//! - windowed: records with `createdAt` inside the trailing window
//!
//! The windowed feed is filtered server-side so its cost stays flat as
//! history grows. The two feeds interleave arbitrarily; each push simply
//! replaces that feed's record set and triggers a full recompute.
//!
//! Feed errors end the observation: the first one becomes the terminal
//! state (`AccessDenied` or `Error`), the sibling feed is closed, and later
//! pushes are ignored.
//!
//! Every recompute is numbered under the state lock and emitted after it is
//! released, through a latest-wins slot: `on_update` never runs under an
//! engine lock, never runs concurrently with itself, and never sees a state
//! older than one it already saw.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, info, warn};
use types::errors::StoreError;
use types::ids::SubjectId;
use types::rating::{fields, RatingRecord};
use types::snapshot::{AggregateSnapshot, AggregateState};

use crate::aggregation::summarize;
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::mailbox::Mailbox;
use crate::registry::{lock, SubscriptionHandle, SubscriptionRegistry};
use crate::session::Session;
use crate::store::{Direction, Document, DocumentStore, FeedCancel, Query};

/// Receives every state change of an observation.
pub type UpdateCallback = Arc<dyn Fn(&AggregateState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedKind {
    AllTime,
    Windowed,
}

impl FeedKind {
    fn label(&self) -> &'static str {
        match self {
            FeedKind::AllTime => "all_time",
            FeedKind::Windowed => "windowed",
        }
    }
}

struct ObservationState {
    /// Latest set from the all-time feed; None until it first delivers.
    all_time: Option<Vec<RatingRecord>>,
    /// Latest set from the windowed feed; None until it first delivers.
    windowed: Option<Vec<RatingRecord>>,
    current: AggregateState,
    /// Bumped on every change of `current`.
    seq: u64,
}

#[derive(Default)]
struct FeedSlots {
    cancels: Vec<FeedCancel>,
    released: bool,
}

/// One `observe` call's state. Never shared between observers.
struct Observation {
    subject: SubjectId,
    config: FeedConfig,
    clock: Arc<dyn Clock>,
    on_update: UpdateCallback,
    state: Mutex<ObservationState>,
    emitter: Mailbox<AggregateState>,
    feeds: Mutex<FeedSlots>,
}

impl Observation {
    fn new(
        subject: SubjectId,
        config: FeedConfig,
        clock: Arc<dyn Clock>,
        on_update: UpdateCallback,
    ) -> Self {
        Self {
            subject,
            config,
            clock,
            on_update,
            state: Mutex::new(ObservationState {
                all_time: None,
                windowed: None,
                current: AggregateState::Loading,
                seq: 0,
            }),
            emitter: Mailbox::new(),
            feeds: Mutex::new(FeedSlots::default()),
        }
    }

    fn is_closed(&self) -> bool {
        self.emitter.is_closed()
    }

    fn current_state(&self) -> AggregateState {
        lock(&self.state).current.clone()
    }

    fn on_push(&self, kind: FeedKind, docs: Vec<Document>) {
        if self.is_closed() {
            debug!(subject = %self.subject, feed = kind.label(), "Push after cancel dropped");
            return;
        }

        let records = self.decode(docs);
        let (seq, next) = {
            let mut state = lock(&self.state);
            if state.current.is_terminal() {
                return;
            }

            match kind {
                FeedKind::AllTime => state.all_time = Some(records),
                FeedKind::Windowed => state.windowed = Some(records),
            }
            let next = self.recompute(&state);
            state.current = next.clone();
            state.seq += 1;
            (state.seq, next)
        };

        debug!(
            subject = %self.subject,
            feed = kind.label(),
            state = next.label(),
            samples = next.snapshot().map_or(0, |s| s.sample_count),
            "Aggregate recomputed"
        );
        self.emit(seq, next);
    }

    fn emit(&self, seq: u64, state: AggregateState) {
        self.emitter
            .offer(seq, state, |state| (self.on_update)(&state));
    }

    fn on_feed_error(&self, kind: FeedKind, err: StoreError) {
        let terminal = match err {
            StoreError::PermissionDenied => AggregateState::AccessDenied,
            other => AggregateState::Error {
                reason: other.to_string(),
            },
        };

        let seq = {
            let mut state = lock(&self.state);
            if state.current.is_terminal() {
                return;
            }
            state.current = terminal.clone();
            state.seq += 1;
            state.seq
        };

        warn!(
            subject = %self.subject,
            feed = kind.label(),
            state = terminal.label(),
            "Feed failed, observation ended"
        );
        self.emit(seq, terminal);
        self.release_feeds();
    }

    /// Decode pushed documents, skipping any that are not rating records.
    fn decode(&self, docs: Vec<Document>) -> Vec<RatingRecord> {
        docs.into_iter()
            .filter_map(|doc| match RatingRecord::from_fields(doc.id, &doc.fields) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(subject = %self.subject, error = %err, "Skipping undecodable record");
                    None
                }
            })
            .collect()
    }

    fn recompute(&self, state: &ObservationState) -> AggregateState {
        let (Some(all_time), Some(windowed)) = (&state.all_time, &state.windowed) else {
            return AggregateState::Loading;
        };

        let now = self.clock.now_nanos();
        let cutoff = now - self.config.window_nanos;
        let policy = self.config.malformed_policy;

        let total = summarize(all_time.iter(), policy);
        // The server filtered at subscribe time; drop records that have aged
        // out since.
        let recent = summarize(
            windowed.iter().filter(|r| r.is_created_since(cutoff)),
            policy,
        );

        AggregateState::Ready(AggregateSnapshot {
            subject_id: self.subject.clone(),
            sample_count: total.count,
            mean_score: total.mean,
            windowed_sample_count: recent.count,
            windowed_mean_score: recent.mean,
            computed_at: now,
        })
    }

    /// Keep a feed's cancel, or run it now if the observation already ended.
    fn attach_feed(&self, cancel: FeedCancel) {
        let mut slots = lock(&self.feeds);
        if slots.released {
            drop(slots);
            cancel();
        } else {
            slots.cancels.push(cancel);
        }
    }

    fn release_feeds(&self) {
        let cancels = {
            let mut slots = lock(&self.feeds);
            slots.released = true;
            std::mem::take(&mut slots.cancels)
        };
        for cancel in cancels {
            cancel();
        }
    }

    /// Stop updates and release both feeds. Waits out an `on_update` running
    /// on another thread; from inside `on_update` it returns at once.
    fn close(&self) {
        self.emitter.close();
        self.release_feeds();
        debug!(subject = %self.subject, "Observation closed");
    }
}

/// Maintains live aggregate snapshots for observed subjects.
pub struct LiveAggregationEngine {
    store: Arc<dyn DocumentStore>,
    registry: SubscriptionRegistry,
    session: Arc<Session>,
    clock: Arc<dyn Clock>,
    config: FeedConfig,
}

impl LiveAggregationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: SubscriptionRegistry,
        session: Arc<Session>,
        clock: Arc<dyn Clock>,
        config: FeedConfig,
    ) -> Self {
        info!(
            collection = %config.ratings_collection,
            window_nanos = config.window_nanos,
            policy = ?config.malformed_policy,
            "LiveAggregationEngine initialized"
        );

        Self {
            store,
            registry,
            session,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Start observing `subject`.
    ///
    /// Returns the state as of return (pushes delivered during subscribe are
    /// already folded in, and were also passed to `on_update`) and a handle
    /// that is already registered with the registry. The caller still owns
    /// teardown and must cancel the handle when done.
    ///
    /// `on_update` runs on whichever thread delivered the push, one call at a
    /// time. It may cancel the observation, change identity, or write to the
    /// store; an update it causes is delivered after it returns. Once
    /// `cancel` returns, `on_update` is not running and will not run again.
    ///
    /// Anonymous callers get `AccessDenied` and no feeds are opened. So does
    /// a caller whose identity changes before the feeds are up; the handle
    /// comes back already cancelled.
    pub fn observe<F>(&self, subject: &SubjectId, on_update: F) -> (AggregateState, SubscriptionHandle)
    where
        F: Fn(&AggregateState) + Send + Sync + 'static,
    {
        let label = format!("aggregate:{}", subject);

        let (user, generation) = self.session.current_identity();
        let Some(user) = user else {
            info!(subject = %subject, "Anonymous observe refused");
            let handle = self.registry.register(SubscriptionHandle::noop(label));
            return (AggregateState::AccessDenied, handle);
        };

        let observation = Arc::new(Observation::new(
            subject.clone(),
            self.config.clone(),
            Arc::clone(&self.clock),
            Arc::new(on_update),
        ));

        // Registered before any feed opens and before the identity is checked
        // again: a sign-out that lands after the check still finds the handle.
        let closer = Arc::clone(&observation);
        let handle = self.registry.register(SubscriptionHandle::new(label, move || {
            closer.close();
            Ok(())
        }));
        let identity_moved = || self.session.generation() != generation;
        if identity_moved() {
            info!(subject = %subject, user = %user, "Identity changed during observe");
            handle.cancel();
            return (AggregateState::AccessDenied, handle);
        }

        let window_start = self.clock.now_nanos() - self.config.window_nanos;
        let base = Query::collection(self.config.ratings_collection.as_str())
            .where_eq(fields::SUBJECT_ID, json!(subject.as_str()));
        let feeds = [
            (
                FeedKind::AllTime,
                base.clone().order_by(fields::CREATED_AT, Direction::Ascending),
            ),
            (
                FeedKind::Windowed,
                base.where_gte(fields::CREATED_AT, json!(window_start))
                    .order_by(fields::CREATED_AT, Direction::Ascending),
            ),
        ];

        for (kind, query) in feeds {
            if observation.is_closed() {
                break;
            }
            let next_obs = Arc::clone(&observation);
            let error_obs = Arc::clone(&observation);
            let cancel = self.store.subscribe(
                query,
                Arc::new(move |docs: Vec<Document>| next_obs.on_push(kind, docs)),
                Arc::new(move |err: StoreError| error_obs.on_feed_error(kind, err)),
            );
            observation.attach_feed(cancel);
        }

        if identity_moved() {
            info!(subject = %subject, user = %user, "Identity changed during observe");
            handle.cancel();
            return (AggregateState::AccessDenied, handle);
        }

        let initial = observation.current_state();
        info!(
            subject = %subject,
            user = %user,
            handle_id = handle.id(),
            state = initial.label(),
            "Observing subject"
        );
        (initial, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, NANOS_PER_MINUTE};
    use crate::memory::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use types::ids::UserId;
    use types::snapshot::Mean;

    const T0: i64 = 1_700_000_000_000_000_000;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        registry: SubscriptionRegistry,
        session: Arc<Session>,
        engine: LiveAggregationEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let registry = SubscriptionRegistry::new();
        let session = Arc::new(Session::new(registry.clone()));
        session.sign_in(UserId::try_new("observer").unwrap());
        let engine = LiveAggregationEngine::new(
            store.clone(),
            registry.clone(),
            session.clone(),
            clock.clone(),
            FeedConfig::default(),
        );
        Fixture {
            store,
            clock,
            registry,
            session,
            engine,
        }
    }

    fn subject() -> SubjectId {
        SubjectId::try_new("the-roxy").unwrap()
    }

    fn seed(store: &MemoryStore, score: i64, created_at: i64) {
        store.insert_raw(
            "ratings",
            json!({ "subjectId": "the-roxy", "authorId": "u", "score": score, "createdAt": created_at }),
        );
    }

    fn recorder() -> (Arc<Mutex<Vec<AggregateState>>>, impl Fn(&AggregateState) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |state: &AggregateState| sink.lock().unwrap().push(state.clone()))
    }

    #[test]
    fn test_initial_snapshot_reflects_existing_records() {
        let fx = fixture();
        seed(&fx.store, 3, T0 - NANOS_PER_MINUTE);
        seed(&fx.store, 5, T0 - 2 * NANOS_PER_MINUTE);

        let (initial, handle) = fx.engine.observe(&subject(), |_| {});
        let snapshot = initial.snapshot().unwrap();
        assert_eq!(snapshot.sample_count, 2);
        assert_eq!(snapshot.mean_score, Mean::Value(4.0));
        assert_eq!(snapshot.windowed_mean_score, Mean::Value(4.0));
        assert!(fx.registry.contains(&handle));
        handle.cancel();
    }

    #[test]
    fn test_empty_subject_is_no_data() {
        let fx = fixture();
        let (initial, handle) = fx.engine.observe(&subject(), |_| {});
        let snapshot = initial.snapshot().unwrap();
        assert_eq!(snapshot.sample_count, 0);
        assert_eq!(snapshot.mean_score, Mean::NoData);
        assert_eq!(snapshot.windowed_mean_score, Mean::NoData);
        handle.cancel();
    }

    #[test]
    fn test_push_recomputes() {
        let fx = fixture();
        seed(&fx.store, 3, T0);
        seed(&fx.store, 5, T0);
        let (seen, on_update) = recorder();
        let (_, handle) = fx.engine.observe(&subject(), on_update);

        seed(&fx.store, 1, T0);
        let last = seen.lock().unwrap().last().cloned().unwrap();
        let snapshot = last.snapshot().unwrap();
        assert_eq!(snapshot.sample_count, 3);
        assert_eq!(snapshot.mean_score, Mean::Value(3.0));
        handle.cancel();
    }

    #[test]
    fn test_record_outside_window() {
        let fx = fixture();
        seed(&fx.store, 5, T0 - 120 * NANOS_PER_MINUTE);

        let (initial, handle) = fx.engine.observe(&subject(), |_| {});
        let snapshot = initial.snapshot().unwrap();
        assert_eq!(snapshot.mean_score, Mean::Value(5.0));
        assert_eq!(snapshot.windowed_mean_score, Mean::NoData);
        assert_eq!(snapshot.windowed_sample_count, 0);
        handle.cancel();
    }

    #[test]
    fn test_windowed_records_age_out_on_recompute() {
        let fx = fixture();
        seed(&fx.store, 5, T0 - 50 * NANOS_PER_MINUTE);
        let (seen, on_update) = recorder();
        let (initial, handle) = fx.engine.observe(&subject(), on_update);
        assert_eq!(initial.snapshot().unwrap().windowed_sample_count, 1);

        // Twenty minutes later the first record is outside the window.
        fx.clock.advance(20 * NANOS_PER_MINUTE);
        seed(&fx.store, 1, fx.clock.now_nanos());

        let last = seen.lock().unwrap().last().cloned().unwrap();
        let snapshot = last.snapshot().unwrap();
        assert_eq!(snapshot.sample_count, 2);
        assert_eq!(snapshot.windowed_sample_count, 1);
        assert_eq!(snapshot.windowed_mean_score, Mean::Value(1.0));
        handle.cancel();
    }

    #[test]
    fn test_anonymous_observe_is_access_denied() {
        let fx = fixture();
        fx.session.sign_out();

        let (initial, handle) = fx.engine.observe(&subject(), |_| {});
        assert_eq!(initial, AggregateState::AccessDenied);
        assert_eq!(fx.store.live_feed_count(), 0);
        assert!(fx.registry.contains(&handle));
        handle.cancel();
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn test_store_permission_error_is_access_denied() {
        let fx = fixture();
        fx.store.protect_collection("ratings");

        let (initial, handle) = fx.engine.observe(&subject(), |_| {});
        assert_eq!(initial, AggregateState::AccessDenied);
        assert_eq!(fx.store.live_feed_count(), 0);
        handle.cancel();
    }

    #[test]
    fn test_transport_error_is_terminal() {
        let fx = fixture();
        seed(&fx.store, 4, T0);
        let (seen, on_update) = recorder();
        let (_, handle) = fx.engine.observe(&subject(), on_update);
        assert_eq!(fx.store.live_feed_count(), 2);

        fx.store.fail_feeds("ratings", "connection reset");
        // Sibling feed was closed too.
        assert_eq!(fx.store.live_feed_count(), 0);

        seed(&fx.store, 1, T0);
        let seen = seen.lock().unwrap();
        let errors = seen.iter().filter(|s| matches!(s, AggregateState::Error { .. })).count();
        assert_eq!(errors, 1);
        assert!(matches!(seen.last().unwrap(), AggregateState::Error { reason } if reason.contains("connection reset")));
        handle.cancel();
    }

    #[test]
    fn test_cancel_stops_updates_and_closes_feeds() {
        let fx = fixture();
        let (seen, on_update) = recorder();
        let (_, handle) = fx.engine.observe(&subject(), on_update);
        let before = seen.lock().unwrap().len();

        handle.cancel();
        handle.cancel();
        assert_eq!(fx.store.live_feed_count(), 0);
        assert!(fx.registry.is_empty());

        seed(&fx.store, 2, T0);
        assert_eq!(seen.lock().unwrap().len(), before);
    }

    #[test]
    fn test_callback_may_cancel_its_own_observation() {
        let fx = fixture();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0usize));

        let s = Arc::clone(&slot);
        let c = Arc::clone(&calls);
        let (_, handle) = fx.engine.observe(&subject(), move |_state: &AggregateState| {
            *c.lock().unwrap() += 1;
            if let Some(handle) = s.lock().unwrap().as_ref() {
                handle.cancel();
            }
        });
        *slot.lock().unwrap() = Some(handle.clone());
        let before = *calls.lock().unwrap();

        seed(&fx.store, 3, T0);
        seed(&fx.store, 4, T0);

        assert_eq!(*calls.lock().unwrap(), before + 1);
        assert!(handle.is_cancelled());
        assert_eq!(fx.store.live_feed_count(), 0);
    }

    #[test]
    fn test_independent_observers_of_same_subject() {
        let fx = fixture();
        let (a_state, a) = fx.engine.observe(&subject(), |_| {});
        let (_, b) = fx.engine.observe(&subject(), |_| {});
        assert_eq!(fx.store.live_feed_count(), 4);

        a.cancel();
        assert_eq!(fx.store.live_feed_count(), 2);
        assert!(a_state.snapshot().is_some());
        b.cancel();
        assert_eq!(fx.store.live_feed_count(), 0);
    }

    #[test]
    fn test_sign_out_closes_observations() {
        let fx = fixture();
        let (_, handle) = fx.engine.observe(&subject(), |_| {});
        assert_eq!(fx.store.live_feed_count(), 2);

        fx.session.sign_out();
        assert!(handle.is_cancelled());
        assert_eq!(fx.store.live_feed_count(), 0);
    }

    #[test]
    fn test_sign_out_from_callback_during_observe() {
        let fx = fixture();
        let session = Arc::clone(&fx.session);
        let (initial, handle) = fx.engine.observe(&subject(), move |_state: &AggregateState| {
            session.sign_out();
        });

        assert_eq!(initial, AggregateState::AccessDenied);
        assert!(!fx.session.is_signed_in());
        assert!(handle.is_cancelled());
        assert_eq!(fx.store.live_feed_count(), 0);
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn test_observe_racing_sign_out_leaves_no_feeds() {
        for _ in 0..500 {
            let fx = fixture();
            let signer = {
                let session = Arc::clone(&fx.session);
                thread::spawn(move || session.sign_out())
            };
            let (initial, handle) = fx.engine.observe(&subject(), |_| {});
            signer.join().unwrap();

            assert_eq!(fx.store.live_feed_count(), 0);
            if initial != AggregateState::AccessDenied {
                assert!(handle.is_cancelled());
                assert!(!fx.registry.contains(&handle));
            }
        }
    }

    #[test]
    fn test_cancel_waits_for_in_flight_update() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let armed = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);

        let (c, f, a) = (Arc::clone(&calls), Arc::clone(&finished), Arc::clone(&armed));
        let (_, handle) = fx.engine.observe(&subject(), move |_state: &AggregateState| {
            c.fetch_add(1, Ordering::SeqCst);
            if a.load(Ordering::SeqCst) {
                let _ = entered_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(50));
            }
            f.fetch_add(1, Ordering::SeqCst);
        });
        armed.store(true, Ordering::SeqCst);

        let writer = {
            let store = Arc::clone(&fx.store);
            thread::spawn(move || seed(&store, 4, T0))
        };
        entered_rx.recv().unwrap();
        handle.cancel();

        // Nothing is mid-callback once cancel has returned.
        let after = calls.load(Ordering::SeqCst);
        assert_eq!(finished.load(Ordering::SeqCst), after);

        writer.join().unwrap();
        seed(&fx.store, 2, T0);
        assert_eq!(calls.load(Ordering::SeqCst), after);
        assert_eq!(fx.store.live_feed_count(), 0);
    }

    #[test]
    fn test_callback_may_write_the_subject_it_observes() {
        let fx = fixture();
        let store = Arc::clone(&fx.store);
        let (seen, record) = recorder();
        let wrote = AtomicBool::new(false);

        let (_, handle) = fx.engine.observe(&subject(), move |state: &AggregateState| {
            record(state);
            if state.snapshot().is_some() && !wrote.swap(true, Ordering::SeqCst) {
                seed(&store, 5, T0);
            }
        });

        let seen = seen.lock().unwrap();
        let snapshot = seen.last().and_then(AggregateState::snapshot).unwrap();
        assert_eq!(snapshot.sample_count, 1);
        assert_eq!(snapshot.windowed_sample_count, 1);
        assert_eq!(snapshot.mean_score, Mean::Value(5.0));
        drop(seen);
        handle.cancel();
    }

    #[test]
    fn test_concurrent_pushes_end_on_latest_state() {
        let fx = fixture();
        let (seen, on_update) = recorder();
        let (_, handle) = fx.engine.observe(&subject(), on_update);

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&fx.store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        seed(&store, 3, T0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        let counts: Vec<usize> = seen
            .iter()
            .filter_map(AggregateState::snapshot)
            .map(|s| s.sample_count)
            .collect();
        assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", counts);
        let last = seen.last().and_then(AggregateState::snapshot).unwrap();
        assert_eq!(last.sample_count, 100);
        assert_eq!(last.windowed_sample_count, 100);
        drop(seen);
        handle.cancel();
    }
}
