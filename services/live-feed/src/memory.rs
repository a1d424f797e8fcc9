//! In-memory document store
//!
//! A `DocumentStore` that keeps everything in process. Used by tests, the
//! simulator, and offline runs. It follows the managed store's observable
//! behavior: every mutation re-delivers the full matching set to each live
//! feed on the touched collection, protected collections refuse anonymous
//! callers, and losing auth revokes feeds with a permission error.
//!
//! Callbacks always run after the internal lock is released, so a callback
//! may cancel its own feed or write to the store. Each mutation stamps its
//! result sets with a sequence number; a feed's pushes are delivered one at a
//! time and a set older than one already delivered is dropped, so concurrent
//! writers cannot leave a feed on a stale snapshot. A push raised while that
//! feed's callback is still running waits and is delivered after it returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use types::errors::StoreError;
use types::ids::{RecordId, UserId};

use crate::clock::Clock;
use crate::mailbox::Mailbox;
use crate::registry::lock;
use crate::store::{is_server_timestamp, Document, DocumentStore, FeedCancel, OnError, OnNext, Query};

type FeedId = u64;

struct Feed {
    query: Query,
    on_next: OnNext,
    on_error: OnError,
    active: Arc<AtomicBool>,
    mailbox: Arc<Mailbox<Vec<Document>>>,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<RecordId, Value>>,
    feeds: BTreeMap<FeedId, Feed>,
    next_feed_id: FeedId,
    /// Last sequence number handed to a result set.
    next_seq: u64,
    auth: Option<UserId>,
    protected: BTreeSet<String>,
}

impl Inner {
    fn check_access(&self, collection: &str) -> Result<(), StoreError> {
        if self.auth.is_none() && self.protected.contains(collection) {
            Err(StoreError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .map(|(id, fields)| Document {
                id: id.clone(),
                collection: query.collection.clone(),
                fields: fields.clone(),
            })
            .filter(|doc| query.matches(doc))
            .collect();
        query.sort(&mut docs);
        docs
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Fresh result sets for every live feed on `collection`.
    fn pending_deliveries(&mut self, collection: &str) -> Vec<Delivery> {
        let seq = self.bump_seq();
        self.feeds
            .values()
            .filter(|feed| feed.query.collection == collection)
            .map(|feed| Delivery::Next {
                on_next: Arc::clone(&feed.on_next),
                docs: self.run_query(&feed.query),
                active: Arc::clone(&feed.active),
                mailbox: Arc::clone(&feed.mailbox),
                seq,
            })
            .collect()
    }

    /// Remove feeds matching `pred` and queue their terminal error.
    fn terminate_feeds<P>(&mut self, pred: P, error: StoreError) -> Vec<Delivery>
    where
        P: Fn(&Feed) -> bool,
    {
        let ids: Vec<FeedId> = self
            .feeds
            .iter()
            .filter(|(_, feed)| pred(feed))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.feeds.remove(&id))
            .map(|feed| Delivery::Error {
                on_error: feed.on_error,
                error: error.clone(),
                active: feed.active,
            })
            .collect()
    }
}

enum Delivery {
    Next {
        on_next: OnNext,
        docs: Vec<Document>,
        active: Arc<AtomicBool>,
        mailbox: Arc<Mailbox<Vec<Document>>>,
        seq: u64,
    },
    Error {
        on_error: OnError,
        error: StoreError,
        active: Arc<AtomicBool>,
    },
}

/// Run queued callbacks. Must be called without holding the store lock.
fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        match delivery {
            Delivery::Next {
                on_next,
                docs,
                active,
                mailbox,
                seq,
            } => mailbox.offer(seq, docs, |docs| {
                if active.load(Ordering::SeqCst) {
                    on_next(docs);
                }
            }),
            Delivery::Error {
                on_error,
                error,
                active,
            } => {
                // Terminal: flip the flag so the error fires at most once.
                if active.swap(false, Ordering::SeqCst) {
                    on_error(error);
                }
            }
        }
    }
}

/// In-process document store.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Require an authenticated caller for every access to `collection`.
    pub fn protect_collection(&self, collection: impl Into<String>) {
        lock(&self.inner).protected.insert(collection.into());
    }

    /// Set the identity the store sees on subsequent calls.
    ///
    /// Dropping to anonymous revokes every live feed on a protected
    /// collection with `PermissionDenied`.
    pub fn set_auth(&self, user: Option<UserId>) {
        let deliveries = {
            let mut inner = lock(&self.inner);
            inner.auth = user;
            if inner.auth.is_some() {
                Vec::new()
            } else {
                let protected = inner.protected.clone();
                inner.terminate_feeds(
                    |feed| protected.contains(&feed.query.collection),
                    StoreError::PermissionDenied,
                )
            }
        };

        info!(revoked = deliveries.len(), "Store auth changed");
        deliver(deliveries);
    }

    /// Terminate every live feed on `collection` with `Unavailable`.
    pub fn fail_feeds(&self, collection: &str, reason: &str) -> usize {
        let deliveries = lock(&self.inner).terminate_feeds(
            |feed| feed.query.collection == collection,
            StoreError::Unavailable {
                reason: reason.to_string(),
            },
        );

        warn!(
            collection,
            reason,
            failed = deliveries.len(),
            "Injected feed failure"
        );
        let failed = deliveries.len();
        deliver(deliveries);
        failed
    }

    /// Insert fields verbatim, skipping access rules and timestamp
    /// resolution. For seeding legacy or malformed data.
    pub fn insert_raw(&self, collection: &str, fields: Value) -> RecordId {
        let id = RecordId::generate();
        self.insert_raw_at(collection, id.clone(), fields);
        id
    }

    /// Like `insert_raw`, under a caller-chosen id. Replaces any existing
    /// document with that id.
    pub fn insert_raw_at(&self, collection: &str, id: RecordId, fields: Value) {
        let deliveries = {
            let mut inner = lock(&self.inner);
            inner
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id, fields);
            inner.pending_deliveries(collection)
        };
        deliver(deliveries);
    }

    /// Number of feeds currently open.
    pub fn live_feed_count(&self) -> usize {
        lock(&self.inner).feeds.len()
    }

    /// Number of documents in a collection.
    pub fn document_count(&self, collection: &str) -> usize {
        lock(&self.inner)
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Replace server timestamp placeholders with the store clock.
    fn resolve_fields(&self, fields: Value) -> Result<Map<String, Value>, StoreError> {
        let Value::Object(mut map) = fields else {
            return Err(StoreError::InvalidDocument {
                reason: "fields must be a JSON object".to_string(),
            });
        };
        let now = self.clock.now_nanos();
        for value in map.values_mut() {
            if is_server_timestamp(value) {
                *value = Value::from(now);
            }
        }
        Ok(map)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn subscribe(&self, query: Query, on_next: OnNext, on_error: OnError) -> FeedCancel {
        let active = Arc::new(AtomicBool::new(true));

        let (feed_id, deliveries) = {
            let mut inner = lock(&self.inner);
            if let Err(err) = inner.check_access(&query.collection) {
                drop(inner);
                debug!(collection = %query.collection, "Feed refused");
                deliver(vec![Delivery::Error {
                    on_error,
                    error: err,
                    active,
                }]);
                return Box::new(|| {});
            }

            let feed_id = inner.next_feed_id;
            inner.next_feed_id += 1;
            let mailbox = Arc::new(Mailbox::new());
            let initial = Delivery::Next {
                on_next: Arc::clone(&on_next),
                docs: inner.run_query(&query),
                active: Arc::clone(&active),
                mailbox: Arc::clone(&mailbox),
                seq: inner.bump_seq(),
            };
            inner.feeds.insert(
                feed_id,
                Feed {
                    query,
                    on_next,
                    on_error,
                    active: Arc::clone(&active),
                    mailbox,
                },
            );
            (feed_id, vec![initial])
        };

        debug!(feed_id, "Feed opened");
        deliver(deliveries);

        let store: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            active.store(false, Ordering::SeqCst);
            if let Some(inner) = store.upgrade() {
                if lock(&inner).feeds.remove(&feed_id).is_some() {
                    debug!(feed_id, "Feed closed");
                }
            }
        })
    }

    async fn write(&self, collection: &str, fields: Value) -> Result<RecordId, StoreError> {
        // Network hop.
        tokio::task::yield_now().await;

        let map = self.resolve_fields(fields)?;
        let id = RecordId::generate();
        let deliveries = {
            let mut inner = lock(&self.inner);
            inner.check_access(collection)?;
            inner
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.clone(), Value::Object(map));
            inner.pending_deliveries(collection)
        };

        debug!(collection, id = %id, feeds = deliveries.len(), "Document written");
        deliver(deliveries);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &RecordId, fields: Value) -> Result<(), StoreError> {
        tokio::task::yield_now().await;

        let patch = self.resolve_fields(fields)?;
        let deliveries = {
            let mut inner = lock(&self.inner);
            inner.check_access(collection)?;
            let existing = inner
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| StoreError::NotFound {
                    path: format!("{}/{}", collection, id),
                })?;
            existing.extend(patch);
            inner.pending_deliveries(collection)
        };

        debug!(collection, id = %id, feeds = deliveries.len(), "Document updated");
        deliver(deliveries);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Document>, StoreError> {
        tokio::task::yield_now().await;

        let inner = lock(&self.inner);
        inner.check_access(collection)?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.clone(),
                collection: collection.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn query_once(&self, query: Query) -> Result<Vec<Document>, StoreError> {
        tokio::task::yield_now().await;

        let inner = lock(&self.inner);
        inner.check_access(&query.collection)?;
        Ok(inner.run_query(&query))
    }
}
