//! Subscription lifecycle registry
//!
//! Process-wide bookkeeping of every open push feed's cancel capability, so
//! one teardown point (identity change, shutdown, bulk cancel) can close
//! them all.
//!
//! A `SubscriptionHandle` runs its capability at most once no matter how
//! many clones exist or which path (its own `cancel`, or the registry's
//! `cancel_all`) gets there first. Handles keep only a weak reference back to
//! the registry that tracks them.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::{debug, info, warn};
use types::errors::CancelError;

/// Process-unique handle identifier.
pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

type CancelFn = Box<dyn FnOnce() -> Result<(), CancelError> + Send>;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HandleInner {
    id: HandleId,
    label: String,
    capability: Mutex<Option<CancelFn>>,
    cancelled: AtomicBool,
    registry: Mutex<Option<Weak<RegistryShared>>>,
}

/// Cancel capability for one push feed (or a group of feeds).
///
/// Cheap to clone; all clones share the same capability.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    /// Wrap a cancel capability.
    pub fn new<F>(label: impl Into<String>, cancel: F) -> Self
    where
        F: FnOnce() -> Result<(), CancelError> + Send + 'static,
    {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                capability: Mutex::new(Some(Box::new(cancel))),
                cancelled: AtomicBool::new(false),
                registry: Mutex::new(None),
            }),
        }
    }

    /// A handle with nothing to release.
    pub fn noop(label: impl Into<String>) -> Self {
        Self::new(label, || Ok(()))
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the capability has already run.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Release the feed and drop out of the registry.
    ///
    /// Safe to call any number of times, from any clone; only the first call
    /// does anything.
    pub fn cancel(&self) {
        if let Some(Err(err)) = self.invoke() {
            warn!(
                handle_id = self.id(),
                label = self.label(),
                error = %err,
                "Subscription cancel failed"
            );
        }

        let registry = self.detach();
        if let Some(shared) = registry {
            shared.remove(self.id());
        }
    }

    /// Run the capability if nobody has yet. Returns None if it already ran.
    fn invoke(&self) -> Option<Result<(), CancelError>> {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return None;
        }

        let capability = lock(&self.inner.capability).take()?;
        let outcome = match catch_unwind(AssertUnwindSafe(capability)) {
            Ok(result) => result,
            Err(_) => Err(CancelError::new("cancel capability panicked")),
        };

        debug!(
            handle_id = self.id(),
            label = self.label(),
            ok = outcome.is_ok(),
            "Subscription capability invoked"
        );
        Some(outcome)
    }

    fn attach(&self, shared: &Arc<RegistryShared>) {
        *lock(&self.inner.registry) = Some(Arc::downgrade(shared));
    }

    fn detach(&self) -> Option<Arc<RegistryShared>> {
        lock(&self.inner.registry).take().and_then(|weak| weak.upgrade())
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Outcome of a bulk cancel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelAllReport {
    /// Capabilities that ran successfully.
    pub invoked: usize,
    /// Capabilities that returned an error or panicked.
    pub failed: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub unregistered: u64,
    pub bulk_cancelled: u64,
    pub failures: u64,
}

struct RegistryShared {
    tracked: Mutex<BTreeMap<HandleId, SubscriptionHandle>>,
    registered: AtomicU64,
    unregistered: AtomicU64,
    bulk_cancelled: AtomicU64,
    failures: AtomicU64,
}

impl RegistryShared {
    fn remove(&self, id: HandleId) -> bool {
        let removed = lock(&self.tracked).remove(&id).is_some();
        if removed {
            self.unregistered.fetch_add(1, Ordering::Relaxed);
            debug!(handle_id = id, "Subscription unregistered");
        }
        removed
    }
}

/// Tracks every outstanding subscription handle.
///
/// Cloning yields another reference to the same tracked set. All three
/// operations are serialized by one mutex, which is never held while a
/// capability runs.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<RegistryShared>,
}

static GLOBAL: OnceLock<SubscriptionRegistry> = OnceLock::new();

impl SubscriptionRegistry {
    /// A fresh, independent registry.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                tracked: Mutex::new(BTreeMap::new()),
                registered: AtomicU64::new(0),
                unregistered: AtomicU64::new(0),
                bulk_cancelled: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> SubscriptionRegistry {
        GLOBAL.get_or_init(SubscriptionRegistry::new).clone()
    }

    /// Track a handle and hand it back.
    ///
    /// Registering a handle twice, or one that is already cancelled, is a no-op.
    pub fn register(&self, handle: SubscriptionHandle) -> SubscriptionHandle {
        let mut tracked = lock(&self.shared.tracked);
        if handle.is_cancelled() || tracked.contains_key(&handle.id()) {
            return handle;
        }

        handle.attach(&self.shared);
        // A cancel on another clone that ran before `attach` found nothing to
        // detach from; it must not leave the handle tracked.
        if handle.is_cancelled() {
            handle.detach();
            return handle;
        }
        tracked.insert(handle.id(), handle.clone());
        self.shared.registered.fetch_add(1, Ordering::Relaxed);

        debug!(
            handle_id = handle.id(),
            label = handle.label(),
            tracked = tracked.len(),
            "Subscription registered"
        );
        handle
    }

    /// Stop tracking a handle without cancelling it. No-op if absent.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.remove(handle.id())
    }

    /// Cancel every tracked handle and clear the set.
    ///
    /// Failures are logged and counted, never propagated. Capabilities run
    /// outside the lock, so they may call back into this registry.
    pub fn cancel_all(&self) -> CancelAllReport {
        let drained: Vec<SubscriptionHandle> = {
            let mut tracked = lock(&self.shared.tracked);
            std::mem::take(&mut *tracked).into_values().collect()
        };

        let mut report = CancelAllReport::default();
        for handle in drained {
            handle.detach();
            match handle.invoke() {
                Some(Ok(())) => report.invoked += 1,
                Some(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        handle_id = handle.id(),
                        label = handle.label(),
                        error = %err,
                        "Subscription cancel failed during bulk cancel"
                    );
                }
                None => {}
            }
        }

        self.shared
            .bulk_cancelled
            .fetch_add((report.invoked + report.failed) as u64, Ordering::Relaxed);
        self.shared
            .failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        info!(
            invoked = report.invoked,
            failed = report.failed,
            "Cancelled all subscriptions"
        );
        report
    }

    /// Whether the handle is currently tracked.
    pub fn contains(&self, handle: &SubscriptionHandle) -> bool {
        lock(&self.shared.tracked).contains_key(&handle.id())
    }

    /// Number of tracked handles.
    pub fn len(&self) -> usize {
        lock(&self.shared.tracked).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.shared.registered.load(Ordering::Relaxed),
            unregistered: self.shared.unregistered.load(Ordering::Relaxed),
            bulk_cancelled: self.shared.bulk_cancelled.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
