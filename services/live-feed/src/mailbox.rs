//! Latest-wins delivery slot
//!
//! Producers stamp each value with a sequence number taken under their own
//! lock, then offer it here after releasing that lock. The slot hands values
//! to its consumer one at a time, in sequence order, and drops anything older
//! than what the consumer has already seen. Whichever thread finds the slot
//! idle becomes the drainer; everyone else leaves their value and returns, so
//! a consumer that produces again (directly or through the store) never
//! blocks on itself.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::registry::lock;

struct Slot<T> {
    pending: Option<(u64, T)>,
    last_seq: u64,
    drainer: Option<ThreadId>,
    closed: bool,
}

pub(crate) struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    idle: Condvar,
}

/// Clears the drainer mark if the consumer panics.
struct Draining<'a, T> {
    mailbox: &'a Mailbox<T>,
}

impl<T> Drop for Draining<'_, T> {
    fn drop(&mut self) {
        lock(&self.mailbox.slot).drainer = None;
        self.mailbox.idle.notify_all();
    }
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                last_seq: 0,
                drainer: None,
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Offer `value` stamped with `seq`.
    ///
    /// Stale values and values offered after `close` are dropped. If no
    /// thread is draining, the caller drains: `consume` runs for this value
    /// and for any newer one offered while it runs.
    pub(crate) fn offer<F>(&self, seq: u64, value: T, mut consume: F)
    where
        F: FnMut(T),
    {
        let mut slot = lock(&self.slot);
        if slot.closed || seq <= slot.last_seq {
            return;
        }
        if slot.pending.as_ref().map_or(true, |(queued, _)| seq > *queued) {
            slot.pending = Some((seq, value));
        }
        if slot.drainer.is_some() {
            return;
        }

        slot.drainer = Some(thread::current().id());
        let draining = Draining { mailbox: self };
        loop {
            if slot.closed {
                slot.pending = None;
                break;
            }
            let Some((seq, value)) = slot.pending.take() else {
                break;
            };
            slot.last_seq = seq;
            drop(slot);
            consume(value);
            slot = lock(&self.slot);
        }
        // Release under the same hold as the last empty check, or a value
        // offered in between would be left without a drainer.
        slot.drainer = None;
        drop(slot);
        std::mem::forget(draining);
        self.idle.notify_all();
    }

    /// Stop all further deliveries.
    ///
    /// When another thread is inside `consume`, waits for it to return.
    /// Called from inside `consume` itself, returns at once; nothing more is
    /// delivered after that call returns.
    pub(crate) fn close(&self) {
        let me = thread::current().id();
        let mut slot = lock(&self.slot);
        slot.closed = true;
        slot.pending = None;
        while slot.drainer.is_some_and(|drainer| drainer != me) {
            slot = self
                .idle
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.slot).closed
    }
}
