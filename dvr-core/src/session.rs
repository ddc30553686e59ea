//! Session Table: fixed-capacity slots addressed by serial number.
//!
//! Serial numbers are allocated from a global counter, skipping 0 (used as
//! "empty"). The public handle is the serial number, not the slot index, so
//! a callback referring to a recycled slot is detected by re-checking
//! `sn == slot.sn` under the slot's own lock rather than relying on pointer
//! or index identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{DvrError, Result};

pub const MAX_SESSIONS: usize = 10;
pub const LOCK_RETRY_MS: u64 = 10;

const EMPTY_SN: u64 = 0;
const CLAIMING_SN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(u64);

impl SerialNumber {
    pub fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(n: u64) -> Self {
        Self(n)
    }
}

/// Outcome of a timed, shutdown-responsive lock attempt (used by workers
/// draining an event queue; see `events::Worker`).
pub enum LockOutcome<R> {
    Done(R),
    TimedOut,
    /// The handle's serial number no longer matches the slot (closed or
    /// recycled) — dispatch is a no-op (HANDLE-1).
    Invalid,
}

struct Slot<T> {
    sn: AtomicU64,
    value: Mutex<Option<T>>,
}

/// One coarse lock per session slot, as the concurrency model calls for.
pub struct SessionTable<T> {
    slots: Vec<Arc<Slot<T>>>,
    next_sn: AtomicU64,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionTable<T> {
    pub fn new() -> Self {
        let slots = (0..MAX_SESSIONS)
            .map(|_| {
                Arc::new(Slot {
                    sn: AtomicU64::new(EMPTY_SN),
                    value: Mutex::new(None),
                })
            })
            .collect();
        Self {
            slots,
            next_sn: AtomicU64::new(1),
        }
    }

    fn alloc_sn(&self) -> SerialNumber {
        SerialNumber(self.next_sn.fetch_add(1, Ordering::SeqCst))
    }

    /// Claims a free slot and installs `value`, returning its handle.
    /// Fails with `NoSlot` once all `MAX_SESSIONS` slots are occupied.
    pub fn open(&self, value: T) -> Result<SerialNumber> {
        for slot in &self.slots {
            if slot
                .sn
                .compare_exchange(EMPTY_SN, CLAIMING_SN, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let sn = self.alloc_sn();
                *slot.value.lock() = Some(value);
                slot.sn.store(sn.get(), Ordering::SeqCst);
                return Ok(sn);
            }
        }
        Err(DvrError::NoSlot)
    }

    fn find(&self, sn: SerialNumber) -> Option<&Arc<Slot<T>>> {
        self.slots
            .iter()
            .find(|s| s.sn.load(Ordering::SeqCst) == sn.get())
    }

    /// Acquires the session lock and runs `f`, revalidating `sn` under the
    /// lock. Returns `None` if the handle is stale.
    pub fn with_locked<R>(&self, sn: SerialNumber, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.find(sn)?;
        let mut guard = slot.value.lock();
        if slot.sn.load(Ordering::SeqCst) != sn.get() {
            return None;
        }
        guard.as_mut().map(f)
    }

    /// Same as `with_locked` but bounded by `timeout`, so a caller polling a
    /// shutdown flag (the worker loops) can stay responsive. Does not retry
    /// internally — callers loop on `TimedOut` themselves.
    pub fn try_locked_for<R>(
        &self,
        sn: SerialNumber,
        timeout: Duration,
        f: impl FnOnce(&mut T) -> R,
    ) -> LockOutcome<R> {
        let Some(slot) = self.find(sn) else {
            return LockOutcome::Invalid;
        };
        match slot.value.try_lock_for(timeout) {
            Some(mut guard) => {
                if slot.sn.load(Ordering::SeqCst) != sn.get() {
                    return LockOutcome::Invalid;
                }
                match guard.as_mut() {
                    Some(v) => LockOutcome::Done(f(v)),
                    None => LockOutcome::Invalid,
                }
            }
            None => LockOutcome::TimedOut,
        }
    }

    /// Releases the slot, returning the session value for teardown.
    pub fn close(&self, sn: SerialNumber) -> Option<T> {
        let slot = self.find(sn)?;
        let mut guard = slot.value.lock();
        if slot.sn.load(Ordering::SeqCst) != sn.get() {
            return None;
        }
        let value = guard.take();
        slot.sn.store(EMPTY_SN, Ordering::SeqCst);
        value
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.sn.load(Ordering::SeqCst) != EMPTY_SN)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
