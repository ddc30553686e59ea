//! Event Queue & Worker: a single-consumer FIFO per kind (record or
//! playback), drained by a dedicated, refcounted worker thread.
//!
//! Producers are the Recorder/Player collaborator callbacks, which may run
//! on arbitrary threads; they only ever call `EventQueue::push`. The worker
//! never holds a session lock while invoking the application's event sink —
//! status is assembled under the lock and delivered after release (see
//! `record::RecordSession::apply_status_event` / `playback::PlaybackSession`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::session::SerialNumber;

pub struct SessionEvent<P> {
    pub sn: SerialNumber,
    pub payload: P,
}

pub struct EventQueue<P> {
    queue: Mutex<VecDeque<SessionEvent<P>>>,
    cond: Condvar,
}

impl<P> Default for EventQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventQueue<P> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, event: SessionEvent<P>) {
        self.queue.lock().push_back(event);
        self.cond.notify_one();
    }

    /// Drains everything queued so far. Called once per worker wake.
    pub fn drain(&self) -> Vec<SessionEvent<P>> {
        self.queue.lock().drain(..).collect()
    }

    /// Blocks until an event is queued or `timeout` elapses, whichever is
    /// first — the timeout is what lets the worker re-check its shutdown
    /// flag promptly.
    pub fn wait_for_work(&self, timeout: Duration) {
        let mut guard = self.queue.lock();
        if guard.is_empty() {
            self.cond.wait_for(&mut guard, timeout);
        }
    }
}

/// Refcounted worker lifecycle: the first `acquire` spawns the dispatch
/// thread; the last `release` signals shutdown and joins it.
pub struct Worker {
    running: Arc<AtomicBool>,
    refcount: AtomicUsize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            refcount: AtomicUsize::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn acquire(&self, spawn: impl FnOnce(Arc<AtomicBool>) -> JoinHandle<()>) {
        if self.refcount.fetch_add(1, Ordering::SeqCst) == 0 {
            self.running.store(true, Ordering::SeqCst);
            *self.handle.lock() = Some(spawn(self.running.clone()));
        }
    }

    pub fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fifo_ordering_within_one_session() {
        let q: EventQueue<u32> = EventQueue::new();
        let sn = SerialNumber::for_test(1);
        q.push(SessionEvent { sn, payload: 1 });
        q.push(SessionEvent { sn, payload: 2 });
        q.push(SessionEvent { sn, payload: 3 });
        let drained: Vec<u32> = q.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn worker_spawns_once_and_joins_on_last_release() {
        let worker = Worker::new();
        let spawned = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let spawned = spawned.clone();
            worker.acquire(move |running| {
                spawned.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
            });
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        worker.release();
        worker.release();
        worker.release();
        assert!(worker.handle.lock().is_none());
    }
}
