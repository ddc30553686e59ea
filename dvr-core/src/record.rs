//! Record Coordinator: owns one recording's lifecycle (open, start, pid
//! updates, rollover/retention, stop, close) over a `Recorder` collaborator,
//! dispatching status events off a worker thread.
//!
//! Retention and rollover are evaluated together on every status update
//! (`check_retention`): a size cap, a time cap, and a plain `segment_size`
//! rollover can all fire on the same event. Per the size-before-time
//! decision recorded in DESIGN.md, the size cap is checked first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collaborators::{PidAction, PidRequest, Recorder, RecorderSegInfo, SegmentStore};
use crate::error::{DvrError, Result};
use crate::events::{EventQueue, SessionEvent, Worker};
use crate::registry::{PidKind, RecordFlags, Segment, SegmentRegistry};
use crate::session::{LockOutcome, SerialNumber, SessionTable, LOCK_RETRY_MS};

#[derive(Debug, Clone)]
pub struct RecordOpenParams {
    pub location: String,
    pub dmx_dev_id: u32,
    pub flags: RecordFlags,
    pub max_time_ms: i64,
    pub max_size_bytes: u64,
    pub segment_size_bytes: u64,
    pub is_timeshift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Opened,
    Started,
    Stopped,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegStatus {
    pub duration_ms: i64,
    pub size_bytes: u64,
    pub packet_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStatus {
    pub total_time_ms: i64,
    pub total_size_bytes: u64,
    pub total_packets: u64,
}

impl SessionStatus {
    pub fn add(&mut self, seg: &SegStatus) {
        self.total_time_ms += seg.duration_ms;
        self.total_size_bytes += seg.size_bytes;
        self.total_packets += seg.packet_count as u64;
    }
}

#[derive(Debug, Clone)]
pub struct RecordStatus {
    pub state: RecordState,
    pub aggregate: SessionStatus,
    pub current_pids: Vec<PidRequest>,
}

/// What the recorder collaborator reports as segment progress arrives.
/// Mirrors the four recorder states a real device pipeline passes through.
#[derive(Debug, Clone)]
pub enum RecorderStatusEvent {
    Opened,
    Started(SegStatus),
    Stopped(SegStatus),
    Closed,
}

#[derive(Debug, Clone)]
pub enum RecordStatusEvent {
    Opened,
    Started(RecordStatus),
    Stopped(RecordStatus),
    Closed,
}

/// A retention or rollover action a record session wants reflected on any
/// linked timeshift playback session. Carried out of `RecordSession`
/// methods as plain data rather than reaching across into `playback`
/// directly.
#[derive(Debug, Clone)]
pub enum TimeshiftNotice {
    SegmentAdded(Segment),
    SegmentUpdated(Segment),
    SegmentRemoved(u64),
}

pub struct RecordSession {
    open_params: RecordOpenParams,
    recorder: Box<dyn Recorder>,
    store: Box<dyn SegmentStore>,
    segments: SegmentRegistry<Segment>,
    next_segment_id: u64,
    current_segment_id: u64,
    current_pids: Vec<PidRequest>,
    seg_status: SegStatus,
    finished_totals: SessionStatus,
    state: RecordState,
    event_sink: Box<dyn Fn(RecordStatusEvent) + Send + Sync>,
}

impl RecordSession {
    pub fn new(
        open_params: RecordOpenParams,
        recorder: Box<dyn Recorder>,
        store: Box<dyn SegmentStore>,
        event_sink: Box<dyn Fn(RecordStatusEvent) + Send + Sync>,
    ) -> Self {
        Self {
            open_params,
            recorder,
            store,
            segments: SegmentRegistry::new(),
            next_segment_id: 0,
            current_segment_id: 0,
            current_pids: Vec::new(),
            seg_status: SegStatus::default(),
            finished_totals: SessionStatus::default(),
            state: RecordState::Opened,
            event_sink,
        }
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    fn status(&self) -> RecordStatus {
        let mut aggregate = self.finished_totals;
        aggregate.add(&self.seg_status);
        RecordStatus {
            state: self.state,
            aggregate,
            current_pids: self.current_pids.clone(),
        }
    }

    pub fn start(&mut self, pids: Vec<PidRequest>) -> Result<()> {
        self.current_segment_id = self.next_segment_id;
        self.next_segment_id += 1;
        self.recorder
            .start_segment(&self.open_params.location, self.current_segment_id, &pids)?;
        self.current_pids = pids;
        self.state = RecordState::Started;
        self.segments.push_front(Segment {
            id: self.current_segment_id,
            duration_ms: 0,
            size_bytes: 0,
            packet_count: 0,
            pids: Vec::new(),
        });
        Ok(())
    }

    /// Applies an explicit-close PID diff: any pid previously recording but
    /// absent from `new_pids` gets a synthesized `Close` action so the
    /// recorder is told to drop it rather than relying on its absence.
    pub fn update_pids(&mut self, mut new_pids: Vec<PidRequest>) -> Result<Option<TimeshiftNotice>> {
        for existing in &self.current_pids {
            if existing.action == PidAction::Close {
                continue;
            }
            if !new_pids.iter().any(|p| p.pid == existing.pid) {
                new_pids.push(PidRequest {
                    pid: existing.pid,
                    kind: existing.kind,
                    action: PidAction::Close,
                });
            }
        }
        self.rollover(new_pids)
    }

    /// Closes out the current segment and opens the next one with `pids`,
    /// shared by both `segment_size` rollover and explicit pid updates.
    ///
    /// The recorder's own `next_segment` reply only carries pid
    /// acknowledgements at this point, not final stats — the outgoing
    /// segment's duration/size/packets are already current from the last
    /// periodic status, so rollover finalizes from `seg_status` rather than
    /// overwriting it.
    fn rollover(&mut self, pids: Vec<PidRequest>) -> Result<Option<TimeshiftNotice>> {
        self.recorder.next_segment(&pids)?;
        let notice = self.finalize_current();
        self.current_segment_id = self.next_segment_id;
        self.next_segment_id += 1;
        self.current_pids = pids
            .into_iter()
            .map(|mut p| {
                p.action = PidAction::Keep;
                p
            })
            .filter(|p| !matches!(p.action, PidAction::Close))
            .collect();
        self.seg_status = SegStatus::default();
        self.segments.push_front(Segment {
            id: self.current_segment_id,
            duration_ms: 0,
            size_bytes: 0,
            packet_count: 0,
            pids: Vec::new(),
        });
        Ok(notice)
    }

    /// Folds `self.seg_status` (the current segment's last known live stats)
    /// into the registry entry and the session's running totals. The entry
    /// was inserted zero-valued by `start`/`rollover` and kept current by
    /// every `Started` status since; this just stops updating it.
    fn finalize_current(&mut self) -> Option<TimeshiftNotice> {
        self.apply_final_stats(self.seg_status)
    }

    fn apply_final_stats(&mut self, stats: SegStatus) -> Option<TimeshiftNotice> {
        if let Some(entry) = self.segments.find_by_id_mut(self.current_segment_id) {
            entry.duration_ms = stats.duration_ms;
            entry.size_bytes = stats.size_bytes;
            entry.packet_count = stats.packet_count;
        }
        self.finished_totals.add(&stats);
        if self.open_params.is_timeshift {
            self.segments
                .find_by_id(self.current_segment_id)
                .cloned()
                .map(TimeshiftNotice::SegmentAdded)
        } else {
            None
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        let info = self.recorder.stop_segment()?;
        self.apply_final_stats(SegStatus {
            duration_ms: info.duration_ms,
            size_bytes: info.size_bytes,
            packet_count: info.packet_count,
        });
        self.state = RecordState::Stopped;
        (self.event_sink)(RecordStatusEvent::Stopped(self.status()));
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.recorder.close()?;
        self.state = RecordState::Closed;
        (self.event_sink)(RecordStatusEvent::Closed);
        Ok(())
    }

    /// Folds a recorder status event into this session's live segment
    /// status, then runs retention/rollover. Returns any timeshift notices
    /// produced, in order.
    pub fn apply_status_event(&mut self, event: RecorderStatusEvent) -> Vec<TimeshiftNotice> {
        match event {
            RecorderStatusEvent::Opened => {
                (self.event_sink)(RecordStatusEvent::Opened);
                Vec::new()
            }
            RecorderStatusEvent::Started(seg) => {
                self.seg_status = seg;
                let current = self.segments.find_by_id_mut(self.current_segment_id).map(|entry| {
                    entry.duration_ms = seg.duration_ms;
                    entry.size_bytes = seg.size_bytes;
                    entry.packet_count = seg.packet_count;
                    entry.clone()
                });
                (self.event_sink)(RecordStatusEvent::Started(self.status()));
                let mut notices = Vec::new();
                if self.open_params.is_timeshift {
                    if let Some(current) = current {
                        notices.push(TimeshiftNotice::SegmentUpdated(current));
                    }
                }
                notices.extend(self.check_retention());
                notices
            }
            RecorderStatusEvent::Stopped(seg) => {
                self.seg_status = seg;
                Vec::new()
            }
            RecorderStatusEvent::Closed => Vec::new(),
        }
    }

    fn check_retention(&mut self) -> Vec<TimeshiftNotice> {
        let mut notices = Vec::new();
        if self.open_params.max_size_bytes > 0
            && self.total_size_bytes() >= self.open_params.max_size_bytes
        {
            if let Some(notice) = self.apply_cap_exceeded() {
                notices.push(notice);
            }
            if self.state == RecordState::Closed {
                return notices;
            }
        }
        if self.open_params.max_time_ms > 0
            && self.total_time_ms() >= self.open_params.max_time_ms
        {
            if let Some(notice) = self.apply_cap_exceeded() {
                notices.push(notice);
            }
            if self.state == RecordState::Closed {
                return notices;
            }
        }
        if self.open_params.segment_size_bytes > 0
            && self.seg_status.size_bytes >= self.open_params.segment_size_bytes
        {
            let pids = self.current_pids.clone();
            match self.rollover(pids) {
                Ok(Some(notice)) => notices.push(notice),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "rollover failed"),
            }
        }
        notices
    }

    fn total_size_bytes(&self) -> u64 {
        self.finished_totals.total_size_bytes + self.seg_status.size_bytes
    }

    fn total_time_ms(&self) -> i64 {
        self.finished_totals.total_time_ms + self.seg_status.duration_ms
    }

    /// Timeshift: evicts the oldest segment to stay under the cap, unless
    /// it's the only one left, in which case there's nothing safe to evict.
    /// Non-timeshift: the cap closes the recording outright.
    fn apply_cap_exceeded(&mut self) -> Option<TimeshiftNotice> {
        if self.open_params.is_timeshift {
            if self.segments.len() <= 1 {
                warn!("retention cap exceeded with only one segment, cannot evict");
                return None;
            }
            if let Some(oldest) = self.segments.pop_back() {
                if let Err(e) = self.store.delete(&self.open_params.location, oldest.id) {
                    warn!(error = %e, segment = oldest.id, "failed to delete retired segment");
                }
                self.finished_totals.total_size_bytes = self
                    .finished_totals
                    .total_size_bytes
                    .saturating_sub(oldest.size_bytes);
                self.finished_totals.total_time_ms -= oldest.duration_ms;
                self.finished_totals.total_packets = self
                    .finished_totals
                    .total_packets
                    .saturating_sub(oldest.packet_count as u64);
                return Some(TimeshiftNotice::SegmentRemoved(oldest.id));
            }
            None
        } else {
            info!("retention cap exceeded, closing recording");
            if let Err(e) = self.recorder.close() {
                warn!(error = %e, "recorder close on cap-exceeded failed");
            }
            self.state = RecordState::Closed;
            (self.event_sink)(RecordStatusEvent::Closed);
            None
        }
    }
}

pub struct RecordCoordinatorInner {
    table: SessionTable<RecordSession>,
    queue: EventQueue<RecorderStatusEvent>,
}

impl Default for RecordCoordinatorInner {
    fn default() -> Self {
        Self {
            table: SessionTable::new(),
            queue: EventQueue::new(),
        }
    }
}

pub struct RecordCoordinator {
    inner: Arc<RecordCoordinatorInner>,
    worker: Worker,
    on_timeshift: Arc<dyn Fn(SerialNumber, TimeshiftNotice) + Send + Sync>,
}

impl RecordCoordinator {
    pub fn new(on_timeshift: Arc<dyn Fn(SerialNumber, TimeshiftNotice) + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(RecordCoordinatorInner::default()),
            worker: Worker::new(),
            on_timeshift,
        }
    }

    pub fn open(
        &self,
        recorder: Box<dyn Recorder>,
        store: Box<dyn SegmentStore>,
        open_params: RecordOpenParams,
        event_sink: Box<dyn Fn(RecordStatusEvent) + Send + Sync>,
    ) -> Result<SerialNumber> {
        let session = RecordSession::new(open_params, recorder, store, event_sink);
        let sn = self.inner.table.open(session)?;
        let inner = self.inner.clone();
        let on_timeshift = self.on_timeshift.clone();
        self.worker.acquire(move |running| {
            std::thread::spawn(move || worker_loop(inner, on_timeshift, running))
        });
        Ok(sn)
    }

    pub fn start(&self, sn: SerialNumber, pids: Vec<PidRequest>) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.start(pids))
            .ok_or(DvrError::Closed)?
    }

    pub fn update_pids(&self, sn: SerialNumber, pids: Vec<PidRequest>) -> Result<()> {
        let notice = self
            .inner
            .table
            .with_locked(sn, |s| s.update_pids(pids))
            .ok_or(DvrError::Closed)??;
        if let Some(notice) = notice {
            (self.on_timeshift)(sn, notice);
        }
        Ok(())
    }

    pub fn stop(&self, sn: SerialNumber) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.stop())
            .ok_or(DvrError::Closed)?
    }

    pub fn close(&self, sn: SerialNumber) -> Result<()> {
        let result = self
            .inner
            .table
            .with_locked(sn, |s| s.close())
            .ok_or(DvrError::Closed)?;
        self.inner.table.close(sn);
        self.worker.release();
        result
    }

    pub fn get_status(&self, sn: SerialNumber) -> Option<RecordStatus> {
        self.inner.table.with_locked(sn, |s| s.status())
    }

    /// Ingress for the recorder collaborator's asynchronous callback.
    pub fn notify(&self, sn: SerialNumber, event: RecorderStatusEvent) {
        self.inner.queue.push(SessionEvent { sn, payload: event });
    }
}

fn worker_loop(
    inner: Arc<RecordCoordinatorInner>,
    on_timeshift: Arc<dyn Fn(SerialNumber, TimeshiftNotice) + Send + Sync>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    let timeout = Duration::from_millis(LOCK_RETRY_MS);
    while running.load(std::sync::atomic::Ordering::SeqCst) {
        inner.queue.wait_for_work(timeout);
        for event in inner.queue.drain() {
            loop {
                match inner
                    .table
                    .try_locked_for(event.sn, timeout, |s| s.apply_status_event(event.payload.clone()))
                {
                    LockOutcome::Done(notices) => {
                        for notice in notices {
                            on_timeshift(event.sn, notice);
                        }
                        break;
                    }
                    LockOutcome::Invalid => break,
                    LockOutcome::TimedOut => {
                        if !running.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeRecorder, FakeSegmentStore};

    fn pid(n: u16) -> PidRequest {
        PidRequest {
            pid: n,
            kind: PidKind::Video,
            action: PidAction::Create,
        }
    }

    fn open_params(is_timeshift: bool, max_time_ms: i64, max_size_bytes: u64, segment_size_bytes: u64) -> RecordOpenParams {
        RecordOpenParams {
            location: "/rec/0".into(),
            dmx_dev_id: 0,
            flags: RecordFlags::empty(),
            max_time_ms,
            max_size_bytes,
            segment_size_bytes,
            is_timeshift,
        }
    }

    // scenario 1: non-timeshift rollover at segment_size=1MiB.
    #[test]
    fn segment_size_rollover_closes_at_cap() {
        const MIB: u64 = 1024 * 1024;
        let mut session = RecordSession::new(
            open_params(false, 0, 0, MIB),
            Box::new(FakeRecorder::new()),
            Box::new(FakeSegmentStore::new()),
            Box::new(|_| {}),
        );
        session.start(vec![pid(100)]).unwrap();

        for size in [MIB / 2, (MIB * 9) / 10] {
            let notices = session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
                duration_ms: 0,
                size_bytes: size,
                packet_count: 0,
            }));
            assert!(notices.is_empty());
            assert_eq!(session.state(), RecordState::Started);
        }

        // crossing the cap triggers a rollover, not a close, for segment_size.
        session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
            duration_ms: 0,
            size_bytes: (MIB * 11) / 10,
            packet_count: 0,
        }));
        assert_eq!(session.state(), RecordState::Started);
        // the finalized first segment plus the zero-stats descriptor for the
        // new current one.
        assert_eq!(session.segments.len(), 2);
    }

    // scenario 2: time-cap close at max_time_ms=5000.
    #[test]
    fn max_time_closes_non_timeshift_recording() {
        let mut session = RecordSession::new(
            open_params(false, 5000, 0, 0),
            Box::new(FakeRecorder::new()),
            Box::new(FakeSegmentStore::new()),
            Box::new(|_| {}),
        );
        session.start(vec![pid(100)]).unwrap();

        for duration_ms in [2000, 4000] {
            session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
                duration_ms,
                size_bytes: 0,
                packet_count: 0,
            }));
            assert_eq!(session.state(), RecordState::Started);
        }

        session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
            duration_ms: 5001,
            size_bytes: 0,
            packet_count: 0,
        }));
        assert_eq!(session.state(), RecordState::Closed);
    }

    // scenario 3: timeshift retention at max_time_ms=10000 with 3x4000ms segments.
    #[test]
    fn timeshift_retention_evicts_oldest_segment() {
        let mut session = RecordSession::new(
            open_params(true, 10_000, 0, 0),
            Box::new(FakeRecorder::new()),
            Box::new(FakeSegmentStore::new()),
            Box::new(|_| {}),
        );
        session.start(vec![pid(100)]).unwrap();

        // first two segments accrue under the cap via explicit rollovers.
        for _ in 0..2 {
            session
                .update_pids(vec![pid(100)])
                .unwrap();
            session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
                duration_ms: 4000,
                size_bytes: 0,
                packet_count: 0,
            }));
        }
        // the live segment plus the two finalized ones.
        assert_eq!(session.segments.len(), 3);

        // third segment crosses the cap (4000*3=12000 >= 10000): oldest evicted.
        session.update_pids(vec![pid(100)]).unwrap();
        let notices = session.apply_status_event(RecorderStatusEvent::Started(SegStatus {
            duration_ms: 4000,
            size_bytes: 0,
            packet_count: 0,
        }));
        assert!(notices
            .iter()
            .any(|n| matches!(n, TimeshiftNotice::SegmentRemoved(_))));
        assert!(notices
            .iter()
            .any(|n| matches!(n, TimeshiftNotice::SegmentUpdated(_))));
        assert_eq!(session.segments.len(), 3);
    }

    #[test]
    fn update_pids_synthesizes_close_for_dropped_pid() {
        let mut session = RecordSession::new(
            open_params(false, 0, 0, 0),
            Box::new(FakeRecorder::new()),
            Box::new(FakeSegmentStore::new()),
            Box::new(|_| {}),
        );
        session.start(vec![pid(100), pid(200)]).unwrap();
        session.update_pids(vec![pid(100)]).unwrap();
        assert_eq!(session.current_pids.len(), 1);
        assert_eq!(session.current_pids[0].pid, 100);
    }
}
