//! Playback Coordinator: owns one playback session's lifecycle over a
//! `Player` collaborator, including the timeshift coupling to a linked
//! recording — segments appearing, growing, or retiring while playback
//! is live.
//!
//! The resume gate (`apply_timeshift_notice`'s `SegmentUpdated` arm) is the
//! one piece of behavior with numbers worth spelling out: once playback has
//! paused at the live edge (`ReachedEnd` with no more data), it resumes only
//! after the stream has accrued `TIMESHIFT_RESUME_MS` of fresh material
//! beyond where it stalled, whether that's the same segment growing or a
//! brand new one.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::collaborators::{Player, SegmentStore};
use crate::error::{DvrError, Result};
use crate::events::{EventQueue, SessionEvent, Worker};
use crate::registry::{PlaybackSegment, PlaybackSegmentFlags, Segment, SegmentRegistry};
use crate::session::{LockOutcome, SerialNumber, SessionTable, LOCK_RETRY_MS};
use crate::record::TimeshiftNotice;

pub const TIMESHIFT_RESUME_MS: i64 = 2000;
pub const END_GAP_MS: i64 = 1000;

#[derive(Debug, Clone)]
pub struct PlaybackOpenParams {
    pub location: String,
    pub dmx_dev_id: u32,
    pub block_size: u32,
    pub is_timeshift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Uninit,
    Init,
    Start,
    Stop,
    Pause,
    Ff,
    Fb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    FastForward,
    FastBackward,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed {
    pub mode: SpeedMode,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEventKind {
    FirstFrame,
    ReachedEnd,
    TransitionOk,
    NotifyPlaytime,
    Error,
    TransitionFailed,
    KeyFailure,
    NoKey,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlayStatus {
    pub time_cur_ms: i64,
    pub time_end_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerStatusEvent {
    pub kind: PlayerEventKind,
    pub status: PlayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackStartFlags(u32);

impl PlaybackStartFlags {
    pub const STARTED_PAUSED_LIVE: Self = Self(1 << 0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PlaybackStartFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub speed: Option<Speed>,
    pub current_pids: Vec<u16>,
    pub cursor_time_ms: i64,
    pub cursor_size_bytes: u64,
    pub cursor_packets: u64,
    pub full_time_ms: i64,
    pub full_size_bytes: u64,
    pub full_packets: u64,
}

#[derive(Debug, Clone)]
pub enum PlaybackStatusEvent {
    ReachedEnd(PlaybackStatus),
    Other(PlayerEventKind, PlaybackStatus),
}

pub struct PlaybackSession {
    open_params: PlaybackOpenParams,
    player: Box<dyn Player>,
    store: Box<dyn SegmentStore>,
    segments: SegmentRegistry<PlaybackSegment>,
    current_segment_id: u64,
    requested_pids: Vec<u16>,
    state: PlaybackState,
    speed: Option<Speed>,
    seg_status: PlayStatus,
    last_event: Option<PlayerEventKind>,
    event_sink: Box<dyn Fn(PlaybackStatusEvent) + Send + Sync>,
}

impl PlaybackSession {
    pub fn new(
        open_params: PlaybackOpenParams,
        player: Box<dyn Player>,
        store: Box<dyn SegmentStore>,
        event_sink: Box<dyn Fn(PlaybackStatusEvent) + Send + Sync>,
    ) -> Self {
        Self {
            open_params,
            player,
            store,
            segments: SegmentRegistry::new(),
            current_segment_id: 0,
            requested_pids: Vec::new(),
            state: PlaybackState::Uninit,
            speed: None,
            seg_status: PlayStatus::default(),
            last_event: None,
            event_sink,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    fn full_duration_ms(&self) -> i64 {
        self.segments.iter_oldest_to_newest().map(|s| s.segment.duration_ms).sum()
    }

    fn full_size_bytes(&self) -> u64 {
        self.segments.iter_oldest_to_newest().map(|s| s.segment.size_bytes).sum()
    }

    fn full_packets(&self) -> u64 {
        self.segments
            .iter_oldest_to_newest()
            .map(|s| s.segment.packet_count as u64)
            .sum()
    }

    /// Sum of the durations of every segment strictly older than `before_id`.
    fn older_duration_sum(&self, before_id: u64) -> i64 {
        self.segments
            .iter_oldest_to_newest()
            .take_while(|s| s.segment.id != before_id)
            .map(|s| s.segment.duration_ms)
            .sum()
    }

    fn cursor_time_ms(&self) -> i64 {
        self.older_duration_sum(self.current_segment_id) + self.seg_status.time_cur_ms
    }

    fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            speed: self.speed,
            current_pids: self.requested_pids.clone(),
            cursor_time_ms: self.cursor_time_ms(),
            cursor_size_bytes: 0,
            cursor_packets: 0,
            full_time_ms: self.full_duration_ms(),
            full_size_bytes: self.full_size_bytes(),
            full_packets: self.full_packets(),
        }
    }

    pub fn start(&mut self, start_flags: PlaybackStartFlags, pids: Vec<u16>) -> Result<()> {
        let ids = self.store.get_list(&self.open_params.location)?;
        if ids.is_empty() {
            return Err(DvrError::NoSegments);
        }
        for id in &ids {
            let segment = self.store.get_info(&self.open_params.location, *id)?;
            let playback_segment = PlaybackSegment {
                segment,
                location_path: self.open_params.location.clone(),
                requested_pids: pids.clone(),
                flags: PlaybackSegmentFlags::DISPLAYABLE | PlaybackSegmentFlags::CONTINUOUS,
            };
            self.player.add_segment(&playback_segment)?;
            self.segments.push_front(playback_segment);
        }
        self.requested_pids = pids;
        self.current_segment_id = *ids.first().unwrap();
        self.player.seek(self.current_segment_id, 0)?;
        if start_flags.contains(PlaybackStartFlags::STARTED_PAUSED_LIVE) {
            self.player.pause(false)?;
            self.state = PlaybackState::Pause;
        } else {
            self.player.start()?;
            self.state = PlaybackState::Start;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.player.stop(true)?;
        self.segments.clear();
        self.state = PlaybackState::Stop;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.player.pause(true)?;
        self.state = PlaybackState::Pause;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.player.resume()?;
        self.state = PlaybackState::Start;
        Ok(())
    }

    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        let mode = if speed < 0.0 {
            SpeedMode::FastBackward
        } else {
            SpeedMode::FastForward
        };
        let value = speed.abs();
        self.player.set_speed(mode, value)?;
        self.speed = Some(Speed { mode, value });
        self.state = match mode {
            SpeedMode::FastForward => PlaybackState::Ff,
            SpeedMode::FastBackward => PlaybackState::Fb,
        };
        Ok(())
    }

    /// Walks oldest to newest, subtracting each segment's duration from the
    /// requested offset, landing on the segment and in-segment offset that
    /// contain it.
    pub fn seek(&mut self, time_offset_ms: i64) -> Result<()> {
        let mut remaining = time_offset_ms;
        let mut target = None;
        for seg in self.segments.iter_oldest_to_newest() {
            if remaining < seg.segment.duration_ms || target.is_none() {
                target = Some((seg.segment.id, remaining));
            }
            if remaining < seg.segment.duration_ms {
                break;
            }
            remaining -= seg.segment.duration_ms;
        }
        let (segment_id, intra_offset) = target.ok_or(DvrError::NoSegments)?;
        self.player.seek(segment_id, intra_offset.max(0))?;
        self.current_segment_id = segment_id;
        self.seg_status.time_cur_ms = intra_offset.max(0);
        Ok(())
    }

    pub fn update_pids(&mut self, new_pids: Vec<u16>) -> Result<()> {
        for seg in self.segments.iter_newest_to_oldest() {
            self.player.update_segment_pids(seg.segment.id, &new_pids)?;
        }
        self.requested_pids = new_pids;
        Ok(())
    }

    pub fn apply_player_event(&mut self, event: PlayerStatusEvent) {
        self.seg_status.time_cur_ms = event.status.time_cur_ms;
        self.seg_status.time_end_ms = event.status.time_end_ms;
        self.last_event = Some(event.kind);

        if event.kind == PlayerEventKind::ReachedEnd {
            self.state = PlaybackState::Pause;
            let cursor = self.cursor_time_ms();
            let full = self.full_duration_ms();
            if !self.open_params.is_timeshift && cursor + END_GAP_MS >= full {
                (self.event_sink)(PlaybackStatusEvent::ReachedEnd(self.status()));
            }
            // timeshift, or non-timeshift short of the end gap: the player
            // will keep delivering REACHED_END while it waits for more data
            // or the recording to finish, nothing to forward yet.
            return;
        }
        (self.event_sink)(PlaybackStatusEvent::Other(event.kind, self.status()));
    }

    /// Folds a timeshift notice from the linked recording into this
    /// session's segment registry, resuming playback if it had stalled at
    /// the live edge and enough new data has now accrued.
    pub fn apply_timeshift_notice(&mut self, notice: TimeshiftNotice) {
        match notice {
            TimeshiftNotice::SegmentAdded(segment) => {
                if self.segments.is_empty() {
                    warn!("segment added notice with no prior segments, ignoring");
                    return;
                }
                let id = segment.id;
                let playback_segment = PlaybackSegment {
                    segment,
                    location_path: self.open_params.location.clone(),
                    requested_pids: self.requested_pids.clone(),
                    flags: PlaybackSegmentFlags::DISPLAYABLE | PlaybackSegmentFlags::CONTINUOUS,
                };
                if let Err(e) = self.player.add_segment(&playback_segment) {
                    warn!(error = %e, segment = id, "failed to add timeshift segment");
                    return;
                }
                self.segments.push_front(playback_segment);
                self.maybe_resume();
            }
            TimeshiftNotice::SegmentUpdated(segment) => {
                let id = segment.id;
                let is_current = id == self.current_segment_id;
                if let Some(existing) = self.segments.find_by_id_mut(id) {
                    existing.segment = segment;
                }
                if is_current {
                    self.maybe_resume();
                } else {
                    self.maybe_resume_from_newer(id);
                }
            }
            TimeshiftNotice::SegmentRemoved(id) => {
                if self.segments.last().map(|s| s.segment.id) != Some(id) {
                    warn!(segment = id, "segment removed notice for a non-oldest segment");
                }
                if let Err(e) = self.player.remove_segment(id) {
                    warn!(error = %e, segment = id, "failed to remove retired segment");
                }
                self.segments.remove_by_id(id);
            }
        }
    }

    /// Resume gate for growth on the segment playback is stalled in.
    fn maybe_resume(&mut self) {
        if !self.stalled_at_live_edge() {
            return;
        }
        let Some(current) = self.segments.find_by_id(self.current_segment_id) else {
            return;
        };
        let current_gained =
            current.segment.duration_ms >= self.seg_status.time_cur_ms + TIMESHIFT_RESUME_MS;
        if current_gained {
            self.fire_resume();
        }
    }

    /// Resume gate for a newer segment accruing enough material on its own.
    fn maybe_resume_from_newer(&mut self, updated_id: u64) {
        if !self.stalled_at_live_edge() {
            return;
        }
        let is_newer = self
            .segments
            .iter_oldest_to_newest()
            .skip_while(|s| s.segment.id != self.current_segment_id)
            .any(|s| s.segment.id == updated_id);
        if !is_newer {
            return;
        }
        let newer_accrued = self
            .segments
            .find_by_id(updated_id)
            .map(|s| s.segment.duration_ms >= TIMESHIFT_RESUME_MS)
            .unwrap_or(false);
        if newer_accrued {
            self.fire_resume();
        }
    }

    fn stalled_at_live_edge(&self) -> bool {
        self.last_event == Some(PlayerEventKind::ReachedEnd) && self.state == PlaybackState::Pause
    }

    fn fire_resume(&mut self) {
        if let Err(e) = self.player.resume() {
            warn!(error = %e, "resume after timeshift growth failed");
            return;
        }
        self.state = PlaybackState::Start;
        self.last_event = None;
    }
}

pub struct PlaybackCoordinatorInner {
    table: SessionTable<PlaybackSession>,
    queue: EventQueue<PlayerStatusEvent>,
}

impl Default for PlaybackCoordinatorInner {
    fn default() -> Self {
        Self {
            table: SessionTable::new(),
            queue: EventQueue::new(),
        }
    }
}

pub struct PlaybackCoordinator {
    inner: Arc<PlaybackCoordinatorInner>,
    worker: Worker,
}

impl Default for PlaybackCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PlaybackCoordinatorInner::default()),
            worker: Worker::new(),
        }
    }

    pub fn open(
        &self,
        player: Box<dyn Player>,
        store: Box<dyn SegmentStore>,
        open_params: PlaybackOpenParams,
        event_sink: Box<dyn Fn(PlaybackStatusEvent) + Send + Sync>,
    ) -> Result<SerialNumber> {
        let session = PlaybackSession::new(open_params, player, store, event_sink);
        let sn = self.inner.table.open(session)?;
        let inner = self.inner.clone();
        self.worker
            .acquire(move |running| std::thread::spawn(move || pb_worker_loop(inner, running)));
        Ok(sn)
    }

    pub fn start(&self, sn: SerialNumber, start_flags: PlaybackStartFlags, pids: Vec<u16>) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.start(start_flags, pids))
            .ok_or(DvrError::Closed)?
    }

    pub fn stop(&self, sn: SerialNumber) -> Result<()> {
        self.inner.table.with_locked(sn, |s| s.stop()).ok_or(DvrError::Closed)?
    }

    pub fn pause(&self, sn: SerialNumber) -> Result<()> {
        self.inner.table.with_locked(sn, |s| s.pause()).ok_or(DvrError::Closed)?
    }

    pub fn resume(&self, sn: SerialNumber) -> Result<()> {
        self.inner.table.with_locked(sn, |s| s.resume()).ok_or(DvrError::Closed)?
    }

    pub fn set_speed(&self, sn: SerialNumber, speed: f32) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.set_speed(speed))
            .ok_or(DvrError::Closed)?
    }

    pub fn seek(&self, sn: SerialNumber, time_offset_ms: i64) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.seek(time_offset_ms))
            .ok_or(DvrError::Closed)?
    }

    pub fn update_pids(&self, sn: SerialNumber, pids: Vec<u16>) -> Result<()> {
        self.inner
            .table
            .with_locked(sn, |s| s.update_pids(pids))
            .ok_or(DvrError::Closed)?
    }

    pub fn close(&self, sn: SerialNumber) -> Option<PlaybackSession> {
        let session = self.inner.table.close(sn);
        self.worker.release();
        session
    }

    /// Ingress for the player collaborator's asynchronous callback.
    pub fn notify(&self, sn: SerialNumber, event: PlayerStatusEvent) {
        self.inner.queue.push(SessionEvent { sn, payload: event });
    }

    /// Called by the owning wrapper's timeshift hook, directly rather than
    /// through the event queue: these notices originate from the record
    /// coordinator's own worker thread, already off any session lock.
    pub fn apply_timeshift_notice(&self, sn: SerialNumber, notice: TimeshiftNotice) {
        self.inner
            .table
            .with_locked(sn, |s| s.apply_timeshift_notice(notice));
    }
}

fn pb_worker_loop(inner: Arc<PlaybackCoordinatorInner>, running: Arc<std::sync::atomic::AtomicBool>) {
    let timeout = Duration::from_millis(LOCK_RETRY_MS);
    while running.load(std::sync::atomic::Ordering::SeqCst) {
        inner.queue.wait_for_work(timeout);
        for event in inner.queue.drain() {
            loop {
                match inner
                    .table
                    .try_locked_for(event.sn, timeout, |s| s.apply_player_event(event.payload))
                {
                    LockOutcome::Done(()) => break,
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
    use crate::testutil::{FakePlayer, FakeSegmentStore};

    fn segment(id: u64, duration_ms: i64) -> Segment {
        Segment {
            id,
            duration_ms,
            size_bytes: 0,
            packet_count: 0,
            pids: Vec::new(),
        }
    }

    fn session_with_segments(durations: &[i64]) -> PlaybackSession {
        let store = FakeSegmentStore::with_segments(
            "/pb/0",
            durations
                .iter()
                .enumerate()
                .map(|(i, d)| segment(i as u64, *d))
                .collect(),
        );
        let mut session = PlaybackSession::new(
            PlaybackOpenParams {
                location: "/pb/0".into(),
                dmx_dev_id: 0,
                block_size: 4096,
                is_timeshift: false,
            },
            Box::new(FakePlayer::new()),
            Box::new(store),
            Box::new(|_| {}),
        );
        session.start(PlaybackStartFlags::empty(), vec![100]).unwrap();
        session
    }

    // scenario 4: seek(7500) across durations [3000, 4000, 5000] -> (2, 500).
    #[test]
    fn seek_lands_on_expected_segment_and_offset() {
        let mut session = session_with_segments(&[3000, 4000, 5000]);
        session.seek(7500).unwrap();
        assert_eq!(session.current_segment_id, 2);
        assert_eq!(session.seg_status.time_cur_ms, 500);
    }

    // scenario 6: resume gate at seg_status.time_cur_ms=3000 in a 3000ms
    // segment; growing to 3500 doesn't resume, 5100 does.
    #[test]
    fn resume_gate_fires_only_past_the_threshold() {
        let mut session = session_with_segments(&[3000]);
        session.current_segment_id = 0;
        session.seg_status.time_cur_ms = 3000;
        session.apply_player_event(PlayerStatusEvent {
            kind: PlayerEventKind::ReachedEnd,
            status: PlayStatus {
                time_cur_ms: 3000,
                time_end_ms: 3000,
            },
        });
        assert_eq!(session.state(), PlaybackState::Pause);

        session.apply_timeshift_notice(TimeshiftNotice::SegmentUpdated(segment(0, 3500)));
        assert_eq!(session.state(), PlaybackState::Pause, "3500 < 3000+2000 must not resume");

        session.apply_timeshift_notice(TimeshiftNotice::SegmentUpdated(segment(0, 5100)));
        assert_eq!(session.state(), PlaybackState::Start, "5100 >= 3000+2000 must resume");
    }

    #[test]
    fn segment_removed_notice_drops_the_oldest_segment() {
        let mut session = session_with_segments(&[1000, 2000]);
        assert_eq!(session.segments.len(), 2);
        session.apply_timeshift_notice(TimeshiftNotice::SegmentRemoved(0));
        assert_eq!(session.segments.len(), 1);
        assert!(session.segments.find_by_id(0).is_none());
    }
}
