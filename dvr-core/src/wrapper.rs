//! Top-level entry point: owns the record and playback coordinators and the
//! single optional timeshift link between one recording and one playback
//! session.
//!
//! Cross-session notification never nests the two coordinators' locks.
//! `RecordSession` methods return `TimeshiftNotice` values under only the
//! record session's lock; the hook below runs after that lock is released
//! and only then (and separately) takes the playback session's lock via
//! `PlaybackCoordinator::apply_timeshift_notice`. The coupling mutex itself
//! is released before the hook calls into playback, so at most one of the
//! three locks (coupling, record session, playback session) is ever held
//! at a time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::playback::PlaybackCoordinator;
use crate::record::RecordCoordinator;
use crate::session::SerialNumber;

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeshiftCoupling {
    pub rec_sn: Option<SerialNumber>,
    pub playback_sn: Option<SerialNumber>,
}

pub struct Wrapper {
    pub record: RecordCoordinator,
    pub playback: Arc<PlaybackCoordinator>,
    timeshift: Arc<Mutex<TimeshiftCoupling>>,
}

impl Default for Wrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Wrapper {
    pub fn new() -> Self {
        let playback = Arc::new(PlaybackCoordinator::new());
        let timeshift = Arc::new(Mutex::new(TimeshiftCoupling::default()));

        let hook_playback = playback.clone();
        let hook_timeshift = timeshift.clone();
        let on_timeshift = Arc::new(move |rec_sn: SerialNumber, notice| {
            let playback_sn = {
                let coupling = hook_timeshift.lock();
                if coupling.rec_sn != Some(rec_sn) {
                    return;
                }
                coupling.playback_sn
            };
            if let Some(playback_sn) = playback_sn {
                hook_playback.apply_timeshift_notice(playback_sn, notice);
            }
        });

        Self {
            record: RecordCoordinator::new(on_timeshift),
            playback,
            timeshift,
        }
    }

    pub fn link_timeshift(&self, rec_sn: SerialNumber, playback_sn: SerialNumber) {
        let mut coupling = self.timeshift.lock();
        coupling.rec_sn = Some(rec_sn);
        coupling.playback_sn = Some(playback_sn);
    }

    pub fn unlink_timeshift(&self) {
        let mut coupling = self.timeshift.lock();
        *coupling = TimeshiftCoupling::default();
    }
}
