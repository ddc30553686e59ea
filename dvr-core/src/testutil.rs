//! Scripted fakes for the collaborator traits, used by `record` and
//! `playback`'s own unit tests. Kept minimal: enough state to drive the
//! scenarios those tests exercise, nothing that looks like a real pipeline.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::collaborators::{Player, PidRequest, Recorder, RecorderSegInfo, SegmentStore};
use crate::error::{DvrError, Result};
use crate::playback::SpeedMode;
use crate::registry::{PlaybackSegment, Segment};

#[derive(Default)]
pub struct FakeRecorder {
    pub started: Vec<(String, u64)>,
    pub closed: bool,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Recorder for FakeRecorder {
    fn start_segment(&mut self, location: &str, segment_id: u64, _pids: &[PidRequest]) -> Result<()> {
        self.started.push((location.to_string(), segment_id));
        Ok(())
    }

    fn next_segment(&mut self, _pids: &[PidRequest]) -> Result<RecorderSegInfo> {
        Ok(RecorderSegInfo::default())
    }

    fn stop_segment(&mut self) -> Result<RecorderSegInfo> {
        Ok(RecorderSegInfo::default())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlayer {
    pub added_segments: Vec<u64>,
    pub removed_segments: Vec<u64>,
    pub seeks: Vec<(u64, i64)>,
    pub started: bool,
    pub paused: bool,
}

impl FakePlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Player for FakePlayer {
    fn add_segment(&mut self, segment: &PlaybackSegment) -> Result<()> {
        self.added_segments.push(segment.segment.id);
        Ok(())
    }

    fn remove_segment(&mut self, segment_id: u64) -> Result<()> {
        self.removed_segments.push(segment_id);
        Ok(())
    }

    fn update_segment_pids(&mut self, _segment_id: u64, _pids: &[u16]) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.paused = false;
        Ok(())
    }

    fn stop(&mut self, _clear: bool) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn pause(&mut self, _flush: bool) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.paused = false;
        self.started = true;
        Ok(())
    }

    fn seek(&mut self, segment_id: u64, offset_ms: i64) -> Result<()> {
        self.seeks.push((segment_id, offset_ms));
        Ok(())
    }

    fn set_speed(&mut self, _mode: SpeedMode, _value: f32) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSegmentStore {
    segments: Mutex<HashMap<String, Vec<Segment>>>,
}

impl FakeSegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segments(location: &str, segments: Vec<Segment>) -> Self {
        let store = Self::new();
        store.segments.lock().insert(location.to_string(), segments);
        store
    }
}

impl SegmentStore for FakeSegmentStore {
    fn get_list(&self, location: &str) -> Result<Vec<u64>> {
        Ok(self
            .segments
            .lock()
            .get(location)
            .map(|segs| segs.iter().map(|s| s.id).collect())
            .unwrap_or_default())
    }

    fn get_info(&self, location: &str, segment_id: u64) -> Result<Segment> {
        self.segments
            .lock()
            .get(location)
            .and_then(|segs| segs.iter().find(|s| s.id == segment_id).cloned())
            .ok_or(DvrError::NoSegments)
    }

    fn delete(&self, location: &str, segment_id: u64) -> Result<()> {
        if let Some(segs) = self.segments.lock().get_mut(location) {
            segs.retain(|s| s.id != segment_id);
        }
        Ok(())
    }
}
