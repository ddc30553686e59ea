//! The seams between coordination logic and the device-facing pieces this
//! crate does not implement: the actual recorder/player pipelines and
//! wherever segment files live. Production callers provide real
//! implementations; tests use `testutil`'s fakes.

use crate::error::Result;
use crate::playback::SpeedMode;
use crate::registry::{PidKind, PlaybackSegment, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidAction {
    Create,
    Keep,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRequest {
    pub pid: u16,
    pub kind: PidKind,
    pub action: PidAction,
}

/// What a recorder reports back about the segment it just finished or is
/// about to start.
#[derive(Debug, Clone, Default)]
pub struct RecorderSegInfo {
    pub duration_ms: i64,
    pub size_bytes: u64,
    pub packet_count: u32,
}

/// Drives the device/demux side of a recording. One instance per open
/// record session.
pub trait Recorder: Send {
    fn start_segment(&mut self, location: &str, segment_id: u64, pids: &[PidRequest]) -> Result<()>;
    fn next_segment(&mut self, pids: &[PidRequest]) -> Result<RecorderSegInfo>;
    fn stop_segment(&mut self) -> Result<RecorderSegInfo>;
    fn close(&mut self) -> Result<()>;
}

/// Drives the device/demux side of playback. One instance per open
/// playback session.
pub trait Player: Send {
    fn add_segment(&mut self, segment: &PlaybackSegment) -> Result<()>;
    fn remove_segment(&mut self, segment_id: u64) -> Result<()>;
    fn update_segment_pids(&mut self, segment_id: u64, pids: &[u16]) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self, clear: bool) -> Result<()>;
    fn pause(&mut self, flush: bool) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn seek(&mut self, segment_id: u64, offset_ms: i64) -> Result<()>;
    fn set_speed(&mut self, mode: SpeedMode, value: f32) -> Result<()>;
}

/// The on-disk catalogue of segments at a recording location, shared by
/// record sessions (to delete retired segments) and playback sessions (to
/// enumerate what's available).
pub trait SegmentStore: Send {
    fn get_list(&self, location: &str) -> Result<Vec<u64>>;
    fn get_info(&self, location: &str, segment_id: u64) -> Result<Segment>;
    fn delete(&self, location: &str, segment_id: u64) -> Result<()>;
}
