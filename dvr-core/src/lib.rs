//! # DVR Core
//!
//! Session coordination and MPEG-2 transport stream indexing for a
//! record/timeshift/playback engine.

// ============================================================================
// Errors
// ============================================================================
pub mod error;

// ============================================================================
// Session Table
// ============================================================================
pub mod session;

// ============================================================================
// Event Queue & Worker
// ============================================================================
pub mod events;

// ============================================================================
// Segment Registry
// ============================================================================
pub mod registry;

// ============================================================================
// TS Indexer
// ============================================================================
pub mod indexer;

// ============================================================================
// Collaborator traits (device/pipeline seams)
// ============================================================================
pub mod collaborators;

// ============================================================================
// Record Coordinator
// ============================================================================
pub mod record;

// ============================================================================
// Playback Coordinator
// ============================================================================
pub mod playback;

// ============================================================================
// Wrapper: top-level record/playback/timeshift coupling
// ============================================================================
pub mod wrapper;

#[cfg(test)]
mod testutil;

pub use error::{DvrError, Result};
pub use session::SerialNumber;
pub use wrapper::Wrapper;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
