//! Error types for the DVR coordination layer.

use thiserror::Error;

/// Mirrors the collaborator/coordinator error kinds. `MALFORMED` from the
/// indexer never reaches this type — malformed TS input is handled by
/// dropping parser state and resuming, observable only through a log line.
#[derive(Debug, Error)]
pub enum DvrError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("session table is full")]
    NoSlot,

    #[error("collaborator device open failed: {0}")]
    DeviceOpen(String),

    #[error("collaborator device I/O error: {0}")]
    DeviceIo(String),

    #[error("no segments found at location")]
    NoSegments,

    #[error("handle refers to a closed or recycled session")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DvrError>;
