use std::io;
use std::path::PathBuf;
use thiserror::Error;
use crate::types::{Timestamp, MAX_CHANNELS};
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel id {0} is out of range, only 0..{MAX_CHANNELS} exist")]
    OutOfRange(usize),
}
/// Per-unit decode failures. The stream keeps going after any of these.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed line {line:?}: {reason}")]
    MalformedLine { line: String, reason: String },
    #[error("framing error: {0}")]
    FramingError(String),
}
/// Connection-level failures. Terminal to the current session.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open {target}: {source}")]
    ConnectionError {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("read from {target} failed: {source}")]
    StreamError {
        target: String,
        #[source]
        source: io::Error,
    },
}
/// Disk-side failures. Degrade logging only.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cannot create log directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("cannot open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("write to {path} failed: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot close {path} during rotation: {source}")]
    Rotation { path: PathBuf, source: io::Error },
    #[error("cannot read log data from {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("window start {start} is after its end {end}")]
    InvalidWindow { start: Timestamp, end: Timestamp },
    #[error("a point budget of zero cannot hold any sample")]
    ZeroPointBudget,
}
