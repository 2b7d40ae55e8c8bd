// src/types.rs
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::drivers::error::ChannelError;

/// Number of channel slots a device can expose.
pub const MAX_CHANNELS: usize = 8;

/// Wall-clock instant attached to every sample.
pub type Timestamp = DateTime<Utc>;

/// Default trace colours, one per channel slot.
pub const DEFAULT_COLORS: [&str; MAX_CHANNELS] = [
    "#2980b9", "#27ae60", "#c0392b", "#16a085", "#8e44ad", "#f39c12", "#2c3e50", "#d35400",
];

/// Channel slot index, always below [`MAX_CHANNELS`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(index: usize) -> Result<Self, ChannelError> {
        if index < MAX_CHANNELS {
            Ok(Self(index as u8))
        } else {
            Err(ChannelError::OutOfRange(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8).map(ChannelId)
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value as usize)
    }
}

impl From<ChannelId> for u8 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One raw, uncalibrated observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub channel: ChannelId,
    pub timestamp: Timestamp,
    pub raw_value: f64,
}

impl Sample {
    pub fn new(channel: ChannelId, timestamp: Timestamp, raw_value: f64) -> Self {
        Self {
            channel,
            timestamp,
            raw_value,
        }
    }
}

/// Samples produced by one decode event. Timestamps never decrease.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleBatch {
    samples: Vec<Sample>,
}

impl SampleBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample; a timestamp older than the batch tail is raised to it.
    pub fn push(&mut self, mut sample: Sample) {
        if let Some(last) = self.samples.last() {
            if sample.timestamp < last.timestamp {
                sample.timestamp = last.timestamp;
            }
        }
        self.samples.push(sample);
    }

    /// Raises every timestamp older than `floor` to `floor`. Returns how many moved.
    pub fn clamp_not_before(&mut self, floor: Timestamp) -> usize {
        let mut clamped = 0;
        for sample in &mut self.samples {
            if sample.timestamp < floor {
                sample.timestamp = floor;
                clamped += 1;
            } else {
                // Non-decreasing, so nothing further can be below the floor.
                break;
            }
        }
        clamped
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl FromIterator<Sample> for SampleBatch {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        let mut batch = SampleBatch::new();
        for sample in iter {
            batch.push(sample);
        }
        batch
    }
}

impl<'a> IntoIterator for &'a SampleBatch {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Per-channel display and calibration settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    /// Opaque to the core; carried for the rendering side.
    #[serde(default)]
    pub color: String,
}

fn default_factor() -> f64 {
    1.0
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            enabled: id.index() < 3,
            factor: 1.0,
            offset: 0.0,
            color: DEFAULT_COLORS[id.index()].to_owned(),
        }
    }
}

// Why an ingestion session ended
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEnd {
    /// Explicit disconnect or engine shutdown.
    Stopped,
    /// The source reported end of stream.
    SourceClosed,
    /// Connection-level failure; reconnecting is up to the user.
    Failed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Stopped => write!(f, "stopped"),
            SessionEnd::SourceClosed => write!(f, "source closed"),
            SessionEnd::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Ended(SessionEnd),
}

// Commands sent to the acquisition thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineCommand {
    Pause,
    Resume,
    Stop,
}

// Messages sent from the acquisition thread to whoever is watching
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Connected(String),
    Paused(bool),
    DecodeError(String),
    PersistenceDegraded(String),
    PersistenceRestored,
    Rotated(PathBuf),
    SessionEnded(SessionEnd),
}
