// src/calibration.rs
use crate::drivers::buffer::{Point, StoreSnapshot};
use crate::settings::ChannelTable;
use crate::types::{Channel, ChannelId};

/// `raw * factor + offset`. Applied on read and export only.
pub fn calibrate(raw: f64, factor: f64, offset: f64) -> f64 {
    raw * factor + offset
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub factor: f64,
    pub offset: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
        }
    }
}

impl Calibration {
    pub fn apply(&self, raw: f64) -> f64 {
        calibrate(raw, self.factor, self.offset)
    }
}

impl From<&Channel> for Calibration {
    fn from(channel: &Channel) -> Self {
        Self {
            factor: channel.factor,
            offset: channel.offset,
        }
    }
}

/// Display-ready series for one enabled channel.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibratedSeries {
    pub channel: ChannelId,
    pub color: String,
    pub calibration: Calibration,
    pub points: Vec<Point>,
}

/// Calibrates every enabled channel of `snapshot` against one settings snapshot,
/// so a concurrent edit can never mix old factor with new offset.
pub fn calibrate_snapshot(snapshot: &StoreSnapshot, table: &ChannelTable) -> Vec<CalibratedSeries> {
    snapshot
        .series
        .iter()
        .filter_map(|series| {
            let channel = table.get(series.channel);
            if !channel.enabled {
                return None;
            }
            let calibration = Calibration::from(channel);
            Some(CalibratedSeries {
                channel: series.channel,
                color: channel.color.clone(),
                calibration,
                points: series
                    .points
                    .iter()
                    .map(|p| Point {
                        timestamp: p.timestamp,
                        value: calibration.apply(p.value),
                    })
                    .collect(),
            })
        })
        .collect()
}
