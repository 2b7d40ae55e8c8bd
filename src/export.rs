// src/export.rs
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;

use crate::calibration::Calibration;
use crate::drivers::buffer::{PointLimit, TimeseriesStore};
use crate::drivers::error::{PersistenceError, QueryError};
use crate::recorder::LogReader;
use crate::settings::ChannelTable;
use crate::types::{ChannelId, Timestamp};
use crate::window::TimeWindow;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("a live window has no fixed end; pin a range before exporting")]
    LiveWindow,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("no channels selected for export")]
    NoChannels,
    #[error("cannot write export to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportRow {
    pub timestamp: Timestamp,
    pub channel: ChannelId,
    pub raw: f64,
    pub calibrated: f64,
}

/// Full-resolution rows for a pinned range, oldest first.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportTable {
    pub window: TimeWindow,
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ExportError> {
        let io_err = |source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let mut w = BufWriter::new(file);
        self.write_rows(&mut w).map_err(io_err)?;
        w.flush().map_err(io_err)
    }

    fn write_rows(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "Timestamp,Channel,Raw_Value,Calibrated_Value")?;
        for row in &self.rows {
            writeln!(
                w,
                "{},{},{},{}",
                row.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.6f"),
                row.channel,
                row.raw,
                row.calibrated
            )?;
        }
        Ok(())
    }
}

fn check_request(window: &TimeWindow, channels: &[ChannelId]) -> Result<(), ExportError> {
    if window.is_live() {
        return Err(ExportError::LiveWindow);
    }
    if channels.is_empty() {
        return Err(ExportError::NoChannels);
    }
    Ok(())
}

fn row(timestamp: Timestamp, channel: ChannelId, raw: f64, table: &ChannelTable) -> ExportRow {
    ExportRow {
        timestamp,
        channel,
        raw,
        calibrated: Calibration::from(table.get(channel)).apply(raw),
    }
}

/// Exports from memory. Only covers what the store still holds.
pub fn export_from_store(
    store: &TimeseriesStore,
    window: &TimeWindow,
    channels: &[ChannelId],
    table: &ChannelTable,
) -> Result<ExportTable, ExportError> {
    check_request(window, channels)?;
    let snapshot = store.query(window, PointLimit::Unbounded)?;
    let mut rows: Vec<ExportRow> = snapshot
        .series
        .iter()
        .filter(|s| channels.contains(&s.channel))
        .flat_map(|s| s.points.iter().map(|p| row(p.timestamp, s.channel, p.value, table)))
        .collect();
    // Stable, so equal timestamps stay in channel order.
    rows.sort_by_key(|r| r.timestamp);
    Ok(ExportTable {
        window: *window,
        rows,
    })
}

/// Exports from the day files, so ranges older than the store horizon work too.
pub fn export_from_logs(
    reader: &LogReader,
    window: &TimeWindow,
    channels: &[ChannelId],
    table: &ChannelTable,
) -> Result<ExportTable, ExportError> {
    check_request(window, channels)?;
    let rows = reader
        .read_range(window.start(), window.end())?
        .into_iter()
        .filter(|s| channels.contains(&s.channel))
        .map(|s| row(s.timestamp, s.channel, s.raw_value, table))
        .collect();
    Ok(ExportTable {
        window: *window,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::DailyLogger;
    use crate::types::{Sample, SampleBatch};
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::fs;

    fn t(s: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(s)
    }

    fn ch(i: usize) -> ChannelId {
        ChannelId::new(i).unwrap()
    }

    fn batches() -> Vec<SampleBatch> {
        (0..10)
            .map(|s| {
                (0..3)
                    .map(|c| Sample::new(ch(c), t(s), (s * 10 + c as i64) as f64))
                    .collect()
            })
            .collect()
    }

    fn table_with_gain() -> ChannelTable {
        let mut table = ChannelTable::default();
        let mut c2 = table.get(ch(2)).clone();
        c2.factor = 0.5;
        c2.offset = 100.0;
        table.set(ch(2), c2);
        table
    }

    #[test]
    fn live_windows_and_empty_selections_are_refused() {
        let store = TimeseriesStore::new();
        let live = TimeWindow::live_ending(t(0), TimeDelta::minutes(1));
        let table = ChannelTable::default();
        assert!(matches!(
            export_from_store(&store, &live, &[ch(0)], &table),
            Err(ExportError::LiveWindow)
        ));
        let pinned = TimeWindow::pinned(t(0), t(1)).unwrap();
        assert!(matches!(
            export_from_store(&store, &pinned, &[], &table),
            Err(ExportError::NoChannels)
        ));
    }

    #[test]
    fn store_export_is_full_resolution_and_calibrated() {
        let store = TimeseriesStore::new();
        for batch in batches() {
            store.insert_batch(&batch);
        }
        let window = TimeWindow::pinned(t(2), t(5)).unwrap();
        let table = export_from_store(&store, &window, &[ch(0), ch(2)], &table_with_gain()).unwrap();
        assert_eq!(table.len(), 8);
        assert_eq!(table.rows[0].channel, ch(0));
        assert_eq!(table.rows[1].channel, ch(2));
        assert_eq!(table.rows[1].raw, 22.0);
        assert_eq!(table.rows[1].calibrated, 111.0);
        assert!(table.rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn log_export_matches_store_export() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeseriesStore::new();
        let mut logger = DailyLogger::new(dir.path(), false);
        for batch in batches() {
            store.insert_batch(&batch);
            logger.append_batch(batch.samples()).unwrap();
        }
        drop(logger);
        let window = TimeWindow::pinned(t(3), t(7)).unwrap();
        let selected = [ch(1), ch(2)];
        let settings = table_with_gain();
        let from_store = export_from_store(&store, &window, &selected, &settings).unwrap();
        let from_logs = export_from_logs(&LogReader::new(dir.path()), &window, &selected, &settings).unwrap();
        assert_eq!(from_store, from_logs);
    }

    #[test]
    fn csv_has_header_and_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeseriesStore::new();
        for batch in batches() {
            store.insert_batch(&batch);
        }
        let window = TimeWindow::pinned(t(0), t(9)).unwrap();
        let table = export_from_store(&store, &window, &[ch(1)], &ChannelTable::default()).unwrap();
        let path = dir.path().join("export.csv");
        table.write_csv(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Timestamp,Channel,Raw_Value,Calibrated_Value");
        assert_eq!(lines.len(), 11);
        assert!(lines[1].ends_with(",1,1,1"));
    }
}
