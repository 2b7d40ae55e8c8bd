// src/recorder.rs
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate};

use crate::drivers::error::PersistenceError;
use crate::types::{ChannelId, Sample, Timestamp};

pub const LOG_PREFIX: &str = "log_";
pub const LOG_EXTENSION: &str = ".csv";
pub const COLUMN_HEADER: &str = "Timestamp_Unix,Timestamp_ISO,Channel,Raw_Value";

/// `log_YYYY-MM-DD.csv`
pub fn log_file_name(date: NaiveDate) -> String {
    format!("{LOG_PREFIX}{}{LOG_EXTENSION}", date.format("%Y-%m-%d"))
}

pub fn parse_log_file_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_EXTENSION)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Local calendar date a sample is filed under.
pub fn local_date(ts: Timestamp) -> NaiveDate {
    ts.with_timezone(&Local).date_naive()
}

/// One complete CSV row including the newline.
pub fn format_record(sample: &Sample) -> String {
    let ts = sample.timestamp;
    format!(
        "{}.{:06},{},{},{}\n",
        ts.timestamp(),
        ts.timestamp_subsec_micros(),
        ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.6f"),
        sample.channel,
        sample.raw_value
    )
}

/// Parses a data row. Comments, the column header and torn rows give `None`.
pub fn parse_record(line: &str) -> Option<Sample> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('#') {
        return None;
    }
    let mut fields = line.split(',');
    let unix = fields.next()?;
    let _iso = fields.next()?;
    let channel = fields.next()?.trim().parse::<u8>().ok()?;
    let raw_value = fields.next()?.trim().parse::<f64>().ok()?;
    if fields.next().is_some() || !raw_value.is_finite() {
        return None;
    }
    let (secs, frac) = unix.trim().split_once('.').unwrap_or((unix.trim(), "0"));
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs = secs.parse::<i64>().ok()?;
    let nanos = format!("{frac:0<9}").parse::<u32>().ok()?;
    let timestamp = DateTime::from_timestamp(secs, nanos)?;
    Some(Sample::new(ChannelId::try_from(channel).ok()?, timestamp, raw_value))
}

struct OpenLog {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Outcome of a successful append.
#[derive(Debug, Default, PartialEq)]
pub struct AppendReport {
    pub written: usize,
    /// Files opened during this batch, in order.
    pub opened: Vec<PathBuf>,
}

/// Append that stopped part way. `written` samples reached the file.
#[derive(Debug)]
pub struct AppendFailure {
    pub written: usize,
    pub opened: Vec<PathBuf>,
    pub error: PersistenceError,
}

/// Append-only writer for one CSV file per local calendar day.
///
/// Rotation follows the sample timestamps, so a process idle over midnight
/// still files the next sample under the right date.
pub struct DailyLogger {
    dir: PathBuf,
    current: Option<OpenLog>,
    sync_each_batch: bool,
}

impl DailyLogger {
    pub fn new(dir: impl Into<PathBuf>, sync_each_batch: bool) -> Self {
        Self {
            dir: dir.into(),
            current: None,
            sync_each_batch,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    pub fn append_batch(&mut self, samples: &[Sample]) -> Result<AppendReport, AppendFailure> {
        let mut report = AppendReport::default();
        for sample in samples {
            let fail = |report: AppendReport, error| AppendFailure {
                written: report.written,
                opened: report.opened,
                error,
            };
            match self.ensure_open(local_date(sample.timestamp)) {
                Ok(Some(path)) => report.opened.push(path),
                Ok(None) => {}
                Err(error) => return Err(fail(report, error)),
            }
            if let Err(error) = self.write_line(format_record(sample).as_bytes()) {
                // The file may hold part of the row; reopening terminates it.
                self.current = None;
                return Err(fail(report, error));
            }
            report.written += 1;
        }
        if self.sync_each_batch && report.written > 0 {
            if let Some(log) = &self.current {
                if let Err(source) = log.file.sync_data() {
                    let path = log.path.clone();
                    self.current = None;
                    return Err(AppendFailure {
                        written: report.written,
                        opened: report.opened,
                        error: PersistenceError::Write { path, source },
                    });
                }
            }
        }
        Ok(report)
    }

    /// Flushes and releases the current file.
    pub fn close(&mut self) -> Result<(), PersistenceError> {
        if let Some(log) = self.current.take() {
            log.file
                .sync_all()
                .map_err(|source| PersistenceError::Write { path: log.path.clone(), source })?;
            log::info!("closed daily log {}", log.path.display());
        }
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), PersistenceError> {
        let Some(log) = self.current.as_mut() else {
            return Ok(());
        };
        log.file.write_all(line).map_err(|source| PersistenceError::Write {
            path: log.path.clone(),
            source,
        })
    }

    /// Makes sure the file for `date` is open. Returns its path when it had to be opened.
    fn ensure_open(&mut self, date: NaiveDate) -> Result<Option<PathBuf>, PersistenceError> {
        if self.current.as_ref().is_some_and(|c| c.date == date) {
            return Ok(None);
        }
        if let Some(old) = self.current.take() {
            old.file.sync_all().map_err(|source| PersistenceError::Rotation {
                path: old.path.clone(),
                source,
            })?;
            log::info!("rotating daily log away from {}", old.path.display());
        }
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(log_file_name(date));
        let file = open_for_append(&path, date)
            .map_err(|source| PersistenceError::Open { path: path.clone(), source })?;
        log::info!("logging to {}", path.display());
        self.current = Some(OpenLog {
            date,
            path: path.clone(),
            file,
        });
        Ok(Some(path))
    }
}

impl Drop for DailyLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("{e}");
        }
    }
}

/// Opens or creates a day file. New files get the header; a torn last row is
/// terminated so the next record starts on its own line.
fn open_for_append(path: &Path, date: NaiveDate) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        let header = format!("# DAILY LOG START,{}\n{COLUMN_HEADER}\n", date.format("%Y-%m-%d"));
        file.write_all(header.as_bytes())?;
    } else {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            log::warn!("{} ends in a partial row; starting a fresh line", path.display());
            file.write_all(b"\n")?;
        }
    }
    Ok(file)
}

/// Read side of the daily files, used by export and history restore.
pub struct LogReader {
    dir: PathBuf,
}

impl LogReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Dates with a log file, oldest first.
    pub fn dates(&self) -> Result<Vec<(NaiveDate, PathBuf)>, PersistenceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut dates: Vec<(NaiveDate, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let date = parse_log_file_name(entry.file_name().to_str()?)?;
                Some((date, entry.path()))
            })
            .collect();
        dates.sort();
        Ok(dates)
    }

    /// Every logged sample with `start <= timestamp <= end`, in file order.
    pub fn read_range(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>, PersistenceError> {
        let (first, last) = (local_date(start), local_date(end));
        let mut samples = Vec::new();
        for (date, path) in self.dates()? {
            if date < first || date > last {
                continue;
            }
            let file = File::open(&path).map_err(|source| PersistenceError::Read {
                path: path.clone(),
                source,
            })?;
            let mut skipped = 0usize;
            for line in BufReader::new(file).split(b'\n') {
                let line = line.map_err(|source| PersistenceError::Read {
                    path: path.clone(),
                    source,
                })?;
                match std::str::from_utf8(&line).ok().and_then(parse_record) {
                    Some(s) if s.timestamp >= start && s.timestamp <= end => samples.push(s),
                    Some(_) => {}
                    None => skipped += 1,
                }
            }
            // Two header rows per file are expected.
            if skipped > 2 {
                log::debug!("{}: skipped {} unparseable rows", path.display(), skipped - 2);
            }
        }
        Ok(samples)
    }
}
