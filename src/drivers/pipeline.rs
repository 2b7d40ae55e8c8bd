use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::Utc;
use parking_lot::Mutex;
use crate::drivers::buffer::TimeseriesStore;
use crate::drivers::decoder::Decoder;
use crate::drivers::error::{DecodeError, SourceError};
use crate::drivers::source::{SourceAdapter, SourceRead};
use crate::recorder::DailyLogger;
use crate::types::{Sample, SampleBatch, Timestamp};
/// Samples kept for a later disk retry while persistence is failing.
pub const MAX_BACKLOG: usize = 100_000;
/// Running counters for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub batches: u64,
    pub samples: u64,
    pub decode_errors: u64,
    /// Samples thrown away while paused.
    pub discarded: u64,
    /// Samples whose timestamp was raised to keep time non-decreasing.
    pub clamped: u64,
    /// Samples given up on after the backlog overflowed.
    pub unpersisted: u64,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Samples stored (and logged, or queued for logging).
    Accepted(usize),
    Idle,
    /// Samples decoded while paused and dropped.
    Discarded(usize),
    /// The source reached end of stream.
    Closed,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceChange {
    Degraded(String),
    Restored,
}
#[derive(Debug)]
pub struct PumpReport {
    pub outcome: PumpOutcome,
    pub decode_errors: Vec<DecodeError>,
    pub persistence: Option<PersistenceChange>,
    /// Log files opened while persisting this pump.
    pub opened: Vec<PathBuf>,
}
impl PumpReport {
    fn new(outcome: PumpOutcome) -> Self {
        Self {
            outcome,
            decode_errors: Vec::new(),
            persistence: None,
            opened: Vec::new(),
        }
    }
}
/// Reads the source, decodes, then hands each batch to the store and the logger.
///
/// Store insertion always happens; a failing logger only queues the samples for retry.
pub struct IngestionPipeline {
    source: SourceAdapter,
    decoder: Decoder,
    store: Arc<TimeseriesStore>,
    logger: Arc<Mutex<DailyLogger>>,
    last_timestamp: Option<Timestamp>,
    backlog: VecDeque<Sample>,
    degraded: bool,
    stats: IngestStats,
}
impl IngestionPipeline {
    pub fn new(
        source: SourceAdapter,
        decoder: Decoder,
        store: Arc<TimeseriesStore>,
        logger: Arc<Mutex<DailyLogger>>,
    ) -> Self {
        let last_timestamp = store.newest_timestamp();
        Self {
            source,
            decoder,
            store,
            logger,
            last_timestamp,
            backlog: VecDeque::new(),
            degraded: false,
            stats: IngestStats::default(),
        }
    }
    pub fn stats(&self) -> IngestStats {
        self.stats
    }
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
    /// One read-decode-dispatch step. Blocks at most for the source poll timeout.
    pub fn pump_once(&mut self, paused: bool) -> Result<PumpReport, SourceError> {
        let (batch, errors) = match self.source.read()? {
            SourceRead::Closed => return Ok(self.finish(PumpReport::new(PumpOutcome::Closed))),
            SourceRead::Idle => return Ok(self.finish(PumpReport::new(PumpOutcome::Idle))),
            SourceRead::Batch(batch) => (batch, Vec::new()),
            SourceRead::Bytes(bytes) => {
                let decoded = self.decoder.decode(&bytes, Utc::now());
                (decoded.batch, decoded.errors)
            }
        };
        if !errors.is_empty() {
            self.stats.decode_errors += errors.len() as u64;
            for e in &errors {
                log::warn!("{e} ({} decode errors so far)", self.stats.decode_errors);
            }
        }
        let outcome = if batch.is_empty() {
            PumpOutcome::Idle
        } else if paused {
            self.stats.discarded += batch.len() as u64;
            PumpOutcome::Discarded(batch.len())
        } else {
            self.accept(batch)
        };
        let mut report = PumpReport::new(outcome);
        report.decode_errors = errors;
        Ok(self.finish(report))
    }
    /// Releases the source. The logger stays shared with the engine.
    pub fn close(&mut self) {
        self.source.close();
    }
    fn accept(&mut self, mut batch: SampleBatch) -> PumpOutcome {
        if let Some(last) = self.last_timestamp {
            self.stats.clamped += batch.clamp_not_before(last) as u64;
        }
        self.last_timestamp = batch.last_timestamp().or(self.last_timestamp);
        self.store.insert_batch(&batch);
        let count = batch.len();
        self.stats.batches += 1;
        self.stats.samples += count as u64;
        self.backlog.extend(batch.into_samples());
        PumpOutcome::Accepted(count)
    }
    /// Pushes whatever is waiting to disk and fills in the persistence fields.
    fn finish(&mut self, mut report: PumpReport) -> PumpReport {
        if self.backlog.is_empty() {
            return report;
        }
        let result = self.logger.lock().append_batch(self.backlog.make_contiguous());
        match result {
            Ok(done) => {
                self.backlog.clear();
                report.opened = done.opened;
                if self.degraded {
                    self.degraded = false;
                    log::info!("persistence restored");
                    report.persistence = Some(PersistenceChange::Restored);
                }
            }
            Err(failure) => {
                self.backlog.drain(..failure.written);
                report.opened = failure.opened;
                if !self.degraded {
                    self.degraded = true;
                    log::error!("persistence degraded: {}", failure.error);
                    report.persistence = Some(PersistenceChange::Degraded(failure.error.to_string()));
                }
                if self.backlog.len() > MAX_BACKLOG {
                    let overflow = self.backlog.len() - MAX_BACKLOG;
                    self.backlog.drain(..overflow);
                    self.stats.unpersisted += overflow as u64;
                    log::warn!("dropped {overflow} unpersisted samples from the retry backlog");
                }
            }
        }
        report
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::buffer::PointLimit;
    use crate::drivers::decoder::Protocol;
    use crate::drivers::source::{ManualSource, ReplaySource};
    use crate::recorder::LogReader;
    use crate::types::ChannelId;
    use crate::window::TimeWindow;
    use chrono::TimeDelta;
    use std::fs;
    use std::io::Cursor;
    fn pipeline_over(bytes: &[u8], log_dir: &std::path::Path) -> IngestionPipeline {
        let source = SourceAdapter::Replay(ReplaySource::new("test", Cursor::new(bytes.to_vec())));
        IngestionPipeline::new(
            source,
            Decoder::for_protocol(Protocol::Standard, 2),
            Arc::new(TimeseriesStore::new()),
            Arc::new(Mutex::new(DailyLogger::new(log_dir, false))),
        )
    }
    fn drain(pipeline: &mut IngestionPipeline) -> Vec<PumpReport> {
        let mut reports = Vec::new();
        loop {
            let report = pipeline.pump_once(false).unwrap();
            let closed = report.outcome == PumpOutcome::Closed;
            reports.push(report);
            if closed {
                return reports;
            }
        }
    }
    fn everything() -> TimeWindow {
        let now = Utc::now();
        TimeWindow::pinned(now - TimeDelta::hours(1), now + TimeDelta::hours(1)).unwrap()
    }
    #[test]
    fn pipeline_stores_and_logs_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline_over(b"1,2\n3,oops\n5,6\n", dir.path());
        let reports = drain(&mut pipeline);
        assert_eq!(reports[0].outcome, PumpOutcome::Accepted(4));
        assert_eq!(reports[0].decode_errors.len(), 1);
        assert_eq!(reports[0].opened.len(), 1);
        assert_eq!(pipeline.stats().decode_errors, 1);
        let snap = pipeline.store.query(&everything(), PointLimit::Unbounded).unwrap();
        let ch1 = snap.channel(ChannelId::new(1).unwrap()).unwrap();
        let values: Vec<f64> = ch1.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 6.0]);
        let window = everything();
        let logged = LogReader::new(dir.path())
            .read_range(window.start(), window.end())
            .unwrap();
        assert_eq!(logged.len(), 4);
    }
    #[test]
    fn paused_pumps_drain_but_discard() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline_over(b"1,2\n", dir.path());
        let report = pipeline.pump_once(true).unwrap();
        assert_eq!(report.outcome, PumpOutcome::Discarded(2));
        assert!(pipeline.store.is_empty());
        assert_eq!(pipeline.stats().discarded, 2);
        assert!(LogReader::new(dir.path()).dates().unwrap().is_empty());
    }
    #[test]
    fn stream_errors_end_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let manual = ManualSource::new(vec![
            Ok(SourceRead::Bytes(b"1,1\n".to_vec())),
            Err(SourceError::StreamError {
                target: "usb".into(),
                source: std::io::ErrorKind::BrokenPipe.into(),
            }),
        ]);
        let mut pipeline = IngestionPipeline::new(
            SourceAdapter::Replay(ReplaySource::new("manual", manual)),
            Decoder::for_protocol(Protocol::Standard, 2),
            Arc::new(TimeseriesStore::new()),
            Arc::new(Mutex::new(DailyLogger::new(dir.path(), false))),
        );
        assert_eq!(pipeline.pump_once(false).unwrap().outcome, PumpOutcome::Accepted(2));
        assert!(matches!(pipeline.pump_once(false), Err(SourceError::StreamError { .. })));
        assert_eq!(pipeline.store.total_len(), 2);
    }
    #[test]
    fn disk_failure_degrades_then_recovers_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        // A file where the log directory should be makes every append fail.
        fs::write(&log_dir, "").unwrap();
        let manual = ManualSource::new(vec![
            Ok(SourceRead::Bytes(b"1,1\n".to_vec())),
            Ok(SourceRead::Bytes(b"2,2\n".to_vec())),
            Ok(SourceRead::Bytes(b"3,3\n".to_vec())),
        ]);
        let mut pipeline = IngestionPipeline::new(
            SourceAdapter::Replay(ReplaySource::new("manual", manual)),
            Decoder::for_protocol(Protocol::Standard, 2),
            Arc::new(TimeseriesStore::new()),
            Arc::new(Mutex::new(DailyLogger::new(&log_dir, false))),
        );
        let first = pipeline.pump_once(false).unwrap();
        assert!(matches!(first.persistence, Some(PersistenceChange::Degraded(_))));
        assert!(pipeline.is_degraded());
        let second = pipeline.pump_once(false).unwrap();
        assert_eq!(second.persistence, None);
        assert_eq!(pipeline.backlog_len(), 4);
        // Live view keeps working while degraded.
        assert_eq!(pipeline.store.total_len(), 4);
        fs::remove_file(&log_dir).unwrap();
        let third = pipeline.pump_once(false).unwrap();
        assert_eq!(third.persistence, Some(PersistenceChange::Restored));
        assert_eq!(pipeline.backlog_len(), 0);
        let window = everything();
        let logged = LogReader::new(&log_dir)
            .read_range(window.start(), window.end())
            .unwrap();
        let values: Vec<f64> = logged.iter().map(|s| s.raw_value).collect();
        assert_eq!(values, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }
    #[test]
    fn timestamps_never_step_backwards_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeseriesStore::new());
        let future = Utc::now() + TimeDelta::minutes(5);
        let id = ChannelId::new(0).unwrap();
        store.insert_batch(&std::iter::once(Sample::new(id, future, 0.0)).collect());
        let mut pipeline = IngestionPipeline::new(
            SourceAdapter::Replay(ReplaySource::new("test", Cursor::new(b"1,2\n".to_vec()))),
            Decoder::for_protocol(Protocol::Standard, 2),
            Arc::clone(&store),
            Arc::new(Mutex::new(DailyLogger::new(dir.path(), false))),
        );
        pipeline.pump_once(false).unwrap();
        assert_eq!(pipeline.stats().clamped, 2);
        assert_eq!(store.newest_timestamp(), Some(future));
    }
}
