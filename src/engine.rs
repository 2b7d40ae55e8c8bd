// src/engine.rs
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;

use crate::calibration::{calibrate_snapshot, CalibratedSeries, Calibration};
use crate::config::AppConfig;
use crate::drivers::buffer::{PointLimit, TimeseriesStore};
use crate::drivers::decoder::Decoder;
use crate::drivers::error::{QueryError, SourceError};
use crate::drivers::pipeline::{IngestStats, IngestionPipeline, PersistenceChange, PumpOutcome};
use crate::drivers::source::{SourceAdapter, SourceSpec};
use crate::export::{export_from_logs, export_from_store, ExportError, ExportTable};
use crate::recorder::{DailyLogger, LogReader};
use crate::settings::{ChannelRegistry, SettingsError};
use crate::types::*;
use crate::window::TimeWindow;

/// Samples per store insert when replaying history from disk.
const RESTORE_CHUNK: usize = 4096;

/// Standing status a consumer can poll at any time.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub state: SessionState,
    pub source: Option<String>,
    /// Set while the disk side is failing.
    pub persistence_degraded: Option<String>,
    pub current_log: Option<PathBuf>,
    pub stats: IngestStats,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            source: None,
            persistence_degraded: None,
            current_log: None,
            stats: IngestStats::default(),
        }
    }
}

/// Newest reading of one enabled channel, raw and calibrated.
#[derive(Clone, Debug, PartialEq)]
pub struct LatestReading {
    pub channel: ChannelId,
    pub timestamp: Timestamp,
    pub raw: f64,
    pub calibrated: f64,
}

struct Session {
    commands: Sender<EngineCommand>,
    handle: JoinHandle<()>,
}

/// Owns the store and the logger for the process lifetime and runs at most one
/// ingestion session on a background thread.
pub struct Engine {
    config: AppConfig,
    channels: ChannelRegistry,
    store: Arc<TimeseriesStore>,
    logger: Arc<Mutex<DailyLogger>>,
    status: Arc<Mutex<EngineStatus>>,
    events: Sender<EngineEvent>,
    session: Option<Session>,
}

impl Engine {
    pub fn new(config: AppConfig, channels: ChannelRegistry, events: Sender<EngineEvent>) -> Self {
        let store = Arc::new(TimeseriesStore::new());
        if config.restore_history {
            restore_history(&store, &LogReader::new(&config.log_dir));
        }
        let logger = DailyLogger::new(&config.log_dir, config.sync_each_batch);
        Self {
            config,
            channels,
            store,
            logger: Arc::new(Mutex::new(logger)),
            status: Arc::new(Mutex::new(EngineStatus::default())),
            events,
            session: None,
        }
    }

    /// Opens `spec` on the calling thread, so connection errors come back here,
    /// then starts the session thread. An existing session is stopped first.
    pub fn connect(&mut self, spec: &SourceSpec) -> Result<(), SourceError> {
        self.disconnect();
        let options = self.config.source_options(self.channels.clone());
        let source = SourceAdapter::open(spec, &options)?;
        let description = source.describe();
        let decoder = Decoder::for_protocol(self.config.protocol, self.config.standard_fields);
        let pipeline = IngestionPipeline::new(
            source,
            decoder,
            Arc::clone(&self.store),
            Arc::clone(&self.logger),
        );
        {
            let mut status = self.status.lock();
            status.state = SessionState::Running;
            status.source = Some(description.clone());
            status.stats = IngestStats::default();
        }
        log::info!("session started: {description}");
        self.events.send(EngineEvent::Connected(description)).ok();

        let (tx_cmd, rx_cmd) = mpsc::channel();
        let handle = spawn_thread(
            pipeline,
            rx_cmd,
            self.events.clone(),
            Arc::clone(&self.status),
        );
        self.session = Some(Session {
            commands: tx_cmd,
            handle,
        });
        Ok(())
    }

    pub fn pause(&self) -> bool {
        self.send(EngineCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(EngineCommand::Resume)
    }

    /// Stops the session and waits until its source is released.
    pub fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.commands.send(EngineCommand::Stop).ok();
        if session.handle.join().is_err() {
            log::error!("ingestion thread panicked");
            let end = SessionEnd::Failed("ingestion thread panicked".into());
            self.status.lock().state = SessionState::Ended(end.clone());
            self.events.send(EngineEvent::SessionEnded(end)).ok();
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status.lock().state,
            SessionState::Running | SessionState::Paused
        )
    }

    pub fn store(&self) -> &Arc<TimeseriesStore> {
        &self.store
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_channel(&self, id: ChannelId) -> Channel {
        self.channels.get_channel(id)
    }

    pub fn set_channel(&self, id: ChannelId, channel: Channel) {
        self.channels.set_channel(id, channel);
    }

    pub fn save_channels(&self) -> Result<(), SettingsError> {
        self.channels.snapshot().save(&self.config.settings_path)
    }

    /// Calibrated, decimated series for the enabled channels.
    pub fn calibrated_view(
        &self,
        window: &TimeWindow,
        max_points: usize,
    ) -> Result<Vec<CalibratedSeries>, QueryError> {
        let snapshot = self.store.query(window, PointLimit::Max(max_points))?;
        Ok(calibrate_snapshot(&snapshot, &self.channels.snapshot()))
    }

    pub fn latest_readings(&self) -> Vec<LatestReading> {
        let table = self.channels.snapshot();
        let latest = self.store.latest();
        table
            .iter()
            .filter(|c| c.enabled)
            .filter_map(|c| {
                let point = latest[c.id.index()]?;
                Some(LatestReading {
                    channel: c.id,
                    timestamp: point.timestamp,
                    raw: point.value,
                    calibrated: Calibration::from(c).apply(point.value),
                })
            })
            .collect()
    }

    /// Exports a pinned range, from memory when the store still covers it and
    /// from the day files otherwise.
    pub fn export(&self, window: &TimeWindow, channels: &[ChannelId]) -> Result<ExportTable, ExportError> {
        let table = self.channels.snapshot();
        let in_memory = self
            .store
            .oldest_timestamp()
            .is_some_and(|oldest| oldest <= window.start());
        if in_memory {
            export_from_store(&self.store, window, channels, &table)
        } else {
            export_from_logs(&LogReader::new(&self.config.log_dir), window, channels, &table)
        }
    }

    /// Stops any session and closes the day file.
    pub fn shutdown(mut self) {
        self.close_all();
    }

    fn close_all(&mut self) {
        self.disconnect();
        if let Err(e) = self.logger.lock().close() {
            log::error!("{e}");
        }
    }

    fn send(&self, command: EngineCommand) -> bool {
        match &self.session {
            Some(session) => session.commands.send(command).is_ok(),
            None => false,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn restore_history(store: &TimeseriesStore, reader: &LogReader) {
    let now = Utc::now();
    match reader.read_range(now - TimeDelta::hours(24), now) {
        Ok(samples) => {
            let count = samples.len();
            for chunk in samples.chunks(RESTORE_CHUNK) {
                store.insert_batch(&chunk.iter().copied().collect());
            }
            log::info!("restored {count} samples from the day files");
        }
        Err(e) => log::warn!("history restore skipped: {e}"),
    }
}

/// Runs one session until stopped, closed or failed. The source is released
/// before `SessionEnded` goes out, also when the session loop panics.
pub fn spawn_thread(
    mut pipeline: IngestionPipeline,
    rx_cmd: Receiver<EngineCommand>,
    tx: Sender<EngineEvent>,
    status: Arc<Mutex<EngineStatus>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_session(&mut pipeline, &rx_cmd, &tx, &status)
        }));
        let end = outcome.unwrap_or_else(|payload| {
            let reason = format!("ingestion thread panicked: {}", panic_message(&*payload));
            log::error!("{reason}");
            SessionEnd::Failed(reason)
        });

        pipeline.close();
        log::info!("session ended: {end}");
        {
            let mut s = status.lock();
            s.state = SessionState::Ended(end.clone());
            s.stats = pipeline.stats();
        }
        tx.send(EngineEvent::SessionEnded(end)).ok();
    })
}

fn run_session(
    pipeline: &mut IngestionPipeline,
    rx_cmd: &Receiver<EngineCommand>,
    tx: &Sender<EngineEvent>,
    status: &Mutex<EngineStatus>,
) -> SessionEnd {
    let mut paused = false;
    loop {
        // 1. commands
        loop {
            match rx_cmd.try_recv() {
                Ok(EngineCommand::Pause) if !paused => {
                    paused = true;
                    status.lock().state = SessionState::Paused;
                    tx.send(EngineEvent::Paused(true)).ok();
                }
                Ok(EngineCommand::Resume) if paused => {
                    paused = false;
                    status.lock().state = SessionState::Running;
                    tx.send(EngineEvent::Paused(false)).ok();
                }
                Ok(EngineCommand::Pause | EngineCommand::Resume) => {}
                Ok(EngineCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    return SessionEnd::Stopped;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        // 2. one bounded read
        let report = match pipeline.pump_once(paused) {
            Ok(report) => report,
            Err(e) => {
                log::error!("session failed: {e}");
                return SessionEnd::Failed(e.to_string());
            }
        };
        for e in &report.decode_errors {
            tx.send(EngineEvent::DecodeError(e.to_string())).ok();
        }
        {
            let mut s = status.lock();
            s.stats = pipeline.stats();
            match &report.persistence {
                Some(PersistenceChange::Degraded(reason)) => {
                    s.persistence_degraded = Some(reason.clone());
                    tx.send(EngineEvent::PersistenceDegraded(reason.clone())).ok();
                }
                Some(PersistenceChange::Restored) => {
                    s.persistence_degraded = None;
                    tx.send(EngineEvent::PersistenceRestored).ok();
                }
                None => {}
            }
            if let Some(path) = report.opened.last() {
                s.current_log = Some(path.clone());
            }
        }
        for path in report.opened {
            tx.send(EngineEvent::Rotated(path)).ok();
        }
        if report.outcome == PumpOutcome::Closed {
            return SessionEnd::SourceClosed;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
