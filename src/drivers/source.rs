use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use crate::drivers::error::SourceError;
use crate::settings::ChannelRegistry;
use crate::types::{Sample, SampleBatch};
const READ_CHUNK: usize = 4096;
/// Simulated time runs at this fraction of real time so the traces stay calm.
const SIM_TIME_SCALE: f64 = 0.2;
const SIM_NOISE: f64 = 0.05;
/// Connection parameters chosen by the user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    #[default]
    Simulation,
    Serial { port: String, baud: u32 },
    /// Feed a captured byte stream from disk through the decoder.
    Replay { path: PathBuf },
}
/// Knobs that apply to whichever source gets opened.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Upper bound on how long a single `read` may block.
    pub poll_timeout: Duration,
    /// Simulation cadence.
    pub sample_interval: Duration,
    pub seed: Option<u64>,
    pub channels: ChannelRegistry,
}
impl SourceOptions {
    pub fn new(channels: ChannelRegistry) -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            sample_interval: Duration::from_secs(1),
            seed: None,
            channels,
        }
    }
}
/// What one `read` produced.
#[derive(Debug, PartialEq)]
pub enum SourceRead {
    /// Raw bytes for the decoder.
    Bytes(Vec<u8>),
    /// Samples that are already timed, no decoding needed.
    Batch(SampleBatch),
    /// Nothing arrived within the poll timeout.
    Idle,
    /// End of stream.
    Closed,
}
pub enum SourceAdapter {
    Simulation(SimulationSource),
    Serial(SerialSource),
    Replay(ReplaySource),
}
impl SourceAdapter {
    pub fn open(spec: &SourceSpec, options: &SourceOptions) -> Result<Self, SourceError> {
        match spec {
            SourceSpec::Simulation => Ok(SourceAdapter::Simulation(SimulationSource::new(options))),
            SourceSpec::Serial { port, baud } => Ok(SourceAdapter::Serial(SerialSource::open(
                port,
                *baud,
                options.poll_timeout,
            )?)),
            SourceSpec::Replay { path } => {
                let file = File::open(path).map_err(|e| SourceError::ConnectionError {
                    target: path.display().to_string(),
                    source: Box::new(e),
                })?;
                Ok(SourceAdapter::Replay(ReplaySource::new(
                    path.display().to_string(),
                    file,
                )))
            }
        }
    }
    pub fn read(&mut self) -> Result<SourceRead, SourceError> {
        match self {
            SourceAdapter::Simulation(s) => Ok(s.read()),
            SourceAdapter::Serial(s) => s.read(),
            SourceAdapter::Replay(s) => s.read(),
        }
    }
    /// Releases the underlying handle. Safe to call more than once.
    pub fn close(&mut self) {
        match self {
            SourceAdapter::Simulation(s) => s.open = false,
            SourceAdapter::Serial(s) => s.close(),
            SourceAdapter::Replay(s) => s.reader = None,
        }
    }
    pub fn is_open(&self) -> bool {
        match self {
            SourceAdapter::Simulation(s) => s.open,
            SourceAdapter::Serial(s) => s.port.is_some(),
            SourceAdapter::Replay(s) => s.reader.is_some(),
        }
    }
    pub fn describe(&self) -> String {
        match self {
            SourceAdapter::Simulation(s) => format!("simulation every {:?}", s.interval),
            SourceAdapter::Serial(s) => format!("serial {} @ {} baud", s.port_name, s.baud),
            SourceAdapter::Replay(s) => format!("replay {}", s.label),
        }
    }
}
/// Synthetic sine-plus-noise readings for the enabled channels.
pub struct SimulationSource {
    started: Instant,
    next_tick: Instant,
    interval: Duration,
    poll_timeout: Duration,
    rng: StdRng,
    channels: ChannelRegistry,
    open: bool,
}
impl SimulationSource {
    pub fn new(options: &SourceOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let now = Instant::now();
        Self {
            started: now,
            next_tick: now,
            interval: options.sample_interval.max(Duration::from_millis(1)),
            poll_timeout: options.poll_timeout,
            rng,
            channels: options.channels.clone(),
            open: true,
        }
    }
    fn read(&mut self) -> SourceRead {
        if !self.open {
            return SourceRead::Closed;
        }
        let now = Instant::now();
        if now < self.next_tick {
            thread::sleep((self.next_tick - now).min(self.poll_timeout));
            if Instant::now() < self.next_tick {
                return SourceRead::Idle;
            }
        }
        self.next_tick += self.interval;
        if self.next_tick < now {
            // Fell behind (suspended laptop etc.); don't burst to catch up.
            self.next_tick = now + self.interval;
        }
        let t = self.started.elapsed().as_secs_f64() * SIM_TIME_SCALE;
        let timestamp = Utc::now();
        let table = self.channels.snapshot();
        let batch = table
            .enabled_ids()
            .map(|id| {
                let noise = self.rng.gen_range(-SIM_NOISE..=SIM_NOISE);
                Sample::new(id, timestamp, simulated_value(id.index(), t) + noise)
            })
            .collect();
        SourceRead::Batch(batch)
    }
}
/// Noise-free simulated reading for channel `index` at scaled time `t`. Spans 0..4.
pub fn simulated_value(index: usize, t: f64) -> f64 {
    let frequency = 1.0 + index as f64 * 0.05;
    let phase = index as f64 * 0.5;
    2.0 + 2.0 * (t * frequency + phase).sin()
}
/// Byte stream from a serial device.
pub struct SerialSource {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    buffer: Vec<u8>,
}
impl SerialSource {
    pub fn open(port_name: &str, baud: u32, timeout: Duration) -> Result<Self, SourceError> {
        let port = serialport::new(port_name, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| SourceError::ConnectionError {
                target: format!("{port_name} @ {baud} baud"),
                source: Box::new(e),
            })?;
        log::info!("opened serial port {port_name} at {baud} baud");
        Ok(Self {
            port_name: port_name.to_owned(),
            baud,
            port: Some(port),
            buffer: vec![0u8; READ_CHUNK],
        })
    }
    fn read(&mut self) -> Result<SourceRead, SourceError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(SourceRead::Closed);
        };
        match port.read(&mut self.buffer) {
            Ok(0) => Ok(SourceRead::Idle),
            Ok(n) => Ok(SourceRead::Bytes(self.buffer[..n].to_vec())),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(SourceRead::Idle)
            }
            Err(e) => {
                self.close();
                Err(SourceError::StreamError {
                    target: self.port_name.clone(),
                    source: e,
                })
            }
        }
    }
    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("closed serial port {}", self.port_name);
        }
    }
}
impl Drop for SerialSource {
    fn drop(&mut self) {
        self.close();
    }
}
/// Any reader replayed chunk by chunk, e.g. a captured serial dump.
pub struct ReplaySource {
    label: String,
    reader: Option<Box<dyn Read + Send>>,
    buffer: Vec<u8>,
}
impl ReplaySource {
    pub fn new(label: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            label: label.into(),
            reader: Some(Box::new(reader)),
            buffer: vec![0u8; READ_CHUNK],
        }
    }
    fn read(&mut self) -> Result<SourceRead, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(SourceRead::Closed);
        };
        match reader.read(&mut self.buffer) {
            Ok(0) => {
                self.reader = None;
                Ok(SourceRead::Closed)
            }
            Ok(n) => Ok(SourceRead::Bytes(self.buffer[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(SourceRead::Idle),
            Err(e) => {
                self.reader = None;
                Err(SourceError::StreamError {
                    target: self.label.clone(),
                    source: e,
                })
            }
        }
    }
}
/// In-memory source of pre-built reads, for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<Result<SourceRead, SourceError>>,
}
impl ManualSource {
    pub fn new(reads: impl IntoIterator<Item = Result<SourceRead, SourceError>>) -> Self {
        Self {
            queue: reads.into_iter().collect(),
        }
    }
}
impl Read for ManualSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.queue.pop_front() {
            Some(Ok(SourceRead::Bytes(bytes))) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.queue.push_front(Ok(SourceRead::Bytes(bytes[n..].to_vec())));
                }
                Ok(n)
            }
            Some(Ok(SourceRead::Idle)) => Err(io::ErrorKind::Interrupted.into()),
            Some(Ok(_)) | None => Ok(0),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
        }
    }
}
