// src/main.rs
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};

use balkon_logger::config::{AppConfig, SampleInterval};
use balkon_logger::drivers::{Protocol, SourceSpec};
use balkon_logger::engine::Engine;
use balkon_logger::export::export_from_logs;
use balkon_logger::recorder::LogReader;
use balkon_logger::settings::{ChannelRegistry, ChannelTable};
use balkon_logger::types::{ChannelId, EngineEvent, Timestamp};
use balkon_logger::window::TimeWindow;

#[derive(Parser)]
#[command(name = "balkon-logger", version, about = "Sensor acquisition with daily CSV logs")]
struct Cli {
    /// JSON configuration file; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire from a serial device or the simulator.
    Run {
        /// Serial port; the simulator runs when omitted.
        #[arg(long)]
        port: Option<String>,
        #[arg(long, default_value_t = 115200)]
        baud: u32,
        #[arg(long, value_parser = parse_protocol)]
        protocol: Option<Protocol>,
        /// Simulation cadence: 1s, 3s, 5s, 10s, 30s, 1min, 2min, 5min or 10min.
        #[arg(long)]
        interval: Option<SampleInterval>,
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
        /// Reload the last 24 hours from the day files first.
        #[arg(long)]
        restore: bool,
    },
    /// Write a pinned range from the day files to CSV.
    Export {
        /// Local time, "YYYY-MM-DD HH:MM".
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Comma separated channel ids; enabled channels when omitted.
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u8>,
        #[arg(long, default_value = "export.csv")]
        out: PathBuf,
    },
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s {
        "standard" => Ok(Protocol::Standard),
        "balkon" | "balkon_logger" | "balkon-logger" => Ok(Protocol::BalkonLogger),
        other => Err(format!("unknown protocol {other:?}, expected standard or balkon_logger")),
    }
}

fn parse_local(s: &str) -> Result<Timestamp> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .with_context(|| format!("{s:?} is not YYYY-MM-DD HH:MM"))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("{s} does not exist in the local time zone"))?;
    Ok(local.with_timezone(&Utc))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.log_dir {
        config.log_dir = dir;
    }
    match cli.command {
        Command::Run {
            port,
            baud,
            protocol,
            interval,
            duration,
            restore,
        } => {
            if let Some(port) = port {
                config.source = SourceSpec::Serial { port, baud };
            }
            if let Some(protocol) = protocol {
                config.protocol = protocol;
            }
            if let Some(interval) = interval {
                config.sample_interval = interval;
            }
            config.restore_history |= restore;
            config.validate()?;
            run(config, duration.map(Duration::from_secs))
        }
        Command::Export {
            start,
            end,
            channels,
            out,
        } => export(&config, &start, &end, &channels, out),
    }
}

fn run(config: AppConfig, duration: Option<Duration>) -> Result<()> {
    let channels = ChannelRegistry::new(ChannelTable::load(&config.settings_path));
    let spec = config.source.clone();
    let (tx, rx) = mpsc::channel();
    let mut engine = Engine::new(config, channels, tx);
    engine
        .connect(&spec)
        .with_context(|| format!("connecting to {spec:?}"))?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    loop {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            log::info!("run duration reached");
            break;
        }
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(EngineEvent::SessionEnded(end)) => {
                log::info!("session ended: {end}");
                break;
            }
            Ok(EngineEvent::PersistenceDegraded(reason)) => log::error!("logging degraded: {reason}"),
            Ok(EngineEvent::Rotated(path)) => log::info!("now logging to {}", path.display()),
            Ok(event) => log::debug!("{event:?}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_report.elapsed() >= Duration::from_secs(10) {
            last_report = Instant::now();
            for reading in engine.latest_readings() {
                log::info!(
                    "ch{} raw={} value={}",
                    reading.channel,
                    reading.raw,
                    reading.calibrated
                );
            }
        }
    }
    let status = engine.status();
    log::info!(
        "{} samples, {} decode errors",
        status.stats.samples,
        status.stats.decode_errors
    );
    engine.shutdown();
    Ok(())
}

fn export(config: &AppConfig, start: &str, end: &str, channels: &[u8], out: PathBuf) -> Result<()> {
    let window = TimeWindow::pinned(parse_local(start)?, parse_local(end)?)?;
    let table = ChannelTable::load(&config.settings_path);
    let ids: Vec<ChannelId> = if channels.is_empty() {
        table.enabled_ids().collect()
    } else {
        channels
            .iter()
            .map(|&c| ChannelId::try_from(c))
            .collect::<Result<_, _>>()?
    };
    if ids.is_empty() {
        bail!("no channels to export");
    }
    let rows = export_from_logs(&LogReader::new(&config.log_dir), &window, &ids, &table)?;
    rows.write_csv(&out)?;
    println!("exported {} rows to {}", rows.len(), out.display());
    Ok(())
}
