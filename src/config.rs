// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::drivers::decoder::Protocol;
use crate::drivers::source::{SourceOptions, SourceSpec};
use crate::settings::ChannelRegistry;

/// Baud rates the logger hardware is known to run at.
pub const STANDARD_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 250000];

/// Simulation cadence choices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleInterval {
    #[default]
    #[serde(rename = "1s")]
    OneSecond,
    #[serde(rename = "3s")]
    ThreeSeconds,
    #[serde(rename = "5s")]
    FiveSeconds,
    #[serde(rename = "10s")]
    TenSeconds,
    #[serde(rename = "30s")]
    ThirtySeconds,
    #[serde(rename = "1min")]
    OneMinute,
    #[serde(rename = "2min")]
    TwoMinutes,
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "10min")]
    TenMinutes,
}

impl SampleInterval {
    pub const ALL: [SampleInterval; 9] = [
        SampleInterval::OneSecond,
        SampleInterval::ThreeSeconds,
        SampleInterval::FiveSeconds,
        SampleInterval::TenSeconds,
        SampleInterval::ThirtySeconds,
        SampleInterval::OneMinute,
        SampleInterval::TwoMinutes,
        SampleInterval::FiveMinutes,
        SampleInterval::TenMinutes,
    ];

    pub fn duration(self) -> Duration {
        let secs = match self {
            SampleInterval::OneSecond => 1,
            SampleInterval::ThreeSeconds => 3,
            SampleInterval::FiveSeconds => 5,
            SampleInterval::TenSeconds => 10,
            SampleInterval::ThirtySeconds => 30,
            SampleInterval::OneMinute => 60,
            SampleInterval::TwoMinutes => 120,
            SampleInterval::FiveMinutes => 300,
            SampleInterval::TenMinutes => 600,
        };
        Duration::from_secs(secs)
    }

    pub fn label(self) -> &'static str {
        match self {
            SampleInterval::OneSecond => "1s",
            SampleInterval::ThreeSeconds => "3s",
            SampleInterval::FiveSeconds => "5s",
            SampleInterval::TenSeconds => "10s",
            SampleInterval::ThirtySeconds => "30s",
            SampleInterval::OneMinute => "1min",
            SampleInterval::TwoMinutes => "2min",
            SampleInterval::FiveMinutes => "5min",
            SampleInterval::TenMinutes => "10min",
        }
    }
}

impl fmt::Display for SampleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SampleInterval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SampleInterval::ALL
            .into_iter()
            .find(|i| i.label() == s)
            .ok_or_else(|| {
                let options: Vec<&str> = SampleInterval::ALL.iter().map(|i| i.label()).collect();
                format!("unknown interval {s:?}, expected one of {}", options.join(", "))
            })
    }
}

/// Application configuration. Every field has a default, so `{}` is a valid file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
    pub source: SourceSpec,
    pub protocol: Protocol,
    /// Field count per line for the standard protocol.
    pub standard_fields: usize,
    pub sample_interval: SampleInterval,
    pub seed: Option<u64>,
    pub poll_timeout_ms: u64,
    /// fsync the day file after every batch.
    pub sync_each_batch: bool,
    /// Reload the last 24 hours from the day files at start.
    pub restore_history: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            settings_path: PathBuf::from("sensor_settings.json"),
            source: SourceSpec::Simulation,
            protocol: Protocol::BalkonLogger,
            standard_fields: 8,
            sample_interval: SampleInterval::OneSecond,
            seed: None,
            poll_timeout_ms: 100,
            sync_each_batch: true,
            restore_history: false,
        }
    }
}

impl AppConfig {
    /// Reads `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=crate::types::MAX_CHANNELS).contains(&self.standard_fields) {
            bail!(
                "standard_fields must be between 1 and {}, got {}",
                crate::types::MAX_CHANNELS,
                self.standard_fields
            );
        }
        if self.poll_timeout_ms == 0 {
            bail!("poll_timeout_ms must be positive");
        }
        if let SourceSpec::Serial { baud, .. } = &self.source {
            if !STANDARD_BAUD_RATES.contains(baud) {
                log::warn!("baud rate {baud} is not one of {STANDARD_BAUD_RATES:?}");
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn source_options(&self, channels: ChannelRegistry) -> SourceOptions {
        SourceOptions {
            poll_timeout: self.poll_timeout(),
            sample_interval: self.sample_interval.duration(),
            seed: self.seed,
            channels,
        }
    }
}
