use cache_side_channel::Threshold;
use cache_utils::calibration::CalibrationReport;
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: u64 = 100;
pub const DEFAULT_CYCLES_PER_BIT: u64 = 500_000;
pub const DEFAULT_SYNC_GAP: u64 = 1_000_000;
pub const DEFAULT_SLOT_SCALE: u64 = 1;
pub const DEFAULT_MEASURE_OFFSET: u64 = 10_000;
pub const DEFAULT_STALENESS_TOLERANCE: u64 = 250_000;
// A few seconds on a GHz-class part, long enough to start the receiver by hand.
pub const DEFAULT_ARMING_DELAY: u64 = 10_000_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("measure offset {offset} does not fit in a slot of {slot} cycles")]
    OffsetOutsideSlot { offset: u64, slot: u64 },
    #[error("slot arithmetic overflows u64")]
    Overflow,
    #[error("calibration report has no {0}")]
    IncompleteCalibration(&'static str),
    #[error("io error on channel config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode channel config: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode channel config: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Timing parameters both endpoints must agree on out of band.
///
/// Slot `i` starts at `origin + slot_scale * (sync_gap + i * cycles_per_bit)`.
/// The sender acts on the deadline itself, the receiver `measure_offset`
/// cycles later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub threshold: u64,
    pub cycles_per_bit: u64,
    pub sync_gap: u64,
    pub slot_scale: u64,
    pub measure_offset: u64,
    pub staleness_tolerance: u64,
    pub arming_delay: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            threshold: DEFAULT_THRESHOLD,
            cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            sync_gap: DEFAULT_SYNC_GAP,
            slot_scale: DEFAULT_SLOT_SCALE,
            measure_offset: DEFAULT_MEASURE_OFFSET,
            staleness_tolerance: DEFAULT_STALENESS_TOLERANCE,
            arming_delay: DEFAULT_ARMING_DELAY,
        }
    }
}

impl ChannelConfig {
    pub fn classifier(&self) -> Threshold {
        Threshold::new(self.threshold)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::Zero("threshold"));
        }
        if self.cycles_per_bit == 0 {
            return Err(ConfigError::Zero("cycles_per_bit"));
        }
        if self.slot_scale == 0 {
            return Err(ConfigError::Zero("slot_scale"));
        }
        let slot = self
            .slot_scale
            .checked_mul(self.cycles_per_bit)
            .ok_or(ConfigError::Overflow)?;
        self.slot_scale
            .checked_mul(self.sync_gap)
            .ok_or(ConfigError::Overflow)?;
        if self.measure_offset >= slot {
            return Err(ConfigError::OffsetOutsideSlot {
                offset: self.measure_offset,
                slot,
            });
        }
        Ok(())
    }

    /// Threshold and slot length from the offline calibration tool.
    pub fn from_calibration(
        report: &CalibrationReport,
        delay_per_bit: Duration,
    ) -> Result<Self, ConfigError> {
        let mut config = ChannelConfig::default();
        config.apply_calibration(report, delay_per_bit)?;
        config.validate()?;
        Ok(config)
    }

    /// Does not validate, more overrides may follow.
    pub fn apply_calibration(
        &mut self,
        report: &CalibrationReport,
        delay_per_bit: Duration,
    ) -> Result<(), ConfigError> {
        let threshold = report
            .threshold
            .ok_or(ConfigError::IncompleteCalibration("threshold"))?;
        let frequency = report
            .cpu_frequency_hz
            .ok_or(ConfigError::IncompleteCalibration("cpu frequency"))?;
        self.threshold = threshold;
        self.cycles_per_bit = cycles_for(delay_per_bit, frequency);
        Ok(())
    }

    pub fn read_msgpack(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let buf = std::fs::read(path)?;
        let mut deserializer = Deserializer::new(&buf[..]);
        Ok(ChannelConfig::deserialize(&mut deserializer)?)
    }

    pub fn write_msgpack(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let mut f = std::fs::File::create(path)?;
        let mut s = Serializer::new(&mut f);
        self.serialize(&mut s)?;
        Ok(())
    }
}

pub fn cycles_for(delay: Duration, frequency_hz: f64) -> u64 {
    (delay.as_secs_f64() * frequency_hz).round() as u64
}
