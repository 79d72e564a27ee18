#![deny(unsafe_op_in_unsafe_fn)]

// Shared plumbing for the sender, receiver and loopback benchmark binaries:
// command line channel configuration, core pinning, and an in-process run of
// both endpoints over one region.

use cache_utils::calibration::{CalibrationError, CalibrationReport};
use clap::Args;
use covert_channels_evaluation::{BitMessage, ChannelError, MessageError, TransmissionResult};
use flush_reload::{
    ChannelConfig, ChannelRegion, ConfigError, Receiver, ReceiverError, RegionError, Sender,
    Tsc, DEFAULT_SHM_SIZE,
};
use log::{info, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DELAY_PER_BIT_US: u64 = 250;

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("cannot pin to core {core}: {source}")]
    Affinity { core: usize, source: nix::Error },
    #[error("sender thread died before the end of transmission")]
    SenderPanicked,
}

/// Channel parameters as given on the command line.
///
/// Later sources win: defaults, then `--config`, then `--calibration`, then
/// the individual flags.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(long, help = "Channel configuration file (MessagePack)")]
    pub config: Option<PathBuf>,
    #[arg(long, help = "Calibration report written by cache_latency")]
    pub calibration: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = DEFAULT_DELAY_PER_BIT_US,
        help = "Slot length in microseconds, used with --calibration"
    )]
    pub delay_per_bit_us: u64,
    #[arg(long, help = "Reload latency below which a slot reads as 1")]
    pub threshold: Option<u64>,
    #[arg(long)]
    pub cycles_per_bit: Option<u64>,
    #[arg(long)]
    pub sync_gap: Option<u64>,
    #[arg(long)]
    pub slot_scale: Option<u64>,
    #[arg(long)]
    pub measure_offset: Option<u64>,
    #[arg(long)]
    pub staleness_tolerance: Option<u64>,
    #[arg(long, help = "Cycles the sender waits before raising the start flag")]
    pub arming_delay: Option<u64>,
}

impl ConfigArgs {
    pub fn resolve(&self) -> Result<ChannelConfig, BenchmarkError> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::read_msgpack(path)?,
            None => ChannelConfig::default(),
        };
        if let Some(path) = &self.calibration {
            let report = CalibrationReport::read_msgpack(path)?;
            config.apply_calibration(&report, Duration::from_micros(self.delay_per_bit_us))?;
        }
        let overrides = [
            (self.threshold, &mut config.threshold),
            (self.cycles_per_bit, &mut config.cycles_per_bit),
            (self.sync_gap, &mut config.sync_gap),
            (self.slot_scale, &mut config.slot_scale),
            (self.measure_offset, &mut config.measure_offset),
            (self.staleness_tolerance, &mut config.staleness_tolerance),
            (self.arming_delay, &mut config.arming_delay),
        ];
        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Pin the calling thread, returning the affinity it had before.
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(old)
}

pub fn restore_affinity(cpu_set: &CpuSet) {
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), cpu_set) {
        warn!("failed to restore affinity: {}", e);
    }
}

pub fn pin_to_core(core: usize) -> Result<CpuSet, BenchmarkError> {
    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .and_then(|()| set_affinity(&cpu_set))
        .map_err(|source| BenchmarkError::Affinity { core, source })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cores {
    pub sender: Option<usize>,
    pub receiver: Option<usize>,
}

static LOOPBACK_RUNS: AtomicUsize = AtomicUsize::new(0);

fn loopback_region_name() -> String {
    let run = LOOPBACK_RUNS.fetch_add(1, Ordering::Relaxed);
    format!("/fr_bench_{}_{}", std::process::id(), run)
}

// Polls the receiver may spend beyond the transmission's own length before
// it gives up on the start flag.
const ARMING_POLL_SLACK: u64 = 1 << 20;

/// Upper bound on start flag polls for a loopback run of `bits` bits.
///
/// A poll costs at least one cycle, so once this many polls have failed the
/// flag has been raised and lowered again without the receiver seeing it.
pub fn arming_poll_budget(config: &ChannelConfig, bits: usize) -> u64 {
    let slots = (bits as u64).saturating_add(1);
    let span = config.slot_scale.saturating_mul(
        config
            .sync_gap
            .saturating_add(slots.saturating_mul(config.cycles_per_bit)),
    );
    config
        .arming_delay
        .saturating_add(span)
        .saturating_add(ARMING_POLL_SLACK)
}

/// Send `message` from a helper thread and receive it on the calling thread,
/// through a fresh shared region.
pub fn benchmark_loopback(
    config: ChannelConfig,
    message: &BitMessage,
    cores: Cores,
) -> Result<TransmissionResult, BenchmarkError> {
    config.validate()?;
    let region = ChannelRegion::create(&loopback_region_name(), DEFAULT_SHM_SIZE)?;
    let old_affinity = match cores.receiver {
        Some(core) => Some(pin_to_core(core)?),
        None => None,
    };

    let region_ref = &region;
    let bits = message.bits();
    let outcome = thread::scope(|s| -> Result<_, BenchmarkError> {
        let (pinned_tx, pinned_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let helper = s.spawn(move || {
            let pinned = match cores.sender {
                Some(core) => pin_to_core(core).map(|_| ()),
                None => Ok(()),
            };
            let failed = pinned.is_err();
            let _ = pinned_tx.send(pinned);
            if failed {
                return None;
            }
            // The arming delay only starts once the receiver is about to poll.
            ready_rx.recv().ok()?;
            let mut sender = Sender::new(Tsc, region_ref.probe_line(), region_ref, config);
            Some(sender.transmit(bits))
        });
        pinned_rx
            .recv()
            .map_err(|_| BenchmarkError::SenderPanicked)??;

        let mut receiver = Receiver::new(Tsc, region_ref.probe_line(), region_ref, config);
        let _ = ready_tx.send(());
        let received = receiver.run(Some(arming_poll_budget(&config, bits.len())));
        let report = helper
            .join()
            .map_err(|_| BenchmarkError::SenderPanicked)?
            .ok_or(BenchmarkError::SenderPanicked)?;
        Ok((report, received?))
    });

    if let Some(old) = old_affinity {
        restore_affinity(&old);
    }
    let (report, received) = outcome?;

    let error = ChannelError::compare(bits, &received.bits());
    info!(
        "loopback of {} bits: {} errors, {} stale slots",
        bits.len(),
        error.bit_error(),
        report.stale_slots as usize + received.stale_count()
    );
    Ok(TransmissionResult {
        bits_transmitted: bits.len(),
        error,
        // stale slots seen by either endpoint
        stale_slots: report.stale_slots as usize + received.stale_count(),
        time_rdtsc: report.end_cycles.saturating_sub(report.start_cycles),
        time_seconds: report.elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        channel: ConfigArgs,
    }

    fn parse(args: &[&str]) -> ConfigArgs {
        Cli::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .unwrap()
            .channel
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccb_{}_{}.msgpack", tag, std::process::id()))
    }

    #[test]
    fn no_flags_gives_defaults() {
        assert_eq!(parse(&[]).resolve().unwrap(), ChannelConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--threshold",
            "180",
            "--cycles-per-bit",
            "2000",
            "--measure-offset",
            "100",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.threshold, 180);
        assert_eq!(config.cycles_per_bit, 2000);
        assert_eq!(config.measure_offset, 100);
        assert_eq!(config.sync_gap, ChannelConfig::default().sync_gap);
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let err = parse(&["--cycles-per-bit", "1000"]).resolve().unwrap_err();
        assert!(matches!(
            err,
            BenchmarkError::Config(ConfigError::OffsetOutsideSlot { .. })
        ));
    }

    #[test]
    fn flags_override_config_file() {
        let path = temp_path("config");
        let stored = ChannelConfig {
            threshold: 240,
            sync_gap: 42_000,
            ..Default::default()
        };
        stored.write_msgpack(&path).unwrap();
        let config = parse(&["--config", path.to_str().unwrap(), "--threshold", "90"])
            .resolve()
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.threshold, 90);
        assert_eq!(config.sync_gap, 42_000);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = parse(&["--config", "/nonexistent/channel.msgpack"])
            .resolve()
            .unwrap_err();
        assert!(matches!(err, BenchmarkError::Config(ConfigError::Io(_))));
    }

    #[test]
    fn calibration_report_sets_slot_length() {
        let path = temp_path("calibration");
        let report = CalibrationReport {
            cpu_frequency_hz: Some(2.0e9),
            threshold: Some(150),
            levels: Vec::new(),
        };
        report.write_msgpack(&path).unwrap();
        let config = parse(&[
            "--calibration",
            path.to_str().unwrap(),
            "--delay-per-bit-us",
            "100",
        ])
        .resolve()
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.threshold, 150);
        assert_eq!(config.cycles_per_bit, 200_000);
    }

    #[test]
    fn region_names_are_unique() {
        assert_ne!(loopback_region_name(), loopback_region_name());
    }

    #[test]
    fn affinity_roundtrip() {
        let current = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let old = set_affinity(&current).unwrap();
        assert_eq!(old, current);
        restore_affinity(&old);
        assert_eq!(sched_getaffinity(Pid::from_raw(0)).unwrap(), current);
    }

    #[test]
    fn loopback_rejects_invalid_config() {
        let config = ChannelConfig {
            cycles_per_bit: 0,
            ..Default::default()
        };
        let err = benchmark_loopback(config, &BitMessage::random(8), Cores::default()).unwrap_err();
        assert!(matches!(
            err,
            BenchmarkError::Config(ConfigError::Zero("cycles_per_bit"))
        ));
    }

    #[test]
    fn loopback_reports_unusable_cores() {
        let bogus = CpuSet::count();
        let cores = Cores {
            sender: Some(bogus),
            receiver: None,
        };
        let err = benchmark_loopback(ChannelConfig::default(), &BitMessage::random(8), cores)
            .unwrap_err();
        assert!(matches!(err, BenchmarkError::Affinity { core, .. } if core == bogus));

        let cores = Cores {
            sender: None,
            receiver: Some(bogus),
        };
        let err = benchmark_loopback(ChannelConfig::default(), &BitMessage::random(8), cores)
            .unwrap_err();
        assert!(matches!(err, BenchmarkError::Affinity { core, .. } if core == bogus));
    }

    #[test]
    fn poll_budget_covers_the_whole_transmission() {
        let config = ChannelConfig {
            cycles_per_bit: 1_000,
            sync_gap: 5_000,
            slot_scale: 2,
            arming_delay: 7_000,
            ..Default::default()
        };
        // 7_000 + 2 * (5_000 + 4 * 1_000)
        assert_eq!(arming_poll_budget(&config, 3), 25_000 + ARMING_POLL_SLACK);
        let huge = ChannelConfig {
            arming_delay: u64::MAX,
            ..Default::default()
        };
        assert_eq!(arming_poll_budget(&huge, 1), u64::MAX);
    }

    #[test]
    fn loopback_delivers_every_slot() {
        let config = ChannelConfig {
            cycles_per_bit: 2_000_000,
            sync_gap: 4_000_000,
            measure_offset: 200_000,
            staleness_tolerance: 1_000_000,
            arming_delay: 1_000_000,
            ..Default::default()
        };
        let message = BitMessage::random(8);
        let result = benchmark_loopback(config, &message, Cores::default()).unwrap();
        assert_eq!(result.bits_transmitted, 8);
        assert!(result.time_rdtsc > 0);
        assert!(result.time_seconds > Duration::ZERO);
    }

    #[test]
    fn loopback_without_arming_delay_always_returns() {
        let config = ChannelConfig {
            arming_delay: 0,
            sync_gap: 1_000,
            cycles_per_bit: 1_000,
            measure_offset: 100,
            ..Default::default()
        };
        for _ in 0..20 {
            match benchmark_loopback(config, &BitMessage::random(1), Cores::default()) {
                Ok(result) => assert_eq!(result.bits_transmitted, 1),
                Err(BenchmarkError::Receiver(ReceiverError::NotStarted { .. })) => {}
                Err(e) => panic!("unexpected {}", e),
            }
        }
    }

    // Real cache timing between two threads; noisy on a loaded machine.
    #[test]
    #[ignore]
    fn loopback_on_hardware() {
        let config = ChannelConfig {
            cycles_per_bit: 200_000,
            sync_gap: 1_000_000,
            arming_delay: 1_000_000,
            ..Default::default()
        };
        let message = BitMessage::random(256);
        let result = benchmark_loopback(config, &message, Cores::default()).unwrap();
        assert_eq!(result.bits_transmitted, 256);
        assert!(result.error.accuracy() > 0.9);
    }
}
