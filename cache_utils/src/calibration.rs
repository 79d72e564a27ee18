use crate::mmap::MMappedMemory;
use crate::{flush, maccess, rdtsc_fence, CACHE_LINE_SIZE, PAGE_SIZE};
use core::cmp::min;
use rand::seq::SliceRandom;
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub unsafe fn only_reload(p: *const u8) -> u64 {
    let t = unsafe { rdtsc_fence() };
    unsafe { maccess(p) };
    let end = unsafe { rdtsc_fence() };
    end - t
}

pub unsafe fn flush_and_reload(p: *const u8) -> u64 {
    unsafe { flush(p) };
    let t = unsafe { rdtsc_fence() };
    unsafe { maccess(p) };
    let end = unsafe { rdtsc_fence() };
    end - t
}

pub const BUCKET_SIZE: usize = 5;
pub const BUCKET_NUMBER: usize = 250;

pub const PROBE_STRIDE: usize = 512;
pub const PROBE_ITERATIONS: usize = 1000;
// Anything this slow was an interrupt, not a memory access.
pub const OUTLIER_CYCLES: u64 = 10_000;

pub const WORKING_SETS: [(usize, &str); 7] = [
    (8 << 10, "L1 Cache"),
    (32 << 10, "L1 Cache"),
    (128 << 10, "L2 Cache"),
    (512 << 10, "L2 Cache"),
    (2 << 20, "L3 Cache"),
    (8 << 20, "L3 Cache"),
    (32 << 20, "Main Memory"),
];

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("failed to map probe buffer: {0}")]
    Mmap(#[from] nix::Error),
    #[error("io error on calibration report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode calibration report: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode calibration report: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("probe buffer is not cache line aligned")]
    Unaligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbePattern {
    /// Shuffled stride offsets, defeats the stride prefetcher.
    Shuffled,
    /// Fixed odd stride walk, cheaper but prefetcher friendly.
    Strided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub label: String,
    pub size: usize,
    pub pattern: ProbePattern,
    pub average: f64,
    pub min: u64,
    pub max: u64,
    pub samples: usize,
}

impl LatencyStats {
    pub fn from_samples(
        label: &str,
        size: usize,
        pattern: ProbePattern,
        samples: impl IntoIterator<Item = u64>,
    ) -> LatencyStats {
        let mut total = 0u64;
        let mut count = 0usize;
        let mut min_cycles = u64::MAX;
        let mut max_cycles = 0;
        for cycles in samples.into_iter().filter(|c| *c < OUTLIER_CYCLES) {
            total += cycles;
            count += 1;
            min_cycles = min(min_cycles, cycles);
            max_cycles = max_cycles.max(cycles);
        }
        LatencyStats {
            label: label.to_owned(),
            size,
            pattern,
            average: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
            min: if count == 0 { 0 } else { min_cycles },
            max: max_cycles,
            samples: count,
        }
    }
}

pub fn probe_offsets(size: usize, pattern: ProbePattern) -> Vec<usize> {
    match pattern {
        ProbePattern::Shuffled => {
            let n = (size / PROBE_STRIDE).max(1);
            let mut offsets: Vec<usize> = (0..n).map(|i| (i * PROBE_STRIDE) % size).collect();
            offsets.shuffle(&mut rand::thread_rng());
            offsets
        }
        ProbePattern::Strided => (0..PROBE_ITERATIONS)
            .map(|i| (i * (PAGE_SIZE + 1)) % size)
            .collect(),
    }
}

/// Time single loads across a working set of `size` bytes.
pub fn measure_working_set(
    label: &str,
    size: usize,
    pattern: ProbePattern,
    iterations: usize,
) -> Result<LatencyStats, CalibrationError> {
    let m = MMappedMemory::new(size, |i| (i & 0xff) as u8)?;
    let array = m.slice();
    let offsets = probe_offsets(size, pattern);

    for &offset in offsets.iter() {
        unsafe { maccess(&array[offset] as *const u8) };
    }

    let samples = (0..iterations).map(|i| {
        let offset = offsets[i % offsets.len()];
        unsafe { only_reload(&array[offset] as *const u8) }
    });
    let stats = LatencyStats::from_samples(label, size, pattern, samples);
    log::debug!("{:?}", stats);
    Ok(stats)
}

/// Pick a hit/miss boundary from two latency histograms.
///
/// Returns the lower edge of the least populated bucket between the hit peak
/// and the first bucket where misses become frequent. A latency strictly
/// below the returned value is classified as a hit.
pub fn threshold_from_histograms(hit: &[u32], miss: &[u32], bucket_size: usize) -> Option<u64> {
    let n = min(hit.len(), miss.len());
    let mut hit_max = 0;
    let mut hit_max_i = 0;
    for i in 0..n {
        if hit_max < hit[i] {
            hit_max = hit[i];
            hit_max_i = i;
        }
    }
    let miss_min_i = (hit_max_i + 1..n).find(|&i| miss[i] > 3 /* Magic */)?;

    let mut best = u32::MAX;
    let mut best_i = miss_min_i;
    for i in hit_max_i + 1..=miss_min_i {
        if best > hit[i] + miss[i] {
            best = hit[i] + miss[i];
            best_i = i;
        }
    }
    Some((best_i * bucket_size) as u64)
}

pub fn calibrate_access(array: &[u8]) -> Result<Option<u64>, CalibrationError> {
    let pointer = array.as_ptr();
    if pointer as usize & (CACHE_LINE_SIZE - 1) != 0 {
        return Err(CalibrationError::Unaligned);
    }
    log::info!("calibrating reload threshold on {:p}", pointer);

    let mut hit_histogram = vec![0u32; BUCKET_NUMBER];
    let mut miss_histogram = hit_histogram.clone();
    let lines = array.len() / CACHE_LINE_SIZE;

    for line in 0..lines {
        let p = unsafe { pointer.add(line * CACHE_LINE_SIZE) };
        unsafe { maccess(p) };
        for _ in 0..(1 << 8) {
            let d = unsafe { only_reload(p) } as usize;
            hit_histogram[min(BUCKET_NUMBER - 1, d / BUCKET_SIZE)] += 1;
        }
        for _ in 0..(1 << 8) {
            let d = unsafe { flush_and_reload(p) } as usize;
            miss_histogram[min(BUCKET_NUMBER - 1, d / BUCKET_SIZE)] += 1;
        }
    }

    for i in 0..BUCKET_NUMBER {
        if hit_histogram[i] != 0 || miss_histogram[i] != 0 {
            log::trace!(
                "{:4}: {:10} {:10}",
                i * BUCKET_SIZE,
                hit_histogram[i],
                miss_histogram[i]
            );
        }
    }
    let threshold = threshold_from_histograms(&hit_histogram, &miss_histogram, BUCKET_SIZE);
    log::info!("reload threshold {:?}", threshold);
    Ok(threshold)
}

pub fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .find_map(|line| line.split(':').nth(1)?.trim().parse::<f64>().ok())
}

pub fn cpu_frequency_hz() -> Option<f64> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    parse_cpu_mhz(&cpuinfo).map(|mhz| mhz * 1_000_000.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub cpu_frequency_hz: Option<f64>,
    pub threshold: Option<u64>,
    pub levels: Vec<LatencyStats>,
}

impl CalibrationReport {
    pub const EXTENSION: &'static str = "calibration.msgpack";

    pub fn read_msgpack(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let buf = std::fs::read(path)?;
        let mut deserializer = Deserializer::new(&buf[..]);
        Ok(CalibrationReport::deserialize(&mut deserializer)?)
    }

    pub fn write_msgpack(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let mut f = std::fs::File::create(path)?;
        let mut s = Serializer::new(&mut f);
        self.serialize(&mut s)?;
        Ok(())
    }
}

/// Run the whole probe: every working set with both patterns, then the
/// reload threshold on a dedicated page.
pub fn calibrate(iterations: usize) -> Result<CalibrationReport, CalibrationError> {
    let mut levels = Vec::new();
    for pattern in [ProbePattern::Shuffled, ProbePattern::Strided] {
        for (size, label) in WORKING_SETS {
            levels.push(measure_working_set(label, size, pattern, iterations)?);
        }
    }
    let page = MMappedMemory::new(PAGE_SIZE, |i| i as u8)?;
    let threshold = calibrate_access(page.slice())?;
    Ok(CalibrationReport {
        cpu_frequency_hz: cpu_frequency_hz(),
        threshold,
        levels,
    })
}
