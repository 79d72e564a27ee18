#![deny(unsafe_op_in_unsafe_fn)]

// Offline helper: measures the hit/miss latency gap of the host so an
// operator can pick the covert channel threshold and slot length.

use cache_utils::calibration::{calibrate, CalibrationReport, PROBE_ITERATIONS};
use clap::Parser;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(about = "Measure cache and memory access latency in CPU cycles")]
struct CacheLatency {
    #[arg(long, default_value_t = PROBE_ITERATIONS, help = "Timed accesses per working set")]
    iterations: usize,
    #[arg(long, help = "Write the calibration report (MessagePack) to this file")]
    output: Option<PathBuf>,
}

fn print_report(report: &CalibrationReport) {
    println!("Cache Latency Measurement Tool");
    println!("==============================\n");
    if let Some(freq) = report.cpu_frequency_hz {
        println!("CPU Frequency: {:.1} MHz", freq / 1_000_000.0);
    }
    println!("Note: Times are in CPU cycles\n");

    let mut pattern = None;
    for level in report.levels.iter() {
        if pattern != Some(level.pattern) {
            pattern = Some(level.pattern);
            println!("\nPattern: {:?}", level.pattern);
            println!("Cache Level     Size         Average Latency");
            println!("-----------------------------------------------");
        }
        println!(
            "{:<15} Size: {:8} KB | Avg: {:6.1} cycles | Min: {:4} | Max: {:4}",
            level.label,
            level.size / 1024,
            level.average,
            level.min,
            level.max
        );
    }
    match report.threshold {
        Some(t) => println!("\nSuggested reload threshold: {} cycles", t),
        None => println!("\nNo clear hit/miss separation found"),
    }
}

fn main() {
    env_logger::init();
    let args = CacheLatency::parse();

    let report = match calibrate(args.iterations) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Calibration failed: {}", e);
            process::exit(1);
        }
    };
    print_report(&report);

    if let Some(path) = args.output {
        if let Err(e) = report.write_msgpack(&path) {
            eprintln!("Failed to write {}: {}", path.display(), e);
            process::exit(1);
        }
        println!("Report written to {}", path.display());
    }
}
