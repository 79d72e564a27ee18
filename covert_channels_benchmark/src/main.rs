#![deny(unsafe_op_in_unsafe_fn)]

use clap::Parser;
use covert_channels_benchmark::{benchmark_loopback, BenchmarkError, ConfigArgs, Cores};
use covert_channels_evaluation::{BitMessage, TransmissionResult};
use flush_reload::ChannelConfig;
use std::io::{stdout, Write};
use std::process;

// Both endpoints live in this process, nobody needs time to start the receiver.
const LOOPBACK_ARMING_DELAY: u64 = 1_000_000;

#[derive(Parser)]
#[command(about = "Run sender and receiver in one process and report channel capacity")]
struct Benchmark {
    #[command(flatten)]
    channel: ConfigArgs,
    #[arg(long, default_value_t = 16, help = "Runs per message length")]
    iterations: usize,
    #[arg(long, default_value_t = 1 << 10, help = "Longest random message, in bits")]
    max_bits: usize,
    #[arg(long)]
    sender_core: Option<usize>,
    #[arg(long)]
    receiver_core: Option<usize>,
}

struct BenchmarkStats {
    average_p: f64,
    var_p: f64,
    average_c: f64,
    var_c: f64,
    average_t: f64,
    var_t: f64,
}

fn run_benchmark(
    config: ChannelConfig,
    cores: Cores,
    num_iter: usize,
    num_bits: usize,
) -> Result<BenchmarkStats, BenchmarkError> {
    let mut results: Vec<TransmissionResult> = Vec::new();
    print!("Benchmarking F+R with {} bits", num_bits);
    for _ in 0..num_iter {
        print!(".");
        let _ = stdout().flush();
        let message = BitMessage::random(num_bits);
        results.push(benchmark_loopback(config, &message, cores)?);
    }
    println!();

    let n = results.len() as f64;
    let mut average_p = 0.0;
    let mut average_c = 0.0;
    let mut average_t = 0.0;
    for result in results.iter() {
        println!(
            "C: {}, T: {}, stale: {}",
            result.capacity(),
            result.true_capacity(),
            result.stale_slots
        );
        println!(
            "Detailed:\"F+R\",{},{},{},{}",
            num_bits,
            result.csv(),
            result.capacity(),
            result.true_capacity()
        );
        average_p += result.error.error_rate();
        average_c += result.capacity();
        average_t += result.true_capacity();
    }
    average_p /= n;
    average_c /= n;
    average_t /= n;
    println!(
        "F+R - {} Average p: {} C: {}, T: {}",
        num_bits, average_p, average_c, average_t
    );

    let mut var_p = 0.0;
    let mut var_c = 0.0;
    let mut var_t = 0.0;
    for result in results.iter() {
        let p = result.error.error_rate() - average_p;
        var_p += p * p;
        let c = result.capacity() - average_c;
        var_c += c * c;
        let t = result.true_capacity() - average_t;
        var_t += t * t;
    }
    var_p /= n;
    var_c /= n;
    var_t /= n;
    println!(
        "F+R - {} Variance of p: {}, C: {}, T: {}",
        num_bits, var_p, var_c, var_t
    );
    println!(
        "CSV:\"F+R\",{},{},{},{},{},{},{}",
        num_bits, average_p, average_c, average_t, var_p, var_c, var_t
    );
    Ok(BenchmarkStats {
        average_p,
        var_p,
        average_c,
        var_c,
        average_t,
        var_t,
    })
}

fn main() {
    env_logger::init();
    let args = Benchmark::parse();

    let mut config = match args.channel.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid channel configuration: {}", e);
            process::exit(1);
        }
    };
    if args.channel.arming_delay.is_none() {
        config.arming_delay = LOOPBACK_ARMING_DELAY;
    }
    let cores = Cores {
        sender: args.sender_core,
        receiver: args.receiver_core,
    };

    println!("Detailed:Benchmark,Bits,{},C,T", TransmissionResult::csv_header());
    println!("CSV:Benchmark,Bits,p,C,T,var_p,var_C,var_T");
    let mut best: Option<(usize, BenchmarkStats)> = None;
    let mut num_bits = 8;
    while num_bits <= args.max_bits.max(8) {
        match run_benchmark(config, cores, args.iterations.max(1), num_bits) {
            Ok(stats) => {
                if best.as_ref().map_or(true, |(_, b)| stats.average_t > b.average_t) {
                    best = Some((num_bits, stats));
                }
            }
            Err(e) => {
                eprintln!("Benchmark failed: {}", e);
                process::exit(1);
            }
        }
        num_bits <<= 1;
    }
    if let Some((num_bits, stats)) = best {
        println!(
            "Best true capacity at {} bits: T = {} (var {}), C = {} (var {}), p = {} (var {})",
            num_bits,
            stats.average_t,
            stats.var_t,
            stats.average_c,
            stats.var_c,
            stats.average_p,
            stats.var_p
        );
    }
}
