#![deny(unsafe_op_in_unsafe_fn)]

use clap::Parser;
use covert_channels_benchmark::{pin_to_core, ConfigArgs};
use covert_channels_evaluation::{accuracy, BitMessage, MAX_MSG_SIZE};
use flush_reload::{ChannelRegion, Receiver, Tsc, DEFAULT_SHM_NAME, DEFAULT_SHM_SIZE};
use std::io::{stdout, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(about = "Flush+Reload covert channel receiver")]
struct FrReceiver {
    #[arg(long, default_value = DEFAULT_SHM_NAME)]
    name: String,
    #[arg(long, default_value_t = DEFAULT_SHM_SIZE)]
    size: usize,
    #[arg(long, help = "Message the sender transmits, to score the recovered bits")]
    expected: Option<PathBuf>,
    #[arg(long, help = "Write the recovered bits to this file")]
    output: Option<PathBuf>,
    #[arg(long, help = "Pin the receiver to this core")]
    core: Option<usize>,
    #[command(flatten)]
    channel: ConfigArgs,
}

fn main() {
    env_logger::init();
    let args = FrReceiver::parse();

    let config = match args.channel.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid channel configuration: {}", e);
            process::exit(1);
        }
    };
    let expected = match args.expected.as_ref().map(|p| BitMessage::load(p, MAX_MSG_SIZE)) {
        None => None,
        Some(Ok(m)) => Some(m),
        Some(Err(e)) => {
            eprintln!("Error opening expected message: {}", e);
            process::exit(1);
        }
    };
    if let Some(core) = args.core {
        if let Err(e) = pin_to_core(core) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
    let region = match ChannelRegion::open(&args.name, args.size) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to open shared region {}: {}", args.name, e);
            process::exit(1);
        }
    };

    let mut receiver = Receiver::new(Tsc, region.probe_line(), &region, config);
    println!("Ready to receive");
    let _ = stdout().flush();
    // Polls until the sender raises the flag.
    let received = receiver.arm(None).and_then(|_| receiver.receive());
    let received = match received {
        Ok(bits) => bits,
        Err(e) => {
            eprintln!("Receive failed: {}", e);
            process::exit(1);
        }
    };

    println!("Received {} bits", received.len());
    if let (Some(one), Some(zero)) = (received.mean_latency(true), received.mean_latency(false)) {
        println!("Mean reload latency: {:.1} cycles on ones, {:.1} on zeros", one, zero);
    }
    if received.stale_count() > 0 {
        println!("Late slots: {}", received.stale_count());
    }
    if let Some(path) = args.output {
        if let Err(e) = std::fs::write(&path, received.to_bit_string()) {
            eprintln!("Failed to write {}: {}", path.display(), e);
            process::exit(1);
        }
    }
    if let Some(expected) = expected {
        println!(
            "Accuracy (%): {}",
            accuracy(expected.bits(), &received.bits()) * 100.0
        );
    }
}
