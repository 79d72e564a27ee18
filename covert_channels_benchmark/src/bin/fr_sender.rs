#![deny(unsafe_op_in_unsafe_fn)]

use clap::Parser;
use covert_channels_benchmark::{pin_to_core, ConfigArgs};
use covert_channels_evaluation::{BitMessage, MAX_MSG_SIZE};
use flush_reload::{ChannelRegion, Sender, Tsc, DEFAULT_SHM_NAME, DEFAULT_SHM_SIZE};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(about = "Flush+Reload covert channel sender")]
struct FrSender {
    #[arg(help = "File of ASCII '0' and '1' characters to transmit")]
    message: PathBuf,
    #[arg(long, help = "Send the file's bytes as they are, most significant bit first")]
    raw: bool,
    #[arg(long, default_value = DEFAULT_SHM_NAME)]
    name: String,
    #[arg(long, default_value_t = DEFAULT_SHM_SIZE)]
    size: usize,
    #[arg(long, help = "Pin the sender to this core")]
    core: Option<usize>,
    #[command(flatten)]
    channel: ConfigArgs,
}

fn main() {
    env_logger::init();
    let args = FrSender::parse();

    let config = match args.channel.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid channel configuration: {}", e);
            process::exit(1);
        }
    };
    let loaded = if args.raw {
        BitMessage::load_raw(&args.message, MAX_MSG_SIZE)
    } else {
        BitMessage::load(&args.message, MAX_MSG_SIZE)
    };
    let message = match loaded {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error opening {}: {}", args.message.display(), e);
            process::exit(1);
        }
    };
    if let Some(core) = args.core {
        if let Err(e) = pin_to_core(core) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
    let region = match ChannelRegion::create(&args.name, args.size) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to create shared region {}: {}", args.name, e);
            process::exit(1);
        }
    };

    let mut sender = Sender::new(Tsc, region.probe_line(), &region, config);
    let sync = sender.synchronize();
    println!("Synchronization complete. Starting transmission...");
    let report = sender.send(sync, message.bits());

    println!("Message sent successfully");
    println!(
        "Time taken to send the message: {}",
        report.elapsed.as_secs_f64()
    );
    println!("Message size: {}", message.len());
    println!("Bits per second: {}", report.bits_per_second());
    if report.stale_slots > 0 {
        println!("Late slots: {}", report.stale_slots);
    }
    // Dropping the region unlinks it.
}
