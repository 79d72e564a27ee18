#![deny(unsafe_op_in_unsafe_fn)]

// Cross-process Flush+Reload covert channel.
//
// The sender and receiver never talk to each other. They share one mapped
// region and agree on a slot schedule measured in TSC cycles. In slot i the
// sender loads the probe line to send a one and stays idle to send a zero; a
// little later in the same slot the receiver times a reload of that line
// and flushes it for the next slot.

pub mod config;
pub mod naive;
pub mod receiver;
pub mod region;
pub mod rendezvous;
pub mod sender;

#[cfg(test)]
mod mock;

pub use config::{ChannelConfig, ConfigError};
pub use naive::NaiveFlushAndReload;
pub use receiver::{
    bit_for, Receiver, ReceiverError, ReceiverState, RecoveredBit, RecoveredBits,
};
pub use region::{
    ChannelRegion, RegionError, StartFlag, DEFAULT_SHM_NAME, DEFAULT_SHM_SIZE, MIN_SHM_SIZE,
};
pub use rendezvous::{Clock, Rendezvous, SlotTiming, Tsc};
pub use sender::{Sender, SenderReport, Synchronized};
