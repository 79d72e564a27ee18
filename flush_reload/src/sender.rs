use crate::config::ChannelConfig;
use crate::region::StartFlag;
use crate::rendezvous::{wait_until, Clock, Rendezvous, SlotTiming};
use cache_side_channel::CacheLine;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Synchronized {
    rendezvous: Rendezvous,
    started: Instant,
    pub timing: SlotTiming,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderReport {
    pub origin: u64,
    pub slots: u64,
    pub ones: u64,
    pub stale_slots: u64,
    /// Cycle count at the end of the synchronization gap.
    pub start_cycles: u64,
    /// Cycle count when the flag went down.
    pub end_cycles: u64,
    pub elapsed: Duration,
}

impl SenderReport {
    pub fn bits_per_second(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.slots as f64 / self.elapsed.as_secs_f64()
    }
}

/// Transmitting endpoint. Only ever loads the probe line; the start flag is
/// its single write to the region.
#[derive(Debug)]
pub struct Sender<C: Clock, L: CacheLine, F: StartFlag> {
    clock: C,
    line: L,
    flag: F,
    config: ChannelConfig,
    startup: u64,
}

impl<C: Clock, L: CacheLine, F: StartFlag> Sender<C, L, F> {
    pub fn new(clock: C, line: L, flag: F, config: ChannelConfig) -> Self {
        let startup = clock.now();
        Sender {
            clock,
            line,
            flag,
            config,
            startup,
        }
    }

    /// Wait out the arming delay, raise the start flag and sit through the
    /// synchronization gap.
    pub fn synchronize(&mut self) -> Synchronized {
        let armed = self.startup.saturating_add(self.config.arming_delay);
        wait_until(&self.clock, armed);

        let started = Instant::now();
        let origin = self.clock.now();
        let rendezvous = Rendezvous::new(origin, &self.config);
        self.flag.raise();
        info!("start flag raised, origin {}", origin);

        let timing = rendezvous.wait_slot(&self.clock, 0);
        info!("synchronization complete at {}", timing.reached);
        Synchronized {
            rendezvous,
            started,
            timing,
        }
    }

    /// Slot `i` carries `bits[i - 1]`: a one is a load of the probe line, a
    /// zero is doing nothing. The flag goes down on the slot after the last.
    pub fn send(&mut self, sync: Synchronized, bits: &[bool]) -> SenderReport {
        let rendezvous = sync.rendezvous;
        let tolerance = self.config.staleness_tolerance;
        let mut ones = 0;
        let mut stale_slots = 0;
        for (i, bit) in bits.iter().enumerate() {
            let slot = i as u64 + 1;
            let timing = rendezvous.wait_slot(&self.clock, slot);
            if *bit {
                self.line.touch();
                ones += 1;
            }
            if timing.is_stale(tolerance) {
                stale_slots += 1;
                warn!("slot {} sent {} cycles late", slot, timing.lateness());
            }
            debug!("slot {}: {}", slot, *bit as u8);
        }

        let last = bits.len() as u64 + 1;
        let end = rendezvous.wait_slot(&self.clock, last);
        self.flag.lower();
        let elapsed = sync.started.elapsed();
        info!(
            "end of transmission: {} slots, {} stale",
            bits.len(),
            stale_slots
        );
        SenderReport {
            origin: rendezvous.origin(),
            slots: bits.len() as u64,
            ones,
            stale_slots,
            start_cycles: sync.timing.reached,
            end_cycles: end.reached,
            elapsed,
        }
    }

    pub fn transmit(&mut self, bits: &[bool]) -> SenderReport {
        let sync = self.synchronize();
        self.send(sync, bits)
    }
}
