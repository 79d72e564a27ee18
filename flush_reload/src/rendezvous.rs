use crate::config::ChannelConfig;
use cache_utils::rdtsc_fence;

pub trait Clock {
    fn now(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// Fenced time stamp counter. Both endpoints rely on it ticking at the same
/// rate on every core, which holds for an invariant TSC.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tsc;

impl Clock for Tsc {
    fn now(&self) -> u64 {
        unsafe { rdtsc_fence() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTiming {
    pub slot: u64,
    pub deadline: u64,
    pub reached: u64,
}

impl SlotTiming {
    pub fn lateness(&self) -> u64 {
        self.reached.saturating_sub(self.deadline)
    }

    pub fn is_stale(&self, tolerance: u64) -> bool {
        self.lateness() > tolerance
    }
}

/// Slot schedule anchored on a locally captured origin.
///
/// Waiting never detects a missed deadline: a late caller returns right away
/// and the lateness is only reported through [`SlotTiming`].
#[derive(Debug, Clone, Copy)]
pub struct Rendezvous {
    origin: u64,
    sync_gap: u64,
    cycles_per_bit: u64,
    slot_scale: u64,
}

impl Rendezvous {
    pub fn new(origin: u64, config: &ChannelConfig) -> Self {
        Rendezvous {
            origin,
            sync_gap: config.sync_gap,
            cycles_per_bit: config.cycles_per_bit,
            slot_scale: config.slot_scale,
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn deadline(&self, slot: u64) -> u64 {
        let offset = self
            .cycles_per_bit
            .saturating_mul(slot)
            .saturating_add(self.sync_gap)
            .saturating_mul(self.slot_scale);
        self.origin.saturating_add(offset)
    }

    pub fn wait_slot(&self, clock: &impl Clock, slot: u64) -> SlotTiming {
        self.wait_slot_offset(clock, slot, 0)
    }

    pub fn wait_slot_offset(&self, clock: &impl Clock, slot: u64, offset: u64) -> SlotTiming {
        let deadline = self.deadline(slot).saturating_add(offset);
        let reached = wait_until(clock, deadline);
        SlotTiming {
            slot,
            deadline,
            reached,
        }
    }
}

/// Spin until the clock reaches `deadline`, returns the first reading at or
/// past it.
pub fn wait_until(clock: &impl Clock, deadline: u64) -> u64 {
    loop {
        let now = clock.now();
        if now >= deadline {
            return now;
        }
        core::hint::spin_loop();
    }
}
