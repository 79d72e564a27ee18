use crate::config::ChannelConfig;
use crate::region::StartFlag;
use crate::rendezvous::{Clock, Rendezvous, SlotTiming};
use cache_side_channel::{CacheLine, CacheStatus, HitClassifier, Threshold};
use log::{debug, info, warn};
use thiserror::Error;

/// Flush+Reload polarity: the sender loaded the line iff the reload hit.
/// Flipping this silently inverts every bit.
pub fn bit_for(status: CacheStatus) -> bool {
    status == CacheStatus::Hit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Armed,
    Receiving { slot: u64 },
    Terminal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("start flag not raised after {polls} polls")]
    NotStarted { polls: u64 },
    #[error("receiver is {0:?}, cannot arm again")]
    NotArmed(ReceiverState),
    #[error("receiver is {0:?}, it must be armed before receiving")]
    NotReceiving(ReceiverState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredBit {
    pub bit: bool,
    pub latency: u64,
    /// The slot was reached later than the staleness tolerance allows.
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredBits {
    bits: Vec<RecoveredBit>,
}

impl RecoveredBits {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecoveredBit> {
        self.bits.iter()
    }

    pub fn bits(&self) -> Vec<bool> {
        self.bits.iter().map(|b| b.bit).collect()
    }

    pub fn stale_count(&self) -> usize {
        self.bits.iter().filter(|b| b.stale).count()
    }

    /// Average reload latency over the slots that decoded as `bit`.
    pub fn mean_latency(&self, bit: bool) -> Option<f64> {
        let (sum, count) = self
            .bits
            .iter()
            .filter(|b| b.bit == bit)
            .fold((0u64, 0u64), |(sum, count), b| {
                (sum.saturating_add(b.latency), count + 1)
            });
        if count == 0 {
            None
        } else {
            Some(sum as f64 / count as f64)
        }
    }

    pub fn to_bit_string(&self) -> String {
        self.bits
            .iter()
            .map(|b| if b.bit { '1' } else { '0' })
            .collect()
    }
}

/// Receiving endpoint: Armed until the start flag goes up, then one
/// measurement per slot until the flag goes down again.
#[derive(Debug)]
pub struct Receiver<C: Clock, L: CacheLine, F: StartFlag> {
    clock: C,
    line: L,
    flag: F,
    config: ChannelConfig,
    classifier: Threshold,
    state: ReceiverState,
    rendezvous: Option<Rendezvous>,
}

impl<C: Clock, L: CacheLine, F: StartFlag> Receiver<C, L, F> {
    pub fn new(clock: C, line: L, flag: F, config: ChannelConfig) -> Self {
        Receiver {
            clock,
            line,
            flag,
            classifier: config.classifier(),
            config,
            state: ReceiverState::Armed,
            rendezvous: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Poll the start flag, then wait out the synchronization gap.
    ///
    /// `max_polls` bounds the polling loop; `None` waits forever.
    pub fn arm(&mut self, max_polls: Option<u64>) -> Result<SlotTiming, ReceiverError> {
        if self.state != ReceiverState::Armed {
            return Err(ReceiverError::NotArmed(self.state));
        }
        let mut polls = 0u64;
        while !self.flag.is_set() {
            polls += 1;
            if let Some(max) = max_polls {
                if polls >= max {
                    return Err(ReceiverError::NotStarted { polls });
                }
            }
            core::hint::spin_loop();
        }
        let origin = self.clock.now();
        let rendezvous = Rendezvous::new(origin, &self.config);
        self.rendezvous = Some(rendezvous);
        self.state = ReceiverState::Receiving { slot: 0 };
        info!("start flag observed after {} polls, origin {}", polls, origin);

        let timing = rendezvous.wait_slot(&self.clock, 0);
        // Every slot starts from a cold line.
        self.line.evict();
        info!("synchronization complete at {}", timing.reached);
        Ok(timing)
    }

    pub fn receive(&mut self) -> Result<RecoveredBits, ReceiverError> {
        let rendezvous = match (self.state, self.rendezvous) {
            (ReceiverState::Receiving { .. }, Some(r)) => r,
            (state, _) => return Err(ReceiverError::NotReceiving(state)),
        };
        let tolerance = self.config.staleness_tolerance;
        let mut recovered = RecoveredBits::default();
        let mut slot = 1;
        loop {
            let timing = rendezvous.wait_slot_offset(&self.clock, slot, self.config.measure_offset);
            if !self.flag.is_set() {
                break;
            }
            let latency = self.line.measure_latency();
            let status = self.classifier.classify(latency);
            self.line.evict();

            let stale = timing.is_stale(tolerance);
            if stale {
                warn!("slot {} measured {} cycles late", slot, timing.lateness());
            }
            recovered.bits.push(RecoveredBit {
                bit: bit_for(status),
                latency,
                stale,
            });
            debug!("slot {}: {} cycles, {:?}", slot, latency, status);
            self.state = ReceiverState::Receiving { slot };
            slot += 1;
        }
        self.state = ReceiverState::Terminal;
        info!(
            "start flag cleared, received {} bits ({} stale)",
            recovered.len(),
            recovered.stale_count()
        );
        Ok(recovered)
    }

    pub fn run(&mut self, max_polls: Option<u64>) -> Result<RecoveredBits, ReceiverError> {
        self.arm(max_polls)?;
        self.receive()
    }
}
