#![deny(unsafe_op_in_unsafe_fn)]

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
}

pub trait HitClassifier: Debug + Send + Sync {
    fn is_time_hit(&self, time: u64) -> bool;

    fn is_time_miss(&self, time: u64) -> bool {
        !self.is_time_hit(time)
    }

    fn classify(&self, time: u64) -> CacheStatus {
        if self.is_time_hit(time) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }
}

/// Latency boundary between a cache hit and a memory access.
///
/// A hit is strictly faster than `cycles`; a measurement equal to the
/// threshold is a miss. Every classification goes through `is_time_hit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub cycles: u64,
}

impl Threshold {
    pub const fn new(cycles: u64) -> Self {
        Threshold { cycles }
    }
}

impl HitClassifier for Threshold {
    fn is_time_hit(&self, time: u64) -> bool {
        time < self.cycles
    }
}

/// The only operations timing code may perform on a shared cache line.
///
/// Implementations backed by real memory keep the address valid for their
/// whole lifetime, so the methods are safe to call. Test doubles inject
/// latencies instead of touching hardware.
pub trait CacheLine {
    /// Load the line, bringing it into the cache hierarchy.
    fn touch(&self);
    /// Write the line back and drop it from every cache level.
    fn evict(&self);
    /// Time a single load of the line, in cycles.
    fn measure_latency(&self) -> u64;
}

impl<T: CacheLine + ?Sized> CacheLine for &T {
    fn touch(&self) {
        (**self).touch()
    }

    fn evict(&self) {
        (**self).evict()
    }

    fn measure_latency(&self) -> u64 {
        (**self).measure_latency()
    }
}
