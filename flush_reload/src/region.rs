use crate::naive::NaiveFlushAndReload;
use cache_utils::shm::{ShmError, SharedMemory};
use cache_utils::{CACHE_LINE_SIZE, PAGE_SIZE};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

pub const DEFAULT_SHM_NAME: &str = "/smem";
pub const DEFAULT_SHM_SIZE: usize = PAGE_SIZE;

pub const FLAG_OFFSET: usize = 0;
// Half a page away from the flag: polling the flag must never pull the
// probed line (or its adjacent-line prefetch buddy) into the cache.
pub const PROBE_OFFSET: usize = 2048;
pub const MIN_SHM_SIZE: usize = PROBE_OFFSET + CACHE_LINE_SIZE;

pub trait StartFlag {
    fn is_set(&self) -> bool;
    fn raise(&self);
    fn lower(&self);
}

impl<T: StartFlag + ?Sized> StartFlag for &T {
    fn is_set(&self) -> bool {
        (**self).is_set()
    }

    fn raise(&self) {
        (**self).raise()
    }

    fn lower(&self) {
        (**self).lower()
    }
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("shared region of {size} bytes is smaller than the {min} byte layout")]
    TooSmall { size: usize, min: usize },
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// The shared channel region: start flag in byte 0, probe line further in.
#[derive(Debug)]
pub struct ChannelRegion {
    memory: SharedMemory,
}

impl ChannelRegion {
    /// Sender side. The region comes back zeroed, so the flag is down.
    pub fn create(name: &str, size: usize) -> Result<Self, RegionError> {
        check_size(size)?;
        let memory = SharedMemory::create(name, size)?;
        log::info!("created channel region {} ({} bytes)", name, size);
        Ok(ChannelRegion { memory })
    }

    /// Receiver side. Fails if the sender has not created the region yet.
    pub fn open(name: &str, size: usize) -> Result<Self, RegionError> {
        check_size(size)?;
        let memory = SharedMemory::open(name, size)?;
        log::info!("opened channel region {} ({} bytes)", name, size);
        Ok(ChannelRegion { memory })
    }

    pub fn name(&self) -> &str {
        self.memory.name()
    }

    pub fn probe_address(&self) -> *const u8 {
        unsafe { self.memory.as_ptr().add(PROBE_OFFSET) }
    }

    pub fn probe_line(&self) -> NaiveFlushAndReload<'_> {
        unsafe { NaiveFlushAndReload::new(self.probe_address()) }
    }

    fn flag(&self) -> &AtomicU8 {
        unsafe { &*(self.memory.as_ptr().add(FLAG_OFFSET) as *const AtomicU8) }
    }
}

impl StartFlag for ChannelRegion {
    fn is_set(&self) -> bool {
        self.flag().load(Ordering::Acquire) != 0
    }

    fn raise(&self) {
        self.flag().store(1, Ordering::Release);
    }

    fn lower(&self) {
        self.flag().store(0, Ordering::Release);
    }
}

fn check_size(size: usize) -> Result<(), RegionError> {
    if size < MIN_SHM_SIZE {
        return Err(RegionError::TooSmall {
            size,
            min: MIN_SHM_SIZE,
        });
    }
    Ok(())
}
