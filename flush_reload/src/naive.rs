use cache_side_channel::CacheLine;
use cache_utils::calibration::only_reload;
use cache_utils::{flush, maccess};
use std::marker::PhantomData;

/// Flush+Reload on a single shared line.
#[derive(Debug, Clone, Copy)]
pub struct NaiveFlushAndReload<'a> {
    addr: *const u8,
    _memory: PhantomData<&'a u8>,
}

impl<'a> NaiveFlushAndReload<'a> {
    /// # Safety
    ///
    /// addr needs to be a valid pointer to read for `'a`.
    pub unsafe fn new(addr: *const u8) -> Self {
        NaiveFlushAndReload {
            addr,
            _memory: PhantomData,
        }
    }

    pub fn address(&self) -> *const u8 {
        self.addr
    }
}

unsafe impl Send for NaiveFlushAndReload<'_> {}
unsafe impl Sync for NaiveFlushAndReload<'_> {}

impl CacheLine for NaiveFlushAndReload<'_> {
    fn touch(&self) {
        unsafe { maccess(self.addr) };
    }

    fn evict(&self) {
        unsafe { flush(self.addr) };
    }

    fn measure_latency(&self) -> u64 {
        unsafe { only_reload(self.addr) }
    }
}
