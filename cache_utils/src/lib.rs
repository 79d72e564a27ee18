#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::assert_cfg;

assert_cfg!(
    target_arch = "x86_64",
    "rdtsc and clflush are only wired up for x86_64"
);

pub mod calibration;
pub mod mmap;
pub mod shm;

use core::arch::x86_64 as arch_x86;
use core::ptr;

pub const CACHE_LINE_SIZE: usize = 64;
pub const PAGE_SIZE: usize = 1 << 12;

// rdtsc no fence
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}
// rdtsc (has mfence before and after)
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe { arch_x86::_mm_mfence() };
    let tsc: u64 = unsafe { arch_x86::_rdtsc() };
    unsafe { arch_x86::_mm_mfence() };
    tsc
}

pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

// flush (cflush)
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}
