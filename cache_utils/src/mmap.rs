use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::sys::mman;

/// Private anonymous mapping used as a probing buffer.
///
/// Pages are populated by the initializer so that the first timed access
/// does not also pay for a page fault.
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
}

impl MMappedMemory {
    pub fn new(
        size: usize,
        initializer: impl Fn(usize) -> u8,
    ) -> Result<MMappedMemory, nix::Error> {
        let length = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let flags = mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS;
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                flags,
            )
        }?;
        let mut m = MMappedMemory {
            pointer: p.cast(),
            size,
        };
        for (i, byte) in m.slice_mut().iter_mut().enumerate() {
            *byte = initializer(i);
        }
        Ok(m)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer.cast::<c_void>(), self.size) } {
            log::warn!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}
