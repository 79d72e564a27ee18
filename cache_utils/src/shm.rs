//! Named POSIX shared memory.
//!
//! Both ends of a cross-process channel map the same physical pages through
//! a well-known name. Only the creating side unlinks the name, and only on a
//! clean drop: a killed creator leaves a stale name behind, which the next
//! [`SharedMemory::create`] removes.

use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::off_t;
use nix::sys::mman;
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory size must be non-zero")]
    EmptySegment,
    #[error("shm_open({name}) failed: {source}")]
    Open { name: String, source: Errno },
    #[error("ftruncate({name}, {size}) failed: {source}")]
    Truncate {
        name: String,
        size: usize,
        source: Errno,
    },
    #[error("mmap({name}, {size}) failed: {source}")]
    Map {
        name: String,
        size: usize,
        source: Errno,
    },
}

#[derive(Debug)]
pub struct SharedMemory {
    name: String,
    pointer: NonNull<u8>,
    size: usize,
    owner: bool,
}

// The mapping is plain memory shared with another process anyway, callers
// coordinate access themselves.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create (or recreate) the segment, zero-filled, and map it read/write.
    pub fn create(name: &str, size: usize) -> Result<SharedMemory, ShmError> {
        let length = NonZeroUsize::new(size).ok_or(ShmError::EmptySegment)?;
        match mman::shm_unlink(name) {
            Ok(()) => log::warn!("removed stale shared memory segment {}", name),
            Err(Errno::ENOENT) => {}
            Err(e) => log::debug!("shm_unlink({}) before create: {}", name, e),
        }
        let fd = mman::shm_open(
            name,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|source| ShmError::Open {
            name: name.to_owned(),
            source,
        })?;
        let r = ftruncate(&fd, size as off_t)
            .map_err(|source| ShmError::Truncate {
                name: name.to_owned(),
                size,
                source,
            })
            .and_then(|()| Self::map(name, length, &fd));
        match r {
            Ok(pointer) => Ok(SharedMemory {
                name: name.to_owned(),
                pointer,
                size,
                owner: true,
            }),
            Err(e) => {
                let _ = mman::shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Map an existing segment read/write. Never creates it.
    pub fn open(name: &str, size: usize) -> Result<SharedMemory, ShmError> {
        let length = NonZeroUsize::new(size).ok_or(ShmError::EmptySegment)?;
        let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::from_bits_truncate(0o666)).map_err(
            |source| ShmError::Open {
                name: name.to_owned(),
                source,
            },
        )?;
        let pointer = Self::map(name, length, &fd)?;
        Ok(SharedMemory {
            name: name.to_owned(),
            pointer,
            size,
            owner: false,
        })
    }

    fn map(
        name: &str,
        length: NonZeroUsize,
        fd: &std::os::fd::OwnedFd,
    ) -> Result<NonNull<u8>, ShmError> {
        // The fd can be closed once mapped, the mapping keeps the object alive.
        let p = unsafe {
            mman::mmap(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|source| ShmError::Map {
            name: name.to_owned(),
            size: length.get(),
            source,
        })?;
        Ok(p.cast())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// The peer may write through the mapping at any time, so reads go
    /// through atomics or volatile loads rather than a shared slice.
    pub fn as_ptr(&self) -> *const u8 {
        self.pointer.as_ptr()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer.cast::<c_void>(), self.size) } {
            log::warn!("munmap({}) failed: {}", self.name, e);
        }
        if self.owner {
            match mman::shm_unlink(self.name.as_str()) {
                Ok(()) => log::debug!("unlinked {}", self.name),
                Err(e) => log::warn!("shm_unlink({}) failed: {}", self.name, e),
            }
        }
    }
}
