use std::ptr::NonNull;

/// The memory region the environment hands to the allocator at boot.
///
/// On target this is the linker section that follows the rest of the
/// firmware's RAM, up to the end of usable memory. On a hosted build it is
/// a block of pages obtained from the OS (see [`HostMemory`]).
///
/// # Safety
///
/// Implementors guarantee that `[base, usable_end)` is valid for reads and
/// writes, and stays valid for as long as the implementor itself is alive.
/// Owning a value must mean owning those bytes: nothing else may use them,
/// and the type must not be `Clone` or `Copy`.
pub unsafe trait UsableMemory {
    /// First byte the allocator may claim.
    fn base(&self) -> NonNull<u8>;

    /// Address one past the last usable byte.
    fn usable_end(&self) -> usize;
}

/// A region carved out of a static byte buffer, typically a `.bss` section
/// reserved for shared memory.
pub struct StaticRegion {
    base: NonNull<u8>,
    len: usize,
}

impl StaticRegion {
    pub fn new(memory: &'static mut [u8]) -> Self {
        Self {
            len: memory.len(),
            base: NonNull::from(memory).cast(),
        }
    }
}

unsafe impl UsableMemory for StaticRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn usable_end(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }
}

unsafe impl Send for StaticRegion {}
unsafe impl Sync for StaticRegion {}

/// Pages requested from the host OS, returned when dropped.
///
/// The length is rounded up to whole pages.
pub struct HostMemory {
    base: NonNull<u8>,
    len: usize,
}

/// This trait provides an abstraction over the host calls that back
/// [`HostMemory`]. Our view of it has nothing to do with the concrete API
/// each kernel offers.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying call fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize);

    /// Returns the page size of the host in bytes.
    fn page_size() -> usize;
}

impl HostMemory {
    /// Maps at least `len` bytes of zeroed read/write memory.
    pub fn new(len: usize) -> Option<Self> {
        let len = crate::utils::align(len.max(1), Self::page_size())?;
        let base = unsafe { Self::request_memory(len)? };

        log::debug!("mapped {len} bytes of host memory at {:p}", base);

        Some(Self { base, len })
    }

    /// Mapped bytes, a whole number of pages.
    pub fn size(&self) -> usize {
        self.len
    }
}

unsafe impl UsableMemory for HostMemory {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn usable_end(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { Self::return_memory(self.base, self.len) };
    }
}

unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

#[cfg(unix)]
mod unix {
    use super::{HostMemory, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{os::raw::{c_int, c_void}, ptr::NonNull};

    impl PlatformMemory for HostMemory {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
            unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use super::{HostMemory, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for HostMemory {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) {
            let addr = addr.as_ptr().cast::<c_void>();
            let released = unsafe { Memory::VirtualFree(addr, 0, Memory::MEM_RELEASE) };

            if let Err(err) = released {
                log::warn!("VirtualFree failed for {:p}: {err}", addr);
            }
        }

        fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_memory_rounds_to_pages() {
        let memory = HostMemory::new(100).expect("host refused to map memory");

        assert_eq!(memory.size() % HostMemory::page_size(), 0);
        assert!(memory.size() >= 100);
        assert_eq!(memory.usable_end() - memory.base().as_ptr() as usize, memory.size());
    }

    #[test]
    fn host_memory_is_writable() {
        let memory = HostMemory::new(4096).expect("host refused to map memory");

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(memory.base().as_ptr(), memory.size());
            bytes.fill(0xa5);
            assert!(bytes.iter().all(|&b| b == 0xa5));
        }
    }

    #[test]
    fn static_region_spans_the_slice() {
        let buffer: &'static mut [u8] = Box::leak(vec![0u8; 256].into_boxed_slice());
        let start = buffer.as_ptr() as usize;
        let region = StaticRegion::new(buffer);

        assert_eq!(region.base().as_ptr() as usize, start);
        assert_eq!(region.usable_end(), start + 256);
    }
}
