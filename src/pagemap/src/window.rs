use std::ptr;

use nix::errno::Errno;

use crate::{Error, PagePool, PAGE_SIZE};

/// A reserved VMA whose page slots are individually retargeted at pool
/// pages.
///
/// The reservation is made once (`PROT_NONE`, so a stray touch faults);
/// every later remap is a single fixed-address `mmap` over one slot, the
/// userspace equivalent of rewriting one PTE of a prefaulted VMA. Clearing
/// repoints a whole prefix at the pool's zero region in one call.
pub struct Window {
    base: *mut u8,
    len: usize,
}

// The mapping is process-global memory; all access goes through raw
// pointers handed to the owning connection.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    /// Reserve `slots` pages of address space and point them all at the
    /// zero region.
    pub fn reserve(slots: usize, pool: &PagePool) -> Result<Window, Error> {
        assert!(slots <= pool.zero_pages());
        let len = slots * PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Map(Errno::last()));
        }

        let window = Window {
            base: base.cast(),
            len,
        };
        window.clear(slots, pool)?;
        Ok(window)
    }

    pub fn base_addr(&self) -> u64 {
        self.base as u64
    }

    pub fn slots(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Point one slot at one pool page, read-write.
    pub fn map_slot(&self, slot: usize, pool: &PagePool, page: usize) -> Result<(), Error> {
        if slot >= self.slots() || page >= pool.capacity_pages() {
            return Err(Error::OutOfBounds);
        }
        let addr = unsafe { self.base.add(slot * PAGE_SIZE) };
        let ret = unsafe {
            libc::mmap(
                addr.cast(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                pool.fd(),
                PagePool::page_offset(page) as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::Map(Errno::last()));
        }
        Ok(())
    }

    /// Point the first `slots` slots back at the zero region, read-only.
    pub fn clear(&self, slots: usize, pool: &PagePool) -> Result<(), Error> {
        if slots == 0 {
            return Ok(());
        }
        if slots > self.slots() || slots > pool.zero_pages() {
            return Err(Error::OutOfBounds);
        }
        let ret = unsafe {
            libc::mmap(
                self.base.cast(),
                slots * PAGE_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_FIXED,
                pool.fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::Map(Errno::last()));
        }
        Ok(())
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}
