use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use tracing::debug;

use crate::{Error, PAGE_SIZE};

/// memfd-backed page pool, mapped read-write once for the process lifetime.
///
/// Pages are addressed by index. The first `zero_pages` indexes form the
/// zero region: never allocated, never written, mapped read-only into
/// windows to back unmapped slots.
pub struct PagePool {
    file: File,
    base: *mut u8,
    capacity_pages: usize,
    zero_pages: usize,
    alloc: Mutex<Allocator>,
}

// The raw base pointer targets a mapping that lives as long as the pool and
// is only accessed through offset-checked copies.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

struct Allocator {
    next: usize,
    free: Vec<(usize, usize)>,
}

impl PagePool {
    pub fn new(capacity_pages: usize, zero_pages: usize) -> Result<Arc<PagePool>, Error> {
        assert!(capacity_pages > zero_pages);

        let fd = unsafe {
            libc::memfd_create(b"ubd-pages\0".as_ptr().cast(), libc::MFD_CLOEXEC)
        };
        let fd = Errno::result(fd).map_err(Error::MemfdCreate)?;
        // The fd is owned from here on.
        let file = unsafe { File::from_raw_fd(fd) };

        let len = capacity_pages * PAGE_SIZE;
        let ret = unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) };
        Errno::result(ret).map_err(Error::Truncate)?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Map(Errno::last()));
        }

        debug!(capacity_pages, zero_pages, "page pool mapped");

        Ok(Arc::new(PagePool {
            file,
            base: base.cast(),
            capacity_pages,
            zero_pages,
            alloc: Mutex::new(Allocator {
                next: zero_pages,
                free: Vec::new(),
            }),
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    /// Number of permanently-zero pages at the front of the pool.
    pub fn zero_pages(&self) -> usize {
        self.zero_pages
    }

    /// Allocate `pages` contiguous pages.
    pub fn alloc_range(self: &Arc<Self>, pages: usize) -> Result<PageRange, Error> {
        assert!(pages > 0);
        let mut alloc = self.alloc.lock().unwrap();

        let start = if let Some(i) = alloc.free.iter().position(|&(_, len)| len >= pages) {
            let (start, len) = alloc.free[i];
            if len == pages {
                alloc.free.swap_remove(i);
            } else {
                alloc.free[i] = (start + pages, len - pages);
            }
            start
        } else {
            let start = alloc.next;
            if start + pages > self.capacity_pages {
                return Err(Error::Exhausted {
                    requested: pages,
                    available: self.capacity_pages - start,
                });
            }
            alloc.next = start + pages;
            start
        };

        Ok(PageRange {
            pool: Arc::clone(self),
            start,
            pages,
        })
    }

    fn free_range(&self, start: usize, pages: usize) {
        let mut alloc = self.alloc.lock().unwrap();
        alloc.free.push((start, pages));
    }

    pub fn page_offset(page: usize) -> u64 {
        (page * PAGE_SIZE) as u64
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), Error> {
        let end = offset.checked_add(len as u64).ok_or(Error::OutOfBounds)?;
        if end > (self.capacity_pages * PAGE_SIZE) as u64 {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        self.check(offset, out.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.check(offset, data.len())?;
        debug_assert!(offset >= (self.zero_pages * PAGE_SIZE) as u64);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset as usize), data.len());
        }
        Ok(())
    }

    pub fn zero_bytes(&self, offset: u64, len: usize) -> Result<(), Error> {
        self.check(offset, len)?;
        debug_assert!(offset >= (self.zero_pages * PAGE_SIZE) as u64);
        unsafe {
            ptr::write_bytes(self.base.add(offset as usize), 0, len);
        }
        Ok(())
    }

    /// Copy into the pool from arbitrary process memory.
    ///
    /// # Safety
    ///
    /// `src` must point at `len` readable bytes.
    pub unsafe fn write_from_ptr(&self, offset: u64, src: *const u8, len: usize) -> Result<(), Error> {
        self.check(offset, len)?;
        debug_assert!(offset >= (self.zero_pages * PAGE_SIZE) as u64);
        ptr::copy_nonoverlapping(src, self.base.add(offset as usize), len);
        Ok(())
    }

    /// Copy `len` bytes between two pool offsets. Ranges must not overlap.
    pub fn copy_bytes(&self, src: u64, dst: u64, len: usize) -> Result<(), Error> {
        self.check(src, len)?;
        self.check(dst, len)?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.add(src as usize),
                self.base.add(dst as usize),
                len,
            );
        }
        Ok(())
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity_pages * PAGE_SIZE);
        }
    }
}

/// A contiguous run of pool pages, returned to the free list on drop.
pub struct PageRange {
    pool: Arc<PagePool>,
    start: usize,
    pages: usize,
}

impl PageRange {
    pub fn start_page(&self) -> usize {
        self.start
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn page(&self, index: usize) -> usize {
        assert!(index < self.pages);
        self.start + index
    }

    pub fn byte_offset(&self, index: usize) -> u64 {
        PagePool::page_offset(self.page(index))
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }
}

impl Drop for PageRange {
    fn drop(&mut self) {
        self.pool.free_range(self.start, self.pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuse() {
        let pool = PagePool::new(64, 8).unwrap();
        let a = pool.alloc_range(4).unwrap();
        assert_eq!(a.start_page(), 8);
        let b = pool.alloc_range(2).unwrap();
        assert_eq!(b.start_page(), 12);
        drop(a);
        let c = pool.alloc_range(3).unwrap();
        assert_eq!(c.start_page(), 8);
    }

    #[test]
    fn exhaustion() {
        let pool = PagePool::new(16, 8).unwrap();
        let _a = pool.alloc_range(8).unwrap();
        assert!(matches!(
            pool.alloc_range(1),
            Err(Error::Exhausted { .. })
        ));
    }

    #[test]
    fn rw_roundtrip() {
        let pool = PagePool::new(64, 8).unwrap();
        let range = pool.alloc_range(2).unwrap();
        let data: Vec<u8> = (0..PAGE_SIZE * 2).map(|i| (i % 251) as u8).collect();
        pool.write_bytes(range.byte_offset(0), &data).unwrap();

        let mut back = vec![0u8; data.len()];
        pool.read_bytes(range.byte_offset(0), &mut back).unwrap();
        assert_eq!(back, data);

        pool.zero_bytes(range.byte_offset(1), PAGE_SIZE).unwrap();
        pool.read_bytes(range.byte_offset(1), &mut back[..PAGE_SIZE])
            .unwrap();
        assert!(back[..PAGE_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn bounds() {
        let pool = PagePool::new(16, 8).unwrap();
        let mut buf = [0u8; 16];
        assert!(pool
            .read_bytes((16 * PAGE_SIZE) as u64 - 8, &mut buf)
            .is_err());
    }
}
