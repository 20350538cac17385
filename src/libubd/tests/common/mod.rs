#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use devices::{BlockDevice, BlockIo, CharDev, IoCompletion, SgFragment};
use libubd::{BlockOperations, Daemon};
use pagemap::{PagePool, PageRange, PAGE_SIZE};
use protocol::{BlkStatus, DeviceOptions, SECTOR_SHIFT};

/// Deterministic byte pattern: cheap to recompute at any index, sensitive
/// to misplaced bytes.
pub fn pattern(seed: i64, index: usize) -> u8 {
    (index as i64).wrapping_add(seed.wrapping_mul(index as i64)) as u8
}

pub struct Ramdisk {
    data: Mutex<Vec<u8>>,
}

impl Ramdisk {
    pub fn new(size: u64) -> Ramdisk {
        Ramdisk {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }

    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        data[offset as usize..offset as usize + len].to_vec()
    }
}

impl BlockOperations for Ramdisk {
    fn read(&self, data: &mut [u8], offset: u64) -> BlkStatus {
        let disk = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + data.len() > disk.len() {
            return BlkStatus::IoError;
        }
        data.copy_from_slice(&disk[offset..offset + data.len()]);
        BlkStatus::Ok
    }

    fn write(&self, data: &[u8], offset: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + data.len() > disk.len() {
            return BlkStatus::IoError;
        }
        disk[offset..offset + data.len()].copy_from_slice(data);
        BlkStatus::Ok
    }

    fn discard(&self, offset: u64, length: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + length as usize > disk.len() {
            return BlkStatus::IoError;
        }
        disk[offset..offset + length as usize].fill(0);
        BlkStatus::Ok
    }

    fn flush(&self) -> BlkStatus {
        BlkStatus::Ok
    }
}

/// A served device plus the handles tests drive it with.
pub struct TestDev {
    pub chardev: CharDev,
    pub pool: Arc<PagePool>,
    pub device: Arc<BlockDevice>,
    pub daemon: Option<Daemon>,
}

impl TestDev {
    pub fn serve(options: DeviceOptions, ops: Arc<dyn BlockOperations>) -> TestDev {
        let chardev = CharDev::new().expect("chardev setup");
        let daemon = libubd::serve(&chardev, &options, ops).expect("serve");
        let device = chardev
            .state()
            .get_block_device(daemon.disk_name())
            .expect("device registered");
        let pool = Arc::clone(chardev.state().pool());
        TestDev {
            chardev,
            pool,
            device,
            daemon: Some(daemon),
        }
    }

    pub fn shutdown(mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
        }
    }

    /// Write `data` at byte `offset` through the full stack, from freshly
    /// allocated payload pages.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> IoCompletion {
        let range = alloc_filled(&self.pool, data);
        let fragments = vec![SgFragment::new(range.page(0), 0, data.len())];
        self.device
            .queue_rq(BlockIo::write(offset >> SECTOR_SHIFT, fragments))
            .wait()
    }

    /// Read `len` bytes at byte `offset` through the full stack.
    pub fn read_at(&self, offset: u64, len: usize) -> (IoCompletion, Vec<u8>) {
        let range = alloc_zeroed(&self.pool, len);
        let fragments = vec![SgFragment::new(range.page(0), 0, len)];
        let completion = self
            .device
            .queue_rq(BlockIo::read(offset >> SECTOR_SHIFT, fragments))
            .wait();
        let mut data = vec![0u8; len];
        self.pool.read_bytes(range.byte_offset(0), &mut data).unwrap();
        (completion, data)
    }
}

pub fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE).max(1)
}

pub fn alloc_zeroed(pool: &Arc<PagePool>, len: usize) -> PageRange {
    let range = pool.alloc_range(pages_for(len)).expect("payload pages");
    pool.zero_bytes(range.byte_offset(0), len).unwrap();
    range
}

pub fn alloc_filled(pool: &Arc<PagePool>, data: &[u8]) -> PageRange {
    let range = pool.alloc_range(pages_for(data.len())).expect("payload pages");
    pool.write_bytes(range.byte_offset(0), data).unwrap();
    range
}

pub fn pattern_vec(seed: i64, len: usize) -> Vec<u8> {
    (0..len).map(|index| pattern(seed, index)).collect()
}
