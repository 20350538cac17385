//! Pattern round-trip smoke test against an in-process ramdisk device.
//!
//! Plays the block layer's role directly: allocates payload pages from the
//! engine pool, submits reads and writes, and verifies the bytes that come
//! back. `--hard` sweeps the whole disk in chunks.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use devices::{BlockIo, CharDev, SgFragment};
use libubd::BlockOperations;
use pagemap::{PagePool, PAGE_SIZE};
use protocol::{BlkStatus, DeviceOptions, SECTOR_SHIFT};

const DISK_SIZE: u64 = 256 * 1024 * 1024;
const CHUNK: usize = 128 * 1024;
const SIMPLE_TEST_SEED: i64 = 541615336;

struct Ramdisk {
    data: Mutex<Vec<u8>>,
}

impl Ramdisk {
    fn new(size: u64) -> Ramdisk {
        Ramdisk {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }
}

impl BlockOperations for Ramdisk {
    fn read(&self, data: &mut [u8], offset: u64) -> BlkStatus {
        let disk = self.data.lock().unwrap();
        let offset = offset as usize;
        data.copy_from_slice(&disk[offset..offset + data.len()]);
        BlkStatus::Ok
    }

    fn write(&self, data: &[u8], offset: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        let offset = offset as usize;
        disk[offset..offset + data.len()].copy_from_slice(data);
        BlkStatus::Ok
    }

    fn discard(&self, offset: u64, length: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        let offset = offset as usize;
        disk[offset..offset + length as usize].fill(0);
        BlkStatus::Ok
    }

    fn flush(&self) -> BlkStatus {
        BlkStatus::Ok
    }
}

fn pattern(seed: i64, index: usize) -> u8 {
    (index as i64).wrapping_add(seed.wrapping_mul(index as i64)) as u8
}

fn run_chunk(
    device: &devices::BlockDevice,
    pool: &Arc<PagePool>,
    offset: u64,
    seed: i64,
) -> Result<()> {
    let pages = CHUNK / PAGE_SIZE;
    let range = pool.alloc_range(pages).context("payload allocation")?;

    let payload: Vec<u8> = (0..CHUNK).map(|i| pattern(seed, i)).collect();
    pool.write_bytes(range.byte_offset(0), &payload)?;

    let fragments = vec![SgFragment::new(range.page(0), 0, CHUNK)];
    let done = device
        .queue_rq(BlockIo::write(offset >> SECTOR_SHIFT, fragments))
        .wait();
    if !done.status.is_ok() {
        bail!("write at {offset} failed: {:?}", done.status);
    }

    pool.zero_bytes(range.byte_offset(0), CHUNK)?;
    let fragments = vec![SgFragment::new(range.page(0), 0, CHUNK)];
    let done = device
        .queue_rq(BlockIo::read(offset >> SECTOR_SHIFT, fragments))
        .wait();
    if !done.status.is_ok() {
        bail!("read at {offset} failed: {:?}", done.status);
    }

    let mut back = vec![0u8; CHUNK];
    pool.read_bytes(range.byte_offset(0), &mut back)?;
    for (index, (&got, &want)) in back.iter().zip(payload.iter()).enumerate() {
        if got != want {
            bail!("verification failed at ({offset}, {index}): {got} != {want}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let hard = std::env::args().any(|arg| arg == "--hard");

    let chardev = CharDev::new()?;
    let options = DeviceOptions::new("ramdisk", DISK_SIZE)?;
    let daemon = libubd::serve(&chardev, &options, Arc::new(Ramdisk::new(DISK_SIZE)))?;

    let device = chardev
        .state()
        .get_block_device(daemon.disk_name())
        .context("device missing after serve")?;
    let pool = Arc::clone(chardev.state().pool());

    if hard {
        eprintln!("Writing test: hard");
        let chunks = DISK_SIZE as usize / CHUNK;
        for index in 0..chunks {
            run_chunk(&device, &pool, (index * CHUNK) as u64, index as i64)?;
        }
    } else {
        eprintln!("Writing test: simple");
        run_chunk(&device, &pool, 0, SIMPLE_TEST_SEED)?;
    }

    eprintln!("Verification ok");
    daemon.shutdown();
    Ok(())
}
