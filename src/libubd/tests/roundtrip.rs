//! End-to-end transport tests against a ramdisk backend: inline small I/O,
//! mapped large I/O through the bounce-fringe path, and the non-data ops.

mod common;

use std::sync::Arc;

use common::{pattern_vec, Ramdisk, TestDev};
use devices::{BlockIo, IoType, SgFragment};
use pagemap::PAGE_SIZE;
use protocol::{BlkStatus, DeviceOptions, MAP_DATA_THRESHOLD, SECTOR_SHIFT};

const SIMPLE_TEST_SEED: i64 = 541615336;

fn ramdisk_dev(name: &str, size: u64) -> (TestDev, Arc<Ramdisk>) {
    let ramdisk = Arc::new(Ramdisk::new(size));
    let options = DeviceOptions::new(name, size).unwrap();
    let dev = TestDev::serve(options, ramdisk.clone());
    (dev, ramdisk)
}

#[test]
fn simple_pattern_roundtrip() {
    let (dev, _ramdisk) = ramdisk_dev("rt-simple", 32 * 1024 * 1024);

    // 128 KiB rides the inline threshold exactly.
    let payload = pattern_vec(SIMPLE_TEST_SEED, MAP_DATA_THRESHOLD as usize);
    assert!(dev.write_at(0, &payload).status.is_ok());

    let (completion, data) = dev.read_at(0, payload.len());
    assert!(completion.status.is_ok());
    assert_eq!(data, payload);

    dev.shutdown();
}

#[test]
fn roundtrip_sizes_across_the_threshold() {
    let (dev, _ramdisk) = ramdisk_dev("rt-sizes", 64 * 1024 * 1024);

    let sizes = [
        1usize,
        512,
        4096,
        PAGE_SIZE * 3,
        MAP_DATA_THRESHOLD as usize - 512,
        MAP_DATA_THRESHOLD as usize + PAGE_SIZE, // first mapped size
        2 * 1024 * 1024,
    ];
    for (index, &size) in sizes.iter().enumerate() {
        let offset = (index as u64) * 8 * 1024 * 1024;
        let payload = pattern_vec(index as i64 + 1, size);
        let completion = dev.write_at(offset, &payload);
        assert!(completion.status.is_ok(), "write of {size} bytes");

        let (completion, data) = dev.read_at(offset, size);
        assert!(completion.status.is_ok(), "read of {size} bytes");
        assert_eq!(data, payload, "payload of {size} bytes");
    }

    dev.shutdown();
}

#[test]
fn large_write_through_bounce_fringes() {
    let (dev, ramdisk) = ramdisk_dev("rt-fringe", 64 * 1024 * 1024);

    // Eight scattered 512 KiB chunks; the first starts at byte 1024 of its
    // page, so the mapping goes through head and tail bounce pages and a
    // descriptor list.
    let chunk = 512 * 1024;
    let chunks = 8;
    let total = chunk * chunks;
    let payload = pattern_vec(7, total);

    let mut ranges = Vec::new();
    let mut fragments = Vec::new();
    for index in 0..chunks {
        let in_page = if index == 0 { 1024 } else { 0 };
        let range = dev
            .pool
            .alloc_range(chunk / PAGE_SIZE + 1)
            .expect("payload pages");
        dev.pool
            .write_bytes(
                range.byte_offset(0) + in_page as u64,
                &payload[index * chunk..(index + 1) * chunk],
            )
            .unwrap();
        fragments.push(SgFragment::new(range.page(0), in_page, chunk));
        ranges.push(range);
    }

    let completion = dev
        .device
        .queue_rq(BlockIo::write(0, fragments))
        .wait();
    assert!(completion.status.is_ok());
    assert_eq!(ramdisk.snapshot(0, total), payload);

    // Mapped read back into the same scattered layout, fringes included.
    for range in &ranges {
        dev.pool
            .zero_bytes(range.byte_offset(0), (chunk / PAGE_SIZE + 1) * PAGE_SIZE)
            .unwrap();
    }
    let mut fragments = Vec::new();
    for (index, range) in ranges.iter().enumerate() {
        let in_page = if index == 0 { 1024 } else { 0 };
        fragments.push(SgFragment::new(range.page(0), in_page, chunk));
    }
    let completion = dev.device.queue_rq(BlockIo::read(0, fragments)).wait();
    assert!(completion.status.is_ok());

    for (index, range) in ranges.iter().enumerate() {
        let in_page = if index == 0 { 1024u64 } else { 0 };
        let mut data = vec![0u8; chunk];
        dev.pool
            .read_bytes(range.byte_offset(0) + in_page, &mut data)
            .unwrap();
        assert_eq!(
            data,
            &payload[index * chunk..(index + 1) * chunk],
            "chunk {index}"
        );
    }

    dev.shutdown();
}

#[test]
fn full_command_size_zero_copy() {
    let size = protocol::MAX_SIZE_PER_COMMAND;
    let (dev, ramdisk) = ramdisk_dev("rt-full", size as u64);

    // One aligned maximal write: a single descriptor, pure page remapping.
    let payload = pattern_vec(3, size);
    let completion = dev.write_at(0, &payload);
    assert!(completion.status.is_ok());
    assert_eq!(ramdisk.snapshot(0, size), payload);

    let (completion, data) = dev.read_at(0, size);
    assert!(completion.status.is_ok());
    assert_eq!(data, payload);

    dev.shutdown();
}

#[test]
fn discard_and_flush() {
    let (dev, _ramdisk) = ramdisk_dev("rt-discard", 16 * 1024 * 1024);

    let payload = pattern_vec(11, 8192);
    assert!(dev.write_at(0, &payload).status.is_ok());

    let completion = dev
        .device
        .queue_rq(BlockIo::discard(0, 8192))
        .wait();
    assert!(completion.status.is_ok());

    let (completion, data) = dev.read_at(0, 8192);
    assert!(completion.status.is_ok());
    assert!(data.iter().all(|&b| b == 0));

    let completion = dev.device.queue_rq(BlockIo::flush()).wait();
    assert!(completion.status.is_ok());

    dev.shutdown();
}

#[test]
fn unsupported_op_reports_not_supported() {
    // A plain ramdisk has no zone handlers.
    let (dev, _ramdisk) = ramdisk_dev("rt-notsupp", 16 * 1024 * 1024);

    let completion = dev
        .device
        .queue_rq(BlockIo::zone_mgmt(IoType::ZoneOpen, 0))
        .wait();
    assert_eq!(completion.status, BlkStatus::NotSupported);

    dev.shutdown();
}

#[test]
fn writes_land_at_their_offset() {
    let (dev, ramdisk) = ramdisk_dev("rt-offsets", 16 * 1024 * 1024);

    let payload = pattern_vec(5, 4096);
    let sector = (1024 * 1024) >> SECTOR_SHIFT;
    let completion = dev.write_at((sector as u64) << SECTOR_SHIFT, &payload);
    assert!(completion.status.is_ok());

    assert_eq!(ramdisk.snapshot(1024 * 1024, 4096), payload);
    assert!(ramdisk.snapshot(0, 4096).iter().all(|&b| b == 0));

    dev.shutdown();
}
