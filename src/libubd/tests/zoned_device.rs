//! Zone state machine scenarios, at the backend level and through the full
//! transport stack.

mod common;

use std::sync::{Arc, Mutex};

use devices::{BlockIo, IoType};
use libubd::zoned::{SectorStorage, ZoneLayout, ZonedDevice};
use libubd::BlockOperations;
use protocol::{BlkStatus, DeviceOptions, ZoneCond, SECTOR_SIZE};

use common::TestDev;

const MIB: u64 = 1024 * 1024;

/// Storage that keeps no data: the zoned scenarios only exercise the state
/// machine.
struct NullStorage;

impl SectorStorage for NullStorage {
    fn read(&self, data: &mut [u8], _offset: u64) -> BlkStatus {
        data.fill(0);
        BlkStatus::Ok
    }

    fn write(&self, _data: &[u8], _offset: u64) -> BlkStatus {
        BlkStatus::Ok
    }

    fn discard(&self, _offset: u64, _length: u64) -> BlkStatus {
        BlkStatus::Ok
    }
}

struct VecStorage {
    data: Mutex<Vec<u8>>,
}

impl VecStorage {
    fn new(size: u64) -> VecStorage {
        VecStorage {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }
}

impl SectorStorage for VecStorage {
    fn read(&self, data: &mut [u8], offset: u64) -> BlkStatus {
        let disk = self.data.lock().unwrap();
        data.copy_from_slice(&disk[offset as usize..offset as usize + data.len()]);
        BlkStatus::Ok
    }

    fn write(&self, data: &[u8], offset: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        disk[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        BlkStatus::Ok
    }

    fn discard(&self, offset: u64, length: u64) -> BlkStatus {
        let mut disk = self.data.lock().unwrap();
        disk[offset as usize..(offset + length) as usize].fill(0);
        BlkStatus::Ok
    }
}

/// Scenario: write 4 KiB sequentially until the zone fills; the write
/// pointer must walk monotonically to the capacity and the condition must
/// end at full.
#[test]
fn write_pointer_monotonicity() {
    let zone_size = 32 * MIB;
    let device = ZonedDevice::new(
        ZoneLayout::new(1024 * MIB, zone_size),
        32,
        64,
        NullStorage,
    )
    .unwrap();

    let block = vec![0xabu8; 4096];
    let writes = zone_size / 4096;
    for index in 0..writes {
        let offset = index * 4096;
        assert_eq!(device.write(&block, offset), BlkStatus::Ok, "write {index}");
        let zone = device.table().zone(0);
        assert_eq!(zone.wp, (offset + 4096) / SECTOR_SIZE);
    }

    let zone = device.table().zone(0);
    assert_eq!(zone.cond().unwrap(), ZoneCond::Full);
    assert_eq!(zone.wp, zone.start + zone.capacity);

    // The zone is full: another write is refused.
    assert_eq!(device.write(&block, zone_size), BlkStatus::Ok);
    assert_eq!(
        device.write(&block, zone_size - 4096),
        BlkStatus::IoError
    );
}

/// Scenario: 32 implicit opens exhaust the open budget; the 33rd write
/// implicitly closes one of them and still succeeds.
#[test]
fn implicit_open_eviction() {
    let zone_size = 32 * MIB;
    let device = ZonedDevice::new(
        ZoneLayout::new(2048 * MIB, zone_size),
        32,
        64,
        NullStorage,
    )
    .unwrap();
    let table = device.table();

    let block = vec![0u8; 4096];
    for zone in 0..32u64 {
        assert_eq!(device.write(&block, zone * zone_size), BlkStatus::Ok);
    }
    assert_eq!(table.counters(), (32, 32, 32));

    assert_eq!(device.write(&block, 32 * zone_size), BlkStatus::Ok);
    assert_eq!(table.zone(32).cond().unwrap(), ZoneCond::ImpOpen);

    let (open, imp_open, active) = table.counters();
    assert!(open <= 32 && imp_open <= open && active <= 64);
    let closed = (0..33)
        .filter(|&i| table.zone(i).cond().unwrap() == ZoneCond::Closed)
        .count();
    assert_eq!(closed, 1);
}

/// Scenario: with `max_active_zones = 2`, two explicit opens exhaust the
/// active budget and an implicit open via write is refused with the state
/// of all three zones unchanged.
#[test]
fn active_resource_budget() {
    let zone_size = 32 * MIB;
    let device = ZonedDevice::new(
        ZoneLayout::new(256 * MIB, zone_size),
        32,
        2,
        NullStorage,
    )
    .unwrap();
    let table = device.table();

    assert_eq!(device.open_zone(0), BlkStatus::Ok);
    assert_eq!(device.open_zone(zone_size), BlkStatus::Ok);

    let block = vec![0u8; 4096];
    assert_eq!(
        device.write(&block, 2 * zone_size),
        BlkStatus::ZoneActiveResource
    );

    assert_eq!(table.zone(0).cond().unwrap(), ZoneCond::ExpOpen);
    assert_eq!(table.zone(1).cond().unwrap(), ZoneCond::ExpOpen);
    assert_eq!(table.zone(2).cond().unwrap(), ZoneCond::Empty);
    assert_eq!(table.counters(), (2, 0, 2));
}

/// Scenario: appends on an empty zone land at 0 then 4096, moving the
/// write pointer by eight sectors each time.
#[test]
fn append_effective_offset() {
    let device = ZonedDevice::new(
        ZoneLayout::new(256 * MIB, 32 * MIB),
        8,
        8,
        NullStorage,
    )
    .unwrap();

    let block = vec![0u8; 4096];
    let mut position = u64::MAX;
    assert_eq!(
        device.append_zone(&block, 0, Some(&mut position)),
        BlkStatus::Ok
    );
    assert_eq!(position, 0);
    assert_eq!(device.table().zone(0).wp, 8);

    let mut position = u64::MAX;
    assert_eq!(
        device.append_zone(&block, 0, Some(&mut position)),
        BlkStatus::Ok
    );
    assert_eq!(position, 4096);
    assert_eq!(device.table().zone(0).wp, 16);
}

/// The same zoned semantics driven through the wire: create a host-managed
/// device, write, append, report, reset.
#[test]
fn zoned_device_through_the_stack() {
    let disk_size = 64 * MIB;
    let zone_size = 4 * MIB;
    let zoned = Arc::new(
        ZonedDevice::new(
            ZoneLayout::new(disk_size, zone_size),
            4,
            8,
            VecStorage::new(disk_size),
        )
        .unwrap(),
    );

    let options = DeviceOptions::host_managed("zoned-stack", disk_size, 4, 8).unwrap();
    let dev = TestDev::serve(options, zoned.clone());

    // Sequential write at the write pointer.
    let payload = common::pattern_vec(21, 8192);
    assert!(dev.write_at(0, &payload).status.is_ok());

    // Misaligned write is refused by the zone table.
    assert_eq!(dev.write_at(0, &payload).status, BlkStatus::IoError);

    // Zone append through the stack reports its effective offset.
    let range = common::alloc_filled(&dev.pool, &common::pattern_vec(22, 4096));
    let completion = dev
        .device
        .queue_rq(BlockIo::zone_append(
            0,
            vec![devices::SgFragment::new(range.page(0), 0, 4096)],
        ))
        .wait();
    assert!(completion.status.is_ok());
    assert_eq!(completion.position, 8192);

    // Report through the synchronous control path.
    let zones = dev.device.report_zones(0, 16).unwrap();
    assert_eq!(zones.len(), 16);
    assert_eq!(zones[0].cond().unwrap(), ZoneCond::ImpOpen);
    assert_eq!(zones[0].wp, (8192 + 4096) / SECTOR_SIZE);
    assert_eq!(zones[1].cond().unwrap(), ZoneCond::Empty);

    // Reset returns the zone to empty and discards its bytes.
    let completion = dev
        .device
        .queue_rq(BlockIo::zone_mgmt(IoType::ZoneReset, 0))
        .wait();
    assert!(completion.status.is_ok());
    let zones = dev.device.report_zones(0, 1).unwrap();
    assert_eq!(zones[0].cond().unwrap(), ZoneCond::Empty);
    assert_eq!(zones[0].wp, zones[0].start);

    // Finish, then reset-all through the stack.
    let completion = dev
        .device
        .queue_rq(BlockIo::zone_mgmt(IoType::ZoneFinish, (zone_size / SECTOR_SIZE) as u64))
        .wait();
    assert!(completion.status.is_ok());
    let completion = dev
        .device
        .queue_rq(BlockIo::zone_mgmt(IoType::ZoneResetAll, 0))
        .wait();
    assert!(completion.status.is_ok());
    assert_eq!(zoned.table().counters(), (0, 0, 0));

    dev.shutdown();
}

/// Zone-report clamping: a request past the end reports nothing; a zero
/// count short-circuits with an immediate empty result.
#[test]
fn report_zones_edges() {
    let disk_size = 16 * MIB;
    let zoned = Arc::new(
        ZonedDevice::new(ZoneLayout::new(disk_size, 4 * MIB), 4, 8, NullStorage).unwrap(),
    );
    let options = DeviceOptions::host_managed("zoned-report", disk_size, 4, 8).unwrap();
    let dev = TestDev::serve(options, zoned);

    assert!(dev.device.report_zones(0, 0).unwrap().is_empty());

    let zones = dev.device.report_zones(0, 64).unwrap();
    assert_eq!(zones.len(), 4);

    let tail = dev
        .device
        .report_zones((8 * MIB / SECTOR_SIZE) as u64, 64)
        .unwrap();
    assert_eq!(tail.len(), 2);

    dev.shutdown();
}
