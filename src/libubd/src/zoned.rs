//! Zone state machine for host-managed zoned backends.
//!
//! Per-zone state (condition, write pointer, statistics) lives under a
//! per-zone lock; the open/active budget counters live under one table-wide
//! lock. The lock order is zone before global, everywhere; the
//! implicit-close eviction walk takes other zones with `try_lock` so the
//! order survives (a zone whose lock is contended is mid-transition and not
//! a stable eviction candidate anyway).

use std::sync::Mutex;

use protocol::{
    BlkStatus, ZoneCond, ZoneDescriptor, ZoneType, MAX_ZONES, MAX_ZONE_SECTORS, SECTOR_SIZE,
};
use tracing::debug;

use crate::ops::BlockOperations;

/// Raw byte-addressed storage a zoned device validates writes against and
/// then delegates to.
pub trait SectorStorage: Send + Sync {
    fn read(&self, data: &mut [u8], offset: u64) -> BlkStatus;
    fn write(&self, data: &[u8], offset: u64) -> BlkStatus;
    fn discard(&self, offset: u64, length: u64) -> BlkStatus;
}

#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    #[error("zone size must be a non-zero multiple of the sector size")]
    BadZoneSize,
    #[error("disk size must be a non-zero multiple of the zone size")]
    BadDiskSize,
    #[error("zone count exceeds {MAX_ZONES}")]
    TooManyZones,
    #[error("zone size exceeds {MAX_ZONE_SECTORS} sectors")]
    ZoneTooLarge,
    #[error("more conventional zones than zones")]
    TooManyConventional,
}

/// Static zoned geometry of a device.
#[derive(Debug, Copy, Clone)]
pub struct ZoneLayout {
    pub disk_size: u64,
    pub zone_size: u64,
    pub num_conventional: u32,
}

impl ZoneLayout {
    pub fn new(disk_size: u64, zone_size: u64) -> ZoneLayout {
        ZoneLayout {
            disk_size,
            zone_size,
            num_conventional: 0,
        }
    }

    pub fn num_zones(&self) -> usize {
        (self.disk_size / self.zone_size) as usize
    }

    fn validate(&self) -> Result<(), ZoneError> {
        if self.zone_size == 0 || self.zone_size % SECTOR_SIZE != 0 {
            return Err(ZoneError::BadZoneSize);
        }
        if self.disk_size == 0 || self.disk_size % self.zone_size != 0 {
            return Err(ZoneError::BadDiskSize);
        }
        if self.num_zones() > MAX_ZONES {
            return Err(ZoneError::TooManyZones);
        }
        if self.zone_size / SECTOR_SIZE > MAX_ZONE_SECTORS {
            return Err(ZoneError::ZoneTooLarge);
        }
        if self.num_conventional as usize > self.num_zones() {
            return Err(ZoneError::TooManyConventional);
        }
        Ok(())
    }
}

/// Per-zone statistics, guarded by the zone's lock.
#[derive(Debug, Default, Copy, Clone)]
pub struct ZoneStats {
    pub read: u64,
    pub written: u64,
    pub reset_count: u64,
    pub discarded: u64,
}

struct Zone {
    /// All extents in sectors.
    start: u64,
    len: u64,
    capacity: u64,
    wp: u64,
    ztype: ZoneType,
    cond: ZoneCond,
    stats: ZoneStats,
}

impl Zone {
    fn descriptor(&self) -> ZoneDescriptor {
        ZoneDescriptor::new(self.start, self.len, self.wp, self.capacity, self.ztype, self.cond)
    }
}

#[derive(Default)]
struct Accounting {
    open: u32,
    imp_open: u32,
    active: u32,
}

/// What a zone reset asks of the backing storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetAction {
    /// Zone was already empty; nothing to discard.
    Noop,
    /// Discard this byte range.
    Discard { offset: u64, length: u64 },
}

pub struct ZoneTable {
    layout: ZoneLayout,
    max_open: u32,
    max_active: u32,
    zones: Vec<Mutex<Zone>>,
    /// Budget counters. Zone lock is acquired before this, never after.
    global: Mutex<Accounting>,
}

impl ZoneTable {
    pub fn new(layout: ZoneLayout, max_open: u32, max_active: u32) -> Result<ZoneTable, ZoneError> {
        layout.validate()?;
        let sectors = layout.zone_size / SECTOR_SIZE;
        let zones = (0..layout.num_zones())
            .map(|index| {
                let conventional = (index as u32) < layout.num_conventional;
                Mutex::new(Zone {
                    start: sectors * index as u64,
                    len: sectors,
                    capacity: sectors,
                    wp: sectors * index as u64,
                    ztype: if conventional {
                        ZoneType::Conventional
                    } else {
                        ZoneType::SeqWriteRequired
                    },
                    cond: if conventional {
                        ZoneCond::NotWp
                    } else {
                        ZoneCond::Empty
                    },
                    stats: ZoneStats::default(),
                })
            })
            .collect();
        Ok(ZoneTable {
            layout,
            max_open,
            max_active,
            zones,
            global: Mutex::new(Accounting::default()),
        })
    }

    pub fn layout(&self) -> ZoneLayout {
        self.layout
    }

    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    fn zone_at(&self, offset: u64) -> Result<usize, BlkStatus> {
        let index = (offset / self.layout.zone_size) as usize;
        if index < self.zones.len() {
            Ok(index)
        } else {
            Err(BlkStatus::IoError)
        }
    }

    /// `(open, implicitly open, active)` counters.
    pub fn counters(&self) -> (u32, u32, u32) {
        let global = self.global.lock().unwrap();
        (global.open, global.imp_open, global.active)
    }

    pub fn zone(&self, index: usize) -> ZoneDescriptor {
        self.zones[index].lock().unwrap().descriptor()
    }

    pub fn stats(&self, index: usize) -> ZoneStats {
        self.zones[index].lock().unwrap().stats
    }

    pub fn note_read(&self, offset: u64, length: u64) {
        if let Ok(index) = self.zone_at(offset) {
            self.zones[index].lock().unwrap().stats.read += length;
        }
    }

    /// Validate a write (or append) and advance the zone state. Returns the
    /// effective byte offset the data write must target.
    ///
    /// The zone lock is released before the caller touches storage, so the
    /// write pointer is already advanced when overlapping writers race; the
    /// sequential-write requirement makes that the correct outcome.
    pub fn begin_write(&self, offset: u64, length: u64, append: bool) -> Result<u64, BlkStatus> {
        let index = self.zone_at(offset)?;
        let mut zone = self.zones[index].lock().unwrap();

        if zone.ztype == ZoneType::Conventional {
            if append {
                return Err(BlkStatus::IoError);
            }
            zone.stats.written += length;
            return Ok(offset);
        }

        let effective = if append {
            zone.wp * SECTOR_SIZE
        } else {
            if zone.wp * SECTOR_SIZE != offset {
                return Err(BlkStatus::IoError);
            }
            offset
        };
        if (zone.start + zone.capacity) * SECTOR_SIZE < effective + length {
            return Err(BlkStatus::IoError);
        }

        match zone.cond {
            ZoneCond::Empty | ZoneCond::Closed => {
                let status = self.open_locked(index, &mut zone, false);
                if !status.is_ok() {
                    return Err(status);
                }
            }
            ZoneCond::ImpOpen | ZoneCond::ExpOpen => {}
            _ => return Err(BlkStatus::IoError),
        }

        zone.wp += length / SECTOR_SIZE;
        if zone.wp == zone.start + zone.capacity {
            self.mark_full_locked(&mut zone);
        }
        zone.stats.written += length;
        Ok(effective)
    }

    pub fn open_zone(&self, offset: u64) -> BlkStatus {
        let index = match self.zone_at(offset) {
            Ok(index) => index,
            Err(status) => return status,
        };
        let mut zone = self.zones[index].lock().unwrap();
        match zone.cond {
            ZoneCond::Empty | ZoneCond::ImpOpen | ZoneCond::Closed => {
                self.open_locked(index, &mut zone, true)
            }
            ZoneCond::ExpOpen => BlkStatus::Ok,
            _ => BlkStatus::IoError,
        }
    }

    pub fn close_zone(&self, offset: u64) -> BlkStatus {
        let index = match self.zone_at(offset) {
            Ok(index) => index,
            Err(status) => return status,
        };
        let mut zone = self.zones[index].lock().unwrap();
        let mut global = self.global.lock().unwrap();
        match zone.cond {
            ZoneCond::ImpOpen => {
                global.imp_open -= 1;
                global.open -= 1;
            }
            ZoneCond::ExpOpen => {
                global.open -= 1;
            }
            ZoneCond::Closed => {}
            _ => return BlkStatus::IoError,
        }
        if zone.wp == zone.start {
            zone.cond = ZoneCond::Empty;
            global.active -= 1;
        } else {
            zone.cond = ZoneCond::Closed;
        }
        BlkStatus::Ok
    }

    pub fn finish_zone(&self, offset: u64) -> BlkStatus {
        let index = match self.zone_at(offset) {
            Ok(index) => index,
            Err(status) => return status,
        };
        let mut zone = self.zones[index].lock().unwrap();
        self.mark_full_locked(&mut zone)
    }

    pub fn reset_zone(&self, offset: u64) -> Result<ResetAction, BlkStatus> {
        let index = self.zone_at(offset)?;
        let mut zone = self.zones[index].lock().unwrap();

        zone.stats.reset_count += 1;
        zone.stats.discarded += (zone.wp - zone.start) * SECTOR_SIZE;

        let mut global = self.global.lock().unwrap();
        match zone.cond {
            ZoneCond::Empty => return Ok(ResetAction::Noop),
            ZoneCond::ImpOpen => {
                global.imp_open -= 1;
                global.open -= 1;
                global.active -= 1;
            }
            ZoneCond::ExpOpen => {
                global.open -= 1;
                global.active -= 1;
            }
            ZoneCond::Closed => {
                global.active -= 1;
            }
            ZoneCond::Full => {}
            _ => return Err(BlkStatus::IoError),
        }
        drop(global);

        zone.cond = ZoneCond::Empty;
        zone.wp = zone.start;
        Ok(ResetAction::Discard {
            offset: zone.start * SECTOR_SIZE,
            length: zone.len * SECTOR_SIZE,
        })
    }

    /// Reinitialize every sequential zone to the fresh layout. The caller
    /// follows up with one discard across the whole disk.
    pub fn reset_all(&self) {
        debug!("resetting all zones");
        for slot in &self.zones {
            let mut zone = slot.lock().unwrap();
            if zone.ztype == ZoneType::Conventional {
                continue;
            }
            let mut global = self.global.lock().unwrap();
            match zone.cond {
                ZoneCond::ImpOpen => {
                    global.imp_open -= 1;
                    global.open -= 1;
                    global.active -= 1;
                }
                ZoneCond::ExpOpen => {
                    global.open -= 1;
                    global.active -= 1;
                }
                ZoneCond::Closed => {
                    global.active -= 1;
                }
                _ => {}
            }
            drop(global);
            zone.cond = ZoneCond::Empty;
            zone.wp = zone.start;
        }
    }

    /// Copy descriptors starting at the zone containing `offset`. Returns
    /// the number filled.
    pub fn report(&self, offset: u64, out: &mut [ZoneDescriptor]) -> usize {
        let start = (offset / self.layout.zone_size) as usize;
        if start >= self.zones.len() {
            return 0;
        }
        let count = out.len().min(self.zones.len() - start);
        for (slot, out_desc) in self.zones[start..start + count].iter().zip(out.iter_mut()) {
            *out_desc = slot.lock().unwrap().descriptor();
        }
        count
    }

    /// Open a zone, implicitly or explicitly. Called with the zone lock
    /// held; takes the global lock.
    fn open_locked(&self, index: usize, zone: &mut Zone, explicit: bool) -> BlkStatus {
        let mut global = self.global.lock().unwrap();
        match zone.cond {
            ZoneCond::ImpOpen => {
                if explicit {
                    global.imp_open -= 1;
                    zone.cond = ZoneCond::ExpOpen;
                }
                BlkStatus::Ok
            }
            ZoneCond::ExpOpen => BlkStatus::Ok,
            ZoneCond::Empty | ZoneCond::Closed => {
                let was_empty = zone.cond == ZoneCond::Empty;
                if was_empty && global.active >= self.max_active {
                    return BlkStatus::ZoneActiveResource;
                }
                if global.open >= self.max_open {
                    // Implicit-close rule: steal the slot of another
                    // implicitly-opened zone if one exists.
                    if global.imp_open == 0 || !self.evict_imp_open(&mut global, index) {
                        return BlkStatus::ZoneOpenResource;
                    }
                }
                if was_empty {
                    global.active += 1;
                }
                global.open += 1;
                if explicit {
                    zone.cond = ZoneCond::ExpOpen;
                } else {
                    global.imp_open += 1;
                    zone.cond = ZoneCond::ImpOpen;
                }
                BlkStatus::Ok
            }
            _ => BlkStatus::IoError,
        }
    }

    /// Transition one other implicitly-open zone to closed, releasing its
    /// open slot.
    fn evict_imp_open(&self, global: &mut Accounting, skip: usize) -> bool {
        for index in self.layout.num_conventional as usize..self.zones.len() {
            if index == skip {
                continue;
            }
            let Ok(mut zone) = self.zones[index].try_lock() else {
                continue;
            };
            if zone.cond == ZoneCond::ImpOpen {
                zone.cond = ZoneCond::Closed;
                global.open -= 1;
                global.imp_open -= 1;
                debug!(zone = index, "implicitly closed");
                return true;
            }
        }
        false
    }

    /// Move a zone to full. Called with the zone lock held; takes the
    /// global lock.
    fn mark_full_locked(&self, zone: &mut Zone) -> BlkStatus {
        let mut global = self.global.lock().unwrap();
        match zone.cond {
            ZoneCond::ImpOpen => {
                global.imp_open -= 1;
                global.open -= 1;
                global.active -= 1;
            }
            ZoneCond::ExpOpen => {
                global.open -= 1;
                global.active -= 1;
            }
            ZoneCond::Closed => {
                global.active -= 1;
            }
            ZoneCond::Empty | ZoneCond::Full => {}
            ZoneCond::NotWp => return BlkStatus::IoError,
        }
        zone.cond = ZoneCond::Full;
        zone.wp = zone.start + zone.len;
        BlkStatus::Ok
    }
}

/// A host-managed zoned device: the zone table in front of raw storage.
pub struct ZonedDevice<S> {
    table: ZoneTable,
    storage: S,
}

impl<S: SectorStorage> ZonedDevice<S> {
    pub fn new(
        layout: ZoneLayout,
        max_open: u32,
        max_active: u32,
        storage: S,
    ) -> Result<ZonedDevice<S>, ZoneError> {
        Ok(ZonedDevice {
            table: ZoneTable::new(layout, max_open, max_active)?,
            storage,
        })
    }

    pub fn table(&self) -> &ZoneTable {
        &self.table
    }
}

impl<S: SectorStorage> BlockOperations for ZonedDevice<S> {
    fn read(&self, data: &mut [u8], offset: u64) -> BlkStatus {
        self.table.note_read(offset, data.len() as u64);
        self.storage.read(data, offset)
    }

    fn write(&self, data: &[u8], offset: u64) -> BlkStatus {
        match self.table.begin_write(offset, data.len() as u64, false) {
            Ok(effective) => self.storage.write(data, effective),
            Err(status) => status,
        }
    }

    fn append_zone(&self, data: &[u8], offset: u64, out_position: Option<&mut u64>) -> BlkStatus {
        match self.table.begin_write(offset, data.len() as u64, true) {
            Ok(effective) => {
                if let Some(out) = out_position {
                    *out = effective;
                }
                self.storage.write(data, effective)
            }
            Err(status) => status,
        }
    }

    fn report_zones(&self, offset: u64, zones: &mut [ZoneDescriptor]) -> Result<usize, BlkStatus> {
        Ok(self.table.report(offset, zones))
    }

    fn open_zone(&self, offset: u64) -> BlkStatus {
        self.table.open_zone(offset)
    }

    fn close_zone(&self, offset: u64) -> BlkStatus {
        self.table.close_zone(offset)
    }

    fn finish_zone(&self, offset: u64) -> BlkStatus {
        self.table.finish_zone(offset)
    }

    fn reset_zone(&self, offset: u64) -> BlkStatus {
        match self.table.reset_zone(offset) {
            Ok(ResetAction::Noop) => BlkStatus::Ok,
            Ok(ResetAction::Discard { offset, length }) => self.storage.discard(offset, length),
            Err(status) => status,
        }
    }

    fn reset_all_zones(&self) -> BlkStatus {
        self.table.reset_all();
        self.storage.discard(0, self.table.layout.disk_size)
    }
}
