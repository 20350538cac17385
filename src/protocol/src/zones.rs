use zerocopy_derive::{AsBytes, FromBytes};

/// Zone type, value-compatible with the kernel's `blk_zone_type`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneType {
    Conventional = 1,
    SeqWriteRequired = 2,
}

/// Zone condition, value-compatible with the kernel's `blk_zone_cond`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneCond {
    NotWp = 0x0,
    Empty = 0x1,
    ImpOpen = 0x2,
    ExpOpen = 0x3,
    Closed = 0x4,
    Full = 0xe,
}

impl ZoneCond {
    pub fn is_open(self) -> bool {
        matches!(self, ZoneCond::ImpOpen | ZoneCond::ExpOpen)
    }

    /// Active zones hold device resources until reset or finished.
    pub fn is_active(self) -> bool {
        matches!(self, ZoneCond::ImpOpen | ZoneCond::ExpOpen | ZoneCond::Closed)
    }
}

/// One zone report entry. All extents are in sectors.
///
/// This is the payload of a `ReportZones` reply; userspace hands the engine
/// an array of these through `user_data`.
#[derive(Debug, Copy, Clone, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct ZoneDescriptor {
    pub start: u64,
    pub len: u64,
    pub wp: u64,
    pub capacity: u64,
    pub zone_type: u8,
    pub cond: u8,
    _pad: [u8; 6],
}

impl ZoneDescriptor {
    pub fn new(
        start: u64,
        len: u64,
        wp: u64,
        capacity: u64,
        zone_type: ZoneType,
        cond: ZoneCond,
    ) -> Self {
        ZoneDescriptor {
            start,
            len,
            wp,
            capacity,
            zone_type: zone_type as u8,
            cond: cond as u8,
            _pad: [0; 6],
        }
    }

    pub fn zone_type(&self) -> Option<ZoneType> {
        match self.zone_type {
            1 => Some(ZoneType::Conventional),
            2 => Some(ZoneType::SeqWriteRequired),
            _ => None,
        }
    }

    pub fn cond(&self) -> Option<ZoneCond> {
        Some(match self.cond {
            0x0 => ZoneCond::NotWp,
            0x1 => ZoneCond::Empty,
            0x2 => ZoneCond::ImpOpen,
            0x3 => ZoneCond::ExpOpen,
            0x4 => ZoneCond::Closed,
            0xe => ZoneCond::Full,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_layout() {
        assert_eq!(std::mem::size_of::<ZoneDescriptor>(), 40);
    }

    #[test]
    fn cond_classes() {
        assert!(ZoneCond::ImpOpen.is_open());
        assert!(ZoneCond::ExpOpen.is_open());
        assert!(!ZoneCond::Closed.is_open());
        assert!(ZoneCond::Closed.is_active());
        assert!(!ZoneCond::Full.is_active());
        assert!(!ZoneCond::Empty.is_active());
    }
}
