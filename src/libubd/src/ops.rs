use protocol::{BlkStatus, ZoneDescriptor};

/// Backend operation handlers, one per opcode.
///
/// Every method is optional: the default returns `NotSupported`, which the
/// engine surfaces to the block layer unchanged. Offsets and lengths are in
/// bytes. Data ops may be called several times for one command when the
/// payload arrives as a descriptor list; `append_zone` receives
/// `out_position` only on the first call of such a run.
pub trait BlockOperations: Send + Sync {
    fn read(&self, _data: &mut [u8], _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn write(&self, _data: &[u8], _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn discard(&self, _offset: u64, _length: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn flush(&self) -> BlkStatus {
        BlkStatus::NotSupported
    }

    /// Fill `zones` with descriptors starting at the zone containing
    /// `offset`; returns how many were filled.
    fn report_zones(
        &self,
        _offset: u64,
        _zones: &mut [ZoneDescriptor],
    ) -> Result<usize, BlkStatus> {
        Err(BlkStatus::NotSupported)
    }

    fn open_zone(&self, _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn close_zone(&self, _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn finish_zone(&self, _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    /// Sequential-zone append: the backend picks the effective offset from
    /// the zone's write pointer and reports it through `out_position`.
    fn append_zone(&self, _data: &[u8], _offset: u64, _out_position: Option<&mut u64>) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn reset_zone(&self, _offset: u64) -> BlkStatus {
        BlkStatus::NotSupported
    }

    fn reset_all_zones(&self) -> BlkStatus {
        BlkStatus::NotSupported
    }
}
