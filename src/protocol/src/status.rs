/// Block status alphabet, value-compatible with the kernel's `blk_status_t`.
///
/// Replies on the wire carry these as an `i64`; anything outside the set is
/// coerced to `IoError` by the reply handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum BlkStatus {
    Ok = 0,
    NotSupported = 1,
    Timeout = 2,
    NoSpace = 3,
    Resource = 9,
    IoError = 10,
    /// Device-wide resources exhausted; the queue is rerun once inflight
    /// requests free them.
    DeviceResource = 13,
    /// Zone-scoped resources exhausted; I/O to other zones may still be
    /// served.
    ZoneResource = 14,
    /// Too many open zones; retryable once an open zone closes.
    ZoneOpenResource = 15,
    /// Too many active zones; retryable once an active zone resets.
    ZoneActiveResource = 16,
}

impl BlkStatus {
    pub fn from_raw(raw: u32) -> Option<BlkStatus> {
        Some(match raw {
            0 => BlkStatus::Ok,
            1 => BlkStatus::NotSupported,
            2 => BlkStatus::Timeout,
            3 => BlkStatus::NoSpace,
            9 => BlkStatus::Resource,
            10 => BlkStatus::IoError,
            13 => BlkStatus::DeviceResource,
            14 => BlkStatus::ZoneResource,
            15 => BlkStatus::ZoneOpenResource,
            16 => BlkStatus::ZoneActiveResource,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == BlkStatus::Ok
    }
}
