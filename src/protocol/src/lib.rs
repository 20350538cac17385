//! Wire ABI shared by the block-device engine and the userspace worker pool.
//!
//! Everything here is layout-stable: the two header structs cross the
//! character-device stream as raw bytes, and the numeric constants are part
//! of the protocol.

mod ops;
mod options;
mod status;
mod wire;
mod zones;

pub use ops::{ControlType, Opcode};
pub use options::{DeviceOptions, OptionsError, ZonedModel};
pub use status::BlkStatus;
pub use wire::{K2uHeader, MapKind, U2kHeader, K2U_HEADER_SIZE, U2K_HEADER_SIZE};
pub use zones::{ZoneCond, ZoneDescriptor, ZoneType};

pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Most scatter-gather segments a single command may carry.
pub const MAX_SEGMENTS: usize = 256;

/// Upper bound on the data payload of a single command.
pub const MAX_SIZE_PER_COMMAND: usize = 128 * 1024 * 1024;

/// At or below this size a payload travels inline through the stream;
/// above it the request is mapped into the connection window.
pub const MAP_DATA_THRESHOLD: u64 = 128 * 1024;

pub const MAX_ZONES: usize = 128 * 1024;
pub const MAX_ZONE_SECTORS: u64 = (1024 * 1024 * 1024) >> SECTOR_SHIFT;

pub const MAX_DISK_NAME_LEN: usize = 32;
pub const DEFAULT_NUM_THREADS: usize = 4;
