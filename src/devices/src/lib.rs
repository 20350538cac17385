//! The engine half of the userspace block device framework.
//!
//! This crate plays the role the kernel module plays in the real system: it
//! registers block devices, turns submitted block I/O into framed commands,
//! serves them over a character-device-shaped connection, maps request pages
//! into per-connection windows, and completes each request exactly once when
//! the reply arrives (or the connection goes away).
//!
//! The block layer's side of the contract is [`BlockDevice::queue_rq`] and
//! [`BlockDevice::report_zones`]; the userspace side is [`CharDev::open`]
//! plus [`Connection`]'s `read`/`write`/`mmap` methods, which mirror the
//! character-device file operations one-for-one.

mod blockdev;
mod chardev;
mod connection;
mod mapping;
mod registry;
mod request;

pub use blockdev::{BlockDevice, BlockIo, IoHandle, IoType, QueueLimits};
pub use chardev::CharDev;
pub use connection::Connection;
pub use registry::ModuleState;
pub use request::{IoCompletion, SgFragment};

use pagemap::PAGE_SIZE;
use protocol::{MAX_SEGMENTS, MAX_SIZE_PER_COMMAND};

/// Size of the per-connection mapping window: room for a maximal command
/// plus one scratch page.
pub const MAP_AREA_SIZE: usize = MAX_SIZE_PER_COMMAND + PAGE_SIZE;

pub(crate) const WINDOW_SLOTS: usize = MAP_AREA_SIZE / PAGE_SIZE;

/// Reserved pool pages per connection: descriptor list, backref table, and
/// one bounce page per possible segment.
pub(crate) const RESERVED_PAGES: usize = MAX_SEGMENTS + 2;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("invalid device options: {0}")]
    Options(#[from] protocol::OptionsError),
    #[error("page pool: {0}")]
    Pool(#[from] pagemap::Error),
}
