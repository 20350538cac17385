//! Page-granular shared memory for the block engine.
//!
//! [`PagePool`] is a memfd-backed pool holding every page that can appear in
//! a block request: payload pages handed to submitters, per-connection
//! reserved pages (descriptor list, backref table, bounce pages), and a
//! permanently-zero prefix region. Because the pool is file-backed, any page
//! can additionally be mapped at any address — which is what [`Window`]
//! does: it reserves a fixed VMA and retargets individual page slots at pool
//! pages with `mmap(MAP_FIXED)`, giving O(1) per-slot remaps after the
//! one-time reservation.

mod pool;
mod window;

pub use pool::{PagePool, PageRange};
pub use window::Window;

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("memfd creation failed: {0}")]
    MemfdCreate(nix::errno::Errno),
    #[error("sizing pool file failed: {0}")]
    Truncate(nix::errno::Errno),
    #[error("mapping failed: {0}")]
    Map(nix::errno::Errno),
    #[error("pool exhausted: {requested} pages requested, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("page range out of bounds")]
    OutOfBounds,
}
