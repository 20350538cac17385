//! Userspace serving library for the block device engine.
//!
//! A backend implements [`BlockOperations`]; [`serve`] creates (or binds to)
//! a block device and runs a pool of worker threads, each owning one
//! connection: read a command, pull or map its payload, dispatch to the
//! backend, post the reply. Host-managed zoned backends get their zone
//! state machine from the [`zoned`] module.

pub mod ops;
pub mod worker;
pub mod zoned;

pub use ops::BlockOperations;
pub use worker::{serve, Daemon, ServeError};
