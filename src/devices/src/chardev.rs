use std::sync::Arc;

use crate::connection::Connection;
use crate::registry::ModuleState;
use crate::DeviceError;

/// The miscellaneous character device: the entry point userspace opens to
/// serve block devices. Owns the engine's once-initialized state.
pub struct CharDev {
    state: Arc<ModuleState>,
}

impl CharDev {
    pub fn new() -> Result<CharDev, DeviceError> {
        Ok(CharDev {
            state: Arc::new(ModuleState::new(None)?),
        })
    }

    /// Like [`CharDev::new`] with an explicit payload-page budget, for
    /// hosts that know their working set.
    pub fn with_pool_pages(data_pages: usize) -> Result<CharDev, DeviceError> {
        Ok(CharDev {
            state: Arc::new(ModuleState::new(Some(data_pages))?),
        })
    }

    pub fn state(&self) -> &Arc<ModuleState> {
        &self.state
    }

    /// The `open` file operation: a fresh, unbound connection.
    pub fn open(&self) -> Arc<Connection> {
        Arc::new(Connection::new(Arc::clone(&self.state)))
    }
}
