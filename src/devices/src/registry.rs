use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use pagemap::PagePool;
use protocol::{DeviceOptions, ZonedModel};
use tracing::{debug, info};

use crate::blockdev::BlockDevice;
use crate::{DeviceError, WINDOW_SLOTS};

/// Pool pages available for request payloads and reserved pages, on top of
/// the zero region backing idle window slots.
const DEFAULT_POOL_DATA_PAGES: usize = 128 * 1024;

/// Once-initialized engine state: the request-id counter, the page pool,
/// and the device registry. Owned by [`crate::CharDev`] and passed by
/// reference into every component rather than living in a global.
pub struct ModuleState {
    pool: Arc<PagePool>,
    next_request_id: Arc<AtomicU64>,
    devices: Mutex<Vec<Arc<BlockDevice>>>,
}

impl ModuleState {
    pub(crate) fn new(pool_data_pages: Option<usize>) -> Result<ModuleState, DeviceError> {
        let data_pages = pool_data_pages.unwrap_or(DEFAULT_POOL_DATA_PAGES);
        let pool = PagePool::new(WINDOW_SLOTS + data_pages, WINDOW_SLOTS)?;
        Ok(ModuleState {
            pool,
            next_request_id: Arc::new(AtomicU64::new(0)),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Register a new block device and link it into the registry.
    pub fn create_block_device(
        &self,
        options: &DeviceOptions,
    ) -> Result<Arc<BlockDevice>, DeviceError> {
        options.validate()?;
        let name = options.name()?.to_owned();
        let model = options.model()?;

        let device = Arc::new(BlockDevice::new(
            name,
            model,
            options.disk_size,
            options.max_open_zones,
            options.max_active_zones,
            Arc::clone(&self.next_request_id),
        ));

        info!(
            name = device.name(),
            zoned = matches!(model, ZonedModel::HostManaged),
            capacity_sectors = device.capacity_sectors(),
            "block device registered"
        );

        self.devices.lock().unwrap().push(Arc::clone(&device));
        Ok(device)
    }

    /// Look a device up by name. Duplicate names are allowed; the most
    /// recently registered one wins.
    pub fn get_block_device(&self, name: &str) -> Option<Arc<BlockDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|device| device.name() == name)
            .cloned()
    }

    /// Deregister by name and fail anything still queued.
    pub fn remove_block_device(&self, name: &str) {
        let Some(device) = self.get_block_device(name) else {
            return;
        };
        self.remove_device(&device);
    }

    pub(crate) fn remove_device(&self, device: &Arc<BlockDevice>) {
        {
            let mut devices = self.devices.lock().unwrap();
            let before = devices.len();
            devices.retain(|entry| !Arc::ptr_eq(entry, device));
            if devices.len() == before {
                // Already removed by a racing teardown path.
                return;
            }
        }
        debug!(name = device.name(), "block device removed");
        device.fail_pending();
    }
}
