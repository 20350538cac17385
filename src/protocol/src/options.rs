use std::fmt;
use std::str;

use zerocopy_derive::{AsBytes, FromBytes};

use crate::MAX_DISK_NAME_LEN;

/// Zoning model advertised by a device. Values follow the kernel's
/// `blk_zoned_model` (host-aware is not supported and has no variant here).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ZonedModel {
    #[default]
    None = 0,
    HostManaged = 2,
}

impl ZonedModel {
    pub fn from_raw(raw: u32) -> Option<ZonedModel> {
        match raw {
            0 => Some(ZonedModel::None),
            2 => Some(ZonedModel::HostManaged),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum OptionsError {
    NameTooLong,
    EmptyName,
    ZeroSize,
    BadModel(u32),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OptionsError::NameTooLong => {
                write!(f, "disk name exceeds {} bytes", MAX_DISK_NAME_LEN)
            }
            OptionsError::EmptyName => write!(f, "disk name is empty"),
            OptionsError::ZeroSize => write!(f, "disk size is zero"),
            OptionsError::BadModel(raw) => write!(f, "unknown zoned model {raw}"),
        }
    }
}

impl std::error::Error for OptionsError {}

/// Payload of a `Create` control message. Crosses the wire by pointer, so
/// the layout is fixed.
#[derive(Debug, Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct DeviceOptions {
    pub model: u32,
    /// Worker-count hint for the serving library; 0 means the default.
    pub num_threads: u32,
    pub disk_size: u64,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub disk_name: [u8; MAX_DISK_NAME_LEN],
}

impl DeviceOptions {
    pub fn new(disk_name: &str, disk_size: u64) -> Result<DeviceOptions, OptionsError> {
        if disk_name.is_empty() {
            return Err(OptionsError::EmptyName);
        }
        if disk_name.len() > MAX_DISK_NAME_LEN {
            return Err(OptionsError::NameTooLong);
        }
        if disk_size == 0 {
            return Err(OptionsError::ZeroSize);
        }
        let mut name = [0u8; MAX_DISK_NAME_LEN];
        name[..disk_name.len()].copy_from_slice(disk_name.as_bytes());
        Ok(DeviceOptions {
            model: ZonedModel::None as u32,
            num_threads: 0,
            disk_size,
            max_open_zones: 0,
            max_active_zones: 0,
            disk_name: name,
        })
    }

    pub fn host_managed(
        disk_name: &str,
        disk_size: u64,
        max_open_zones: u32,
        max_active_zones: u32,
    ) -> Result<DeviceOptions, OptionsError> {
        let mut options = DeviceOptions::new(disk_name, disk_size)?;
        options.model = ZonedModel::HostManaged as u32;
        options.max_open_zones = max_open_zones;
        options.max_active_zones = max_active_zones;
        Ok(options)
    }

    pub fn model(&self) -> Result<ZonedModel, OptionsError> {
        ZonedModel::from_raw(self.model).ok_or(OptionsError::BadModel(self.model))
    }

    /// The disk name, NUL-padded on the wire.
    pub fn name(&self) -> Result<&str, OptionsError> {
        let end = self
            .disk_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_DISK_NAME_LEN);
        if end == 0 {
            return Err(OptionsError::EmptyName);
        }
        str::from_utf8(&self.disk_name[..end]).map_err(|_| OptionsError::EmptyName)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        self.model()?;
        self.name()?;
        if self.disk_size == 0 {
            return Err(OptionsError::ZeroSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_padding() {
        let options = DeviceOptions::new("ramdisk", 1 << 20).unwrap();
        assert_eq!(options.name().unwrap(), "ramdisk");
        assert_eq!(options.model().unwrap(), ZonedModel::None);
        options.validate().unwrap();
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            DeviceOptions::new("", 1 << 20).unwrap_err(),
            OptionsError::EmptyName
        );
        assert_eq!(
            DeviceOptions::new(&"x".repeat(33), 1 << 20).unwrap_err(),
            OptionsError::NameTooLong
        );
        assert_eq!(
            DeviceOptions::new("d", 0).unwrap_err(),
            OptionsError::ZeroSize
        );

        let mut options = DeviceOptions::new("d", 1 << 20).unwrap();
        options.model = 7;
        assert!(options.validate().is_err());
    }

    #[test]
    fn zoned_options() {
        let options = DeviceOptions::host_managed("zoned", 1 << 30, 32, 64).unwrap();
        assert_eq!(options.model().unwrap(), ZonedModel::HostManaged);
        assert_eq!(options.max_open_zones, 32);
        assert_eq!(options.max_active_zones, 64);
    }
}
