//! Boundary to the driver control plane.
//!
//! The control plane creates, queries and removes kernel virtual disks. This
//! crate does not talk to a driver itself; a [`ControlPlane`] implementation
//! is handed to [`DevioService::mount`](crate::service::DevioService::mount).

use std::fmt;
use std::ops::BitOr;

use crate::error::ControlError;

/// Device creation flags describing how the driver reaches its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ProxyFlags(pub u32);

impl ProxyFlags {
    pub const NONE: Self = Self(0);
    pub const READ_ONLY: Self = Self(0x0000_0001);
    pub const REMOVABLE: Self = Self(0x0000_0002);
    /// Disk backed through the block-proxy protocol.
    pub const TYPE_PROXY: Self = Self(0x0000_0300);
    /// Proxy reached over a byte stream (TCP).
    pub const PROXY_TYPE_TCP: Self = Self(0x0000_1000);
    /// Proxy reached through shared memory.
    pub const PROXY_TYPE_SHM: Self = Self(0x0000_2000);
    /// Proxy served through the driver's own exchange device.
    pub const PROXY_TYPE_EXCHANGE: Self = Self(0x0000_4000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ProxyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ProxyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Everything the control plane needs to create a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Transport object name or address the driver connects to.
    pub identity: String,
    pub flags: ProxyFlags,
    /// Disk size in bytes.
    pub size: u64,
    pub sector_size: u32,
    /// Byte offset of the disk image within the backing store.
    pub image_offset: u64,
}

/// Geometry reported for an existing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_number: u32,
    pub identity: String,
    pub flags: ProxyFlags,
    pub size: u64,
    pub sector_size: u32,
    pub image_offset: u64,
}

/// Kernel virtual disk management.
pub trait ControlPlane: Send + Sync {
    /// Create a device and return its number.
    fn create_device(&self, request: &DeviceRequest) -> Result<u32, ControlError>;

    /// Describe an existing device.
    fn query_device(&self, device_number: u32) -> Result<DeviceInfo, ControlError>;

    /// Remove a device.
    ///
    /// `AccessDenied` means the device is in use and the call may be retried.
    /// `NotFound` means it is already gone.
    fn remove_device(&self, device_number: u32) -> Result<(), ControlError>;
}

impl<C: ControlPlane + ?Sized> ControlPlane for std::sync::Arc<C> {
    fn create_device(&self, request: &DeviceRequest) -> Result<u32, ControlError> {
        (**self).create_device(request)
    }

    fn query_device(&self, device_number: u32) -> Result<DeviceInfo, ControlError> {
        (**self).query_device(device_number)
    }

    fn remove_device(&self, device_number: u32) -> Result<(), ControlError> {
        (**self).remove_device(device_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_compose() {
        let flags = ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_SHM | ProxyFlags::READ_ONLY;
        assert!(flags.contains(ProxyFlags::TYPE_PROXY));
        assert!(flags.contains(ProxyFlags::READ_ONLY));
        assert!(!flags.contains(ProxyFlags::REMOVABLE));
        assert_eq!(flags.to_string(), "0x00002301");
    }
}
