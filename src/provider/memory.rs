//! RAM-backed provider.
//!
//! Useful for testing and for volatile scratch disks. Data is lost when the
//! provider is dropped.

use parking_lot::RwLock;

use super::{clip, StorageProvider, DEFAULT_SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{SharedRequest, SharedResponse};
use crate::reservation::ReservationTable;

/// In-memory storage provider.
pub struct MemoryProvider {
    data: RwLock<Vec<u8>>,
    sector_size: u32,
    read_only: bool,
    reservations: Option<ReservationTable>,
}

impl MemoryProvider {
    /// Create a zero-filled provider of `length` bytes.
    pub fn new(length: usize) -> Self {
        Self::from_vec(vec![0u8; length])
    }

    /// Create a provider over existing contents.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            sector_size: DEFAULT_SECTOR_SIZE,
            read_only: false,
            reservations: None,
        }
    }

    /// Create a provider with a capacity in megabytes.
    pub fn with_capacity_mb(mb: usize) -> Self {
        Self::new(mb * 1024 * 1024)
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Reject writes.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Serve persistent reservation requests from an in-memory table.
    pub fn with_reservations(mut self) -> Self {
        self.reservations = Some(ReservationTable::new());
        self
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageProvider for MemoryProvider {
    fn length(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    fn supports_shared(&self) -> bool {
        self.reservations.is_some()
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let data = self.data.read();
        let count = clip(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut data = self.data.write();
        let count = clip(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }

    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        match &self.reservations {
            Some(table) => Ok(table.handle(request)),
            None => Err(Error::unsupported("shared reservations")),
        }
    }
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("length", &self.length())
            .field("sector_size", &self.sector_size)
            .field("read_only", &self.read_only)
            .field("reservations", &self.reservations.is_some())
            .finish()
    }
}
