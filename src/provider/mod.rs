//! Storage provider abstraction.
//!
//! A provider is the backing store behind a served virtual disk. The
//! transports never touch storage directly; they call into a
//! [`SharedProvider`], which wraps a [`StorageProvider`] and adds the
//! host-side policy: serialization for backends that cannot take parallel
//! calls, and exactly-once closing notifications.
//!
//! Decorators in the submodules compose over any provider:
//! - [`OffsetProvider`] - a window starting at a fixed byte offset
//! - [`FakeMbrProvider`] - a raw volume presented as a partitioned disk
//! - [`StreamProvider`] / [`FileProvider`] - byte streams and image files

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::protocol::{flags, InfoResponse, SharedRequest, SharedResponse};

pub mod fake_mbr;
pub mod memory;
pub mod offset;
pub mod stream;

pub use fake_mbr::{estimate_volume_length, FakeMbrProvider, PREFIX_SIZE};
pub use memory::MemoryProvider;
pub use offset::OffsetProvider;
pub use stream::{FileProvider, StreamProvider};

/// Default sector size in bytes.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Trait that all storage backends must implement.
///
/// `read` and `write` must never touch bytes outside `[0, length)`. A request
/// that starts inside the extent and runs past its end is served short and
/// returns the byte count actually transferred; a request starting at or past
/// the end is an error. Use [`clip`] to apply these rules.
pub trait StorageProvider: Send + Sync {
    /// Size of the store in bytes. Fixed for the lifetime of the instance.
    fn length(&self) -> u64;

    /// Sector size in bytes.
    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    /// Whether writes are accepted.
    fn can_write(&self) -> bool;

    /// Whether concurrent `read`/`write` calls are safe.
    fn supports_parallel(&self) -> bool {
        false
    }

    /// Whether [`StorageProvider::shared_keys`] is implemented.
    fn supports_shared(&self) -> bool {
        false
    }

    /// Whether the backend defers writes (callers may skip flushing).
    fn use_lazy_writes(&self) -> bool {
        false
    }

    /// Alignment the backend honors for its fast I/O path. Advertised to peers.
    fn required_alignment(&self) -> u64 {
        1
    }

    /// Read up to `buf.len()` bytes at `offset`.
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize>;

    /// Write `buf` at `offset`.
    fn write(&self, buf: &[u8], offset: i64) -> Result<usize>;

    /// Handle a persistent reservation request.
    fn shared_keys(&self, _request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        Err(Error::unsupported("shared reservations"))
    }
}

impl<P: StorageProvider + ?Sized> StorageProvider for Arc<P> {
    fn length(&self) -> u64 {
        (**self).length()
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn can_write(&self) -> bool {
        (**self).can_write()
    }
    fn supports_parallel(&self) -> bool {
        (**self).supports_parallel()
    }
    fn supports_shared(&self) -> bool {
        (**self).supports_shared()
    }
    fn use_lazy_writes(&self) -> bool {
        (**self).use_lazy_writes()
    }
    fn required_alignment(&self) -> u64 {
        (**self).required_alignment()
    }
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        (**self).read(buf, offset)
    }
    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        (**self).write(buf, offset)
    }
    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        (**self).shared_keys(request)
    }
}

impl<P: StorageProvider + ?Sized> StorageProvider for Box<P> {
    fn length(&self) -> u64 {
        (**self).length()
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn can_write(&self) -> bool {
        (**self).can_write()
    }
    fn supports_parallel(&self) -> bool {
        (**self).supports_parallel()
    }
    fn supports_shared(&self) -> bool {
        (**self).supports_shared()
    }
    fn use_lazy_writes(&self) -> bool {
        (**self).use_lazy_writes()
    }
    fn required_alignment(&self) -> u64 {
        (**self).required_alignment()
    }
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        (**self).read(buf, offset)
    }
    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        (**self).write(buf, offset)
    }
    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        (**self).shared_keys(request)
    }
}

/// Clip a transfer of `count` bytes at `offset` to a store of `length` bytes.
///
/// Returns the number of bytes that may be transferred. Zero-length transfers
/// at or before the end are allowed; anything else starting outside the
/// extent is [`Error::OutOfRange`].
pub fn clip(offset: i64, count: usize, length: u64) -> Result<usize> {
    let out_of_range = || Error::OutOfRange {
        offset,
        length: count as u64,
    };
    if offset < 0 {
        return Err(out_of_range());
    }
    let offset = offset as u64;
    if count == 0 && offset <= length {
        return Ok(0);
    }
    if offset >= length {
        return Err(out_of_range());
    }
    Ok(count.min((length - offset).min(usize::MAX as u64) as usize))
}

/// Lifecycle notifications emitted by a [`SharedProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The provider is about to release its backend.
    Closing,
    /// The backend has been released.
    Closed,
}

type ProviderListener = Box<dyn Fn(ProviderEvent) + Send + Sync>;

/// Host-side handle over a storage provider.
///
/// Shared by reference count between the caller and any services using it.
/// Calls are serialized unless the backend advertises parallel support and
/// single-threaded use has not been forced. [`SharedProvider::close`] (or the
/// last drop) releases the backend; `Closing` and `Closed` are delivered
/// exactly once no matter which path gets there first.
pub struct SharedProvider {
    backend: RwLock<Option<Box<dyn StorageProvider>>>,
    length: u64,
    sector_size: u32,
    force_single_thread: AtomicBool,
    serial: Mutex<()>,
    closed: AtomicBool,
    listeners: Mutex<Vec<ProviderListener>>,
}

impl SharedProvider {
    /// Wrap a backend.
    pub fn new(backend: impl StorageProvider + 'static) -> Arc<Self> {
        Self::from_boxed(Box::new(backend))
    }

    /// Wrap an already boxed backend.
    pub fn from_boxed(backend: Box<dyn StorageProvider>) -> Arc<Self> {
        let length = backend.length();
        let sector_size = backend.sector_size();
        Arc::new(Self {
            backend: RwLock::new(Some(backend)),
            length,
            sector_size,
            force_single_thread: AtomicBool::new(false),
            serial: Mutex::new(()),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Force serialized calls even if the backend supports parallel use.
    pub fn set_force_single_thread(&self, force: bool) {
        self.force_single_thread.store(force, Ordering::Relaxed);
    }

    pub fn force_single_thread(&self) -> bool {
        self.force_single_thread.load(Ordering::Relaxed)
    }

    /// Whether the provider has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a lifecycle listener.
    pub fn subscribe(&self, listener: impl Fn(ProviderEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// INFO response describing this provider.
    pub fn info(&self) -> InfoResponse {
        let mut info_flags = 0;
        if !self.can_write() {
            info_flags |= flags::READ_ONLY;
        }
        if self.supports_shared() {
            info_flags |= flags::SUPPORTS_SHARED;
        }
        InfoResponse {
            file_size: self.length,
            required_alignment: self.required_alignment(),
            flags: info_flags,
        }
    }

    /// Release the backend. Waits for in-flight calls. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify(ProviderEvent::Closing);
        let backend = self.backend.write().take();
        drop(backend);
        tracing::debug!(length = self.length, "provider closed");
        self.notify(ProviderEvent::Closed);
    }

    fn notify(&self, event: ProviderEvent) {
        for listener in self.listeners.lock().iter() {
            listener(event);
        }
    }

    fn with_backend<T>(&self, f: impl FnOnce(&dyn StorageProvider) -> Result<T>) -> Result<T> {
        let guard = self.backend.read();
        let backend = guard.as_deref().ok_or(Error::ProviderClosed)?;
        if backend.supports_parallel() && !self.force_single_thread() {
            f(backend)
        } else {
            let _serial = self.serial.lock();
            f(backend)
        }
    }

    fn query<T: Default>(&self, f: impl FnOnce(&dyn StorageProvider) -> T) -> T {
        self.backend.read().as_deref().map(f).unwrap_or_default()
    }
}

impl StorageProvider for SharedProvider {
    fn length(&self) -> u64 {
        self.length
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn can_write(&self) -> bool {
        self.query(|p| p.can_write())
    }

    fn supports_parallel(&self) -> bool {
        !self.force_single_thread() && self.query(|p| p.supports_parallel())
    }

    fn supports_shared(&self) -> bool {
        self.query(|p| p.supports_shared())
    }

    fn use_lazy_writes(&self) -> bool {
        self.query(|p| p.use_lazy_writes())
    }

    fn required_alignment(&self) -> u64 {
        self.query(|p| p.required_alignment()).max(1)
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        self.with_backend(|p| p.read(buf, offset))
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        self.with_backend(|p| p.write(buf, offset))
    }

    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        self.with_backend(|p| p.shared_keys(request))
    }
}

impl Drop for SharedProvider {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SharedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedProvider")
            .field("length", &self.length)
            .field("sector_size", &self.sector_size)
            .field("force_single_thread", &self.force_single_thread())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Placeholder provider with a fixed length that rejects all I/O.
///
/// For consumers that need a length-bearing provider without serving it, such
/// as a direct-attach path that bypasses the protocol.
#[derive(Debug, Clone, Copy)]
pub struct NullProvider {
    length: u64,
    sector_size: u32,
}

impl NullProvider {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }
}

impl StorageProvider for NullProvider {
    fn length(&self) -> u64 {
        self.length
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn can_write(&self) -> bool {
        false
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    fn read(&self, _buf: &mut [u8], _offset: i64) -> Result<usize> {
        Err(Error::unsupported("null provider has no data"))
    }

    fn write(&self, _buf: &[u8], _offset: i64) -> Result<usize> {
        Err(Error::unsupported("null provider has no data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_clip() {
        assert_eq!(clip(0, 512, 1024).unwrap(), 512);
        assert_eq!(clip(1000, 512, 1024).unwrap(), 24);
        assert_eq!(clip(1024, 0, 1024).unwrap(), 0);
        assert!(clip(1024, 1, 1024).is_err());
        assert!(clip(-1, 1, 1024).is_err());
    }

    #[test]
    fn test_null_provider_rejects_io() {
        let null = NullProvider::new(4096);
        let mut buf = [0u8; 16];
        assert_eq!(null.length(), 4096);
        assert!(null.read(&mut buf, 0).is_err());
        assert!(null.write(&buf, 0).is_err());
    }

    #[test]
    fn test_close_notifies_once() {
        let provider = SharedProvider::new(MemoryProvider::new(4096));
        let closing = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closing = closing.clone();
            let closed = closed.clone();
            provider.subscribe(move |event| match event {
                ProviderEvent::Closing => {
                    closing.fetch_add(1, Ordering::SeqCst);
                }
                ProviderEvent::Closed => {
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        provider.close();
        provider.close();
        drop(provider);

        assert_eq!(closing.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_provider_rejects_io() {
        let provider = SharedProvider::new(MemoryProvider::new(4096));
        provider.close();
        let mut buf = [0u8; 8];
        assert!(matches!(
            provider.read(&mut buf, 0),
            Err(Error::ProviderClosed)
        ));
        assert_eq!(provider.length(), 4096);
    }

    #[test]
    fn test_info_flags() {
        let ro = SharedProvider::new(MemoryProvider::new(1024).read_only());
        assert_eq!(ro.info().flags, flags::READ_ONLY);

        let shared = SharedProvider::new(MemoryProvider::new(1024).with_reservations());
        assert_eq!(shared.info().flags, flags::SUPPORTS_SHARED);
    }

    #[test]
    fn test_force_single_thread_overrides_parallel() {
        let provider = SharedProvider::new(MemoryProvider::new(1024));
        assert!(provider.supports_parallel());
        provider.set_force_single_thread(true);
        assert!(!provider.supports_parallel());
    }
}
