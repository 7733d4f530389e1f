//! Service builder for configuring and creating a [`DevioService`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provider::SharedProvider;
use crate::service::{DevioService, ServiceConfig, Transport};

/// Builder for creating a [`DevioService`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use devio::provider::{FileProvider, SharedProvider};
/// use devio::service::DevioService;
/// use devio::transport::shm::ShmTransport;
///
/// let image = FileProvider::open("/var/lib/disk.img", true, true)?;
/// let service = DevioService::builder()
///     .provider(SharedProvider::new(image))
///     .transport(ShmTransport::new("disk0"))
///     .start_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok::<(), devio::Error>(())
/// ```
#[derive(Default)]
pub struct ServiceBuilder {
    provider: Option<Arc<SharedProvider>>,
    transport: Option<Box<dyn Transport>>,
    config: ServiceConfig,
}

impl ServiceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider to serve.
    pub fn provider(mut self, provider: Arc<SharedProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// How long `start` waits for readiness.
    ///
    /// Default: 30 s
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.config.start_timeout = timeout;
        self
    }

    /// Retry policy for busy devices during dismount.
    ///
    /// Default: 40 retries, 100 ms apart
    pub fn dismount_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.config.dismount_retries = retries;
        self.config.dismount_retry_interval = interval;
        self
    }

    /// Whether a faulting dispatch loop removes its device.
    ///
    /// Default: true
    pub fn force_removal_on_crash(mut self, enabled: bool) -> Self {
        self.config.force_removal_on_crash = enabled;
        self
    }

    /// Whether the service closes the provider when it shuts down.
    ///
    /// Default: true
    pub fn owns_provider(mut self, owns: bool) -> Self {
        self.config.owns_provider = owns;
        self
    }

    /// Byte offset of the image inside the backing store, passed to the
    /// control plane.
    pub fn image_offset(mut self, offset: u64) -> Self {
        self.config.image_offset = offset;
        self
    }

    /// Override the sector size reported to the control plane.
    pub fn sector_size(mut self, sector_size: u32) -> Self {
        self.config.sector_size = Some(sector_size);
        self
    }

    /// Ask for a read-only device even if the provider is writable.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Build the service.
    pub fn build(self) -> Result<DevioService> {
        let provider = self
            .provider
            .ok_or_else(|| Error::InvalidConfig("no provider set".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| Error::InvalidConfig("no transport set".into()))?;

        if let Some(sector_size) = self.config.sector_size {
            if !sector_size.is_power_of_two() || sector_size < 512 {
                return Err(Error::InvalidConfig(format!(
                    "sector size {sector_size} is not a power of two of at least 512"
                )));
            }
        }
        if self.config.start_timeout.is_zero() {
            return Err(Error::InvalidConfig("start timeout must be non-zero".into()));
        }

        Ok(DevioService::new(provider, transport, self.config))
    }
}
