//! # devio
//!
//! User-mode server for a block-proxy virtual disk. A kernel driver exposes
//! a disk and forwards every read and write to this process, which answers
//! from a pluggable storage provider.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devio::provider::{FileProvider, SharedProvider};
//! use devio::transport::TcpTransport;
//! use devio::{DevioService, Result};
//!
//! fn main() -> Result<()> {
//!     let image = FileProvider::open("disk.img", true, false)?;
//!     let mut service = DevioService::builder()
//!         .provider(SharedProvider::new(image))
//!         .transport(TcpTransport::new("127.0.0.1:9000"))
//!         .build()?;
//!
//!     service.start()?;
//!     // Serving until the peer sends CLOSE
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! - **TCP**: one connection, records streamed in both directions
//! - **Shared memory**: a named section plus request/response signals
//! - **Kernel exchange**: buffer exchanges with the driver's private device
//!   (Windows driver device; the engine itself is portable)

mod builder;
mod error;

pub mod client;
pub mod control;
pub mod dispatch;
pub mod logging;
pub mod protocol;
pub mod provider;
pub mod reservation;
pub mod service;
pub mod sys;
pub mod transport;

// Re-exports
pub use builder::ServiceBuilder;
pub use control::{ControlPlane, DeviceInfo, DeviceRequest, ProxyFlags};
pub use error::{ControlError, Error, Result};
pub use provider::{SharedProvider, StorageProvider};
pub use service::{DevioService, ServiceConfig, ServiceEvent, ServiceState, Transport};
