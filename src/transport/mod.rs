//! Transports carrying the block-proxy protocol between a peer and a
//! [`SharedProvider`](crate::provider::SharedProvider).
//!
//! - [`tcp`]: length-prefixed records over a single TCP connection
//! - [`shm`]: request/response buffer in a named shared memory section
//! - [`exchange`]: buffer exchanges with the proxy driver's private device
//!
//! Each transport implements [`Transport`](crate::service::Transport) and is
//! driven by a [`DevioService`](crate::service::DevioService).

pub mod exchange;
pub mod shm;
pub mod tcp;

pub use exchange::{ExchangeDevice, ExchangeEngine, ExchangeState, ExchangeTransport};
pub use shm::ShmTransport;
pub use tcp::TcpTransport;
