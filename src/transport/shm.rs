//! Shared-memory transport.
//!
//! The server owns four named objects derived from one base name: the
//! section holding the request/response buffer, a request signal posted by
//! the peer, a response signal posted by the server, and a lock claiming the
//! name for the server's lifetime. Peer and server take turns on the buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::ProxyFlags;
use crate::dispatch::{dispatch_buffer, Outcome, TransferStats};
use crate::error::{Error, Result};
use crate::protocol::HEADER_SIZE;
use crate::service::{ServeContext, StopHook, Transport};
use crate::sys::{NamedLock, NamedSignal, ObjectNames, SharedSection};

/// Default section size: 8 MiB of data after the header.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024 + HEADER_SIZE;

#[derive(Default)]
struct StopState {
    stopping: AtomicBool,
    request: Mutex<Option<Arc<NamedSignal>>>,
}

impl StopState {
    fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(signal) = self.request.lock().as_ref() {
            if let Err(e) = signal.post() {
                tracing::warn!(error = %e, "failed to wake shared-memory server");
            }
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Serves a provider through a named shared memory section.
pub struct ShmTransport {
    name: String,
    buffer_size: usize,
    stop: Arc<StopState>,
}

impl ShmTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            stop: Arc::new(StopState::default()),
        }
    }

    /// Total section size, header included.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl Transport for ShmTransport {
    fn proxy_identity(&self) -> String {
        self.name.clone()
    }

    fn proxy_flags(&self) -> ProxyFlags {
        ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_SHM
    }

    fn stop_hook(&self) -> StopHook {
        let stop = Arc::clone(&self.stop);
        Arc::new(move || stop.request_stop())
    }

    fn run(self: Box<Self>, ctx: ServeContext) -> Result<TransferStats> {
        if self.buffer_size <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "shared memory buffer of {} bytes leaves no room for data",
                self.buffer_size
            )));
        }
        let names = ObjectNames::new(&self.name)?;
        let _claim = NamedLock::acquire(&names.server())?;
        let mut section = SharedSection::create(names.section(), self.buffer_size)?;
        let request = Arc::new(NamedSignal::create(&names.request())?);
        let response = NamedSignal::create(&names.response())?;

        *self.stop.request.lock() = Some(Arc::clone(&request));
        if self.stop.is_stopping() {
            return Ok(TransferStats::default());
        }

        tracing::debug!(name = %self.name, size = self.buffer_size, "shared memory endpoint created");
        ctx.ready();

        request.wait()?;
        if self.stop.is_stopping() {
            tracing::debug!(name = %self.name, "stopped before a peer connected");
            return Ok(TransferStats::default());
        }
        tracing::info!(name = %self.name, "peer connected");

        let mut stats = TransferStats::default();
        loop {
            if self.stop.is_stopping() {
                tracing::debug!(name = %self.name, "stop requested");
                break;
            }
            let outcome = dispatch_buffer(ctx.provider(), section.as_mut_slice(), &mut stats)?;
            response.post()?;
            if outcome == Outcome::Close {
                tracing::debug!(name = %self.name, "peer requested close");
                break;
            }
            request.wait()?;
        }

        self.stop.request.lock().take();
        stats.log_summary("shm");
        Ok(stats)
    }
}
