//! Kernel-exchange transport.
//!
//! The driver exposes a private device. The server locks a buffer into the
//! driver's view, then repeatedly submits an "exchange" request carrying its
//! last response; the request completes when the driver has placed the next
//! peer request in the same buffer. The buffer layout is the one used by the
//! shared-memory transport.
//!
//! The exchange is an explicit state machine:
//!
//! ```text
//! Completed -> (dispatch) -> Submitted -> Completed
//!                                      -> Pending -> Completed | BufferTooSmall
//!                                      -> BufferTooSmall -> Resized -> Submitted
//! ```
//!
//! Any state may move to `Closed` on CLOSE, device removal or a stop
//! request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::ProxyFlags;
use crate::dispatch::{dispatch_buffer, Outcome, TransferStats};
use crate::error::{Error, Result};
use crate::protocol::{set_header_request_code, RequestCode, HEADER_SIZE};
use crate::provider::SharedProvider;
use crate::service::{ServeContext, StopHook, Transport};
use crate::sys::PageBuffer;

/// Default exchange buffer size, header included.
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Upper bound for buffer growth.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// How a finished exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The buffer holds the next peer request.
    Done,
    /// The peer needs a larger buffer for its next request.
    BufferTooSmall,
    /// The device has been removed.
    DeviceGone,
    /// The wait was cut short by the device waker.
    Interrupted,
}

/// Result of submitting an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Completed(Completion),
    Pending,
}

/// A driver device that can carry exchanges.
pub trait ExchangeDevice: Send {
    /// Lock `buffer` into the driver's view. The lock stays outstanding until
    /// [`ExchangeDevice::unlock_memory`].
    fn lock_memory(&mut self, buffer: &mut PageBuffer) -> Result<()>;

    /// Wait for the outstanding lock to finish and release it. Does nothing
    /// when no lock is outstanding.
    fn unlock_memory(&mut self) -> Result<()>;

    /// Submit an exchange carrying the response in `buffer`.
    fn submit(&mut self, buffer: &mut PageBuffer) -> Result<Submission>;

    /// Wait for a pending exchange.
    fn complete(&mut self, buffer: &mut PageBuffer) -> Result<Completion>;

    /// Hook that makes a blocked [`ExchangeDevice::complete`] return
    /// [`Completion::Interrupted`].
    fn waker(&self) -> StopHook;
}

/// State of the exchange machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// An exchange has been handed to the device.
    Submitted,
    /// The device accepted the exchange and will complete it later.
    Pending,
    /// The buffer holds a request to dispatch.
    Completed,
    /// The device rejected the exchange for lack of buffer space.
    BufferTooSmall,
    /// A larger buffer is locked; the same exchange must be resubmitted.
    Resized,
    /// The session is over.
    Closed,
}

/// Drives one exchange session over an [`ExchangeDevice`].
pub struct ExchangeEngine<D: ExchangeDevice> {
    // Dropped before `buffer`: the device must release it first.
    device: D,
    buffer: PageBuffer,
    state: ExchangeState,
    stop: Arc<AtomicBool>,
    stats: TransferStats,
}

impl<D: ExchangeDevice> ExchangeEngine<D> {
    /// Allocate and lock a buffer of `buffer_size` bytes, pre-seeded with an
    /// INFO request so the first exchange carries the device description.
    pub fn new(mut device: D, buffer_size: usize, stop: Arc<AtomicBool>) -> Result<Self> {
        if buffer_size <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "exchange buffer of {buffer_size} bytes leaves no room for data"
            )));
        }
        let mut buffer = PageBuffer::new(buffer_size)?;
        device.lock_memory(&mut buffer)?;
        set_header_request_code(buffer.as_mut_slice(), RequestCode::Info);
        Ok(Self {
            device,
            buffer,
            state: ExchangeState::Completed,
            stop,
            stats: TransferStats::default(),
        })
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn finish(&mut self, completion: Completion) -> ExchangeState {
        match completion {
            Completion::Done => ExchangeState::Completed,
            Completion::BufferTooSmall => ExchangeState::BufferTooSmall,
            Completion::DeviceGone => {
                tracing::info!("exchange device gone");
                ExchangeState::Closed
            }
            Completion::Interrupted if self.stopping() => ExchangeState::Closed,
            Completion::Interrupted => ExchangeState::Pending,
        }
    }

    /// Replace the buffer with one twice the size, keeping its contents.
    fn grow(&mut self) -> Result<()> {
        let size = self.buffer.len() * 2;
        if size > MAX_BUFFER_SIZE {
            return Err(Error::protocol(format!(
                "peer asked for an exchange buffer beyond {MAX_BUFFER_SIZE} bytes"
            )));
        }
        self.device.unlock_memory()?;

        let mut grown = PageBuffer::new(size)?;
        let old = self.buffer.as_slice();
        grown.as_mut_slice()[..old.len()].copy_from_slice(old);
        self.buffer = grown;

        self.device.lock_memory(&mut self.buffer)?;
        tracing::debug!(size, "exchange buffer grown");
        Ok(())
    }

    /// Perform one transition.
    pub fn step(&mut self, provider: &SharedProvider) -> Result<ExchangeState> {
        let next = match self.state {
            ExchangeState::Closed => ExchangeState::Closed,
            _ if self.stopping() => ExchangeState::Closed,
            ExchangeState::Completed => {
                match dispatch_buffer(provider, self.buffer.as_mut_slice(), &mut self.stats)? {
                    Outcome::Respond => match self.device.submit(&mut self.buffer)? {
                        Submission::Completed(c) => self.finish(c),
                        Submission::Pending => ExchangeState::Pending,
                    },
                    Outcome::Close => {
                        tracing::debug!("peer requested close");
                        ExchangeState::Closed
                    }
                }
            }
            ExchangeState::Submitted | ExchangeState::Resized => {
                match self.device.submit(&mut self.buffer)? {
                    Submission::Completed(c) => self.finish(c),
                    Submission::Pending => ExchangeState::Pending,
                }
            }
            ExchangeState::Pending => {
                let completion = self.device.complete(&mut self.buffer)?;
                self.finish(completion)
            }
            ExchangeState::BufferTooSmall => {
                self.grow()?;
                ExchangeState::Resized
            }
        };
        tracing::trace!(from = ?self.state, to = ?next, "exchange");
        self.state = next;
        Ok(next)
    }

    /// Step until the session closes.
    pub fn run(&mut self, provider: &SharedProvider) -> Result<TransferStats> {
        while self.step(provider)? != ExchangeState::Closed {}
        self.stats.log_summary("exchange");
        Ok(self.stats)
    }
}

impl<D: ExchangeDevice> Drop for ExchangeEngine<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.unlock_memory() {
            tracing::warn!(error = %e, "exchange buffer unlock failed");
        }
    }
}

type DeviceOpener<D> = Box<dyn FnOnce() -> Result<D> + Send>;

#[derive(Default)]
struct StopState {
    stopping: Arc<AtomicBool>,
    waker: Mutex<Option<StopHook>>,
}

impl StopState {
    fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(wake) = self.waker.lock().as_ref() {
            wake();
        }
    }
}

/// Serves a provider through a driver exchange device.
pub struct ExchangeTransport<D> {
    identity: String,
    buffer_size: usize,
    open: DeviceOpener<D>,
    stop: Arc<StopState>,
}

impl<D: ExchangeDevice + 'static> ExchangeTransport<D> {
    /// `open` runs on the service worker; its failure is a setup failure.
    pub fn new(identity: impl Into<String>, open: impl FnOnce() -> Result<D> + Send + 'static) -> Self {
        Self {
            identity: identity.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            open: Box::new(open),
            stop: Arc::new(StopState::default()),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl<D: ExchangeDevice + 'static> Transport for ExchangeTransport<D> {
    fn proxy_identity(&self) -> String {
        self.identity.clone()
    }

    fn proxy_flags(&self) -> ProxyFlags {
        ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_EXCHANGE
    }

    fn stop_hook(&self) -> StopHook {
        let stop = Arc::clone(&self.stop);
        Arc::new(move || stop.request_stop())
    }

    fn run(self: Box<Self>, ctx: ServeContext) -> Result<TransferStats> {
        let device = (self.open)()?;
        *self.stop.waker.lock() = Some(device.waker());
        let mut engine =
            ExchangeEngine::new(device, self.buffer_size, Arc::clone(&self.stop.stopping))?;
        tracing::debug!(identity = %self.identity, size = self.buffer_size, "exchange device ready");
        ctx.ready();
        engine.run(ctx.provider())
    }
}

#[cfg(windows)]
pub use driver::DriverDevice;

#[cfg(windows)]
mod driver {
    //! Exchange device provided by the proxy driver.

    use std::ffi::c_void;

    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Foundation::{
        CloseHandle, ERROR_ACCESS_DENIED, ERROR_DEV_NOT_EXIST, ERROR_FILE_EXISTS,
        ERROR_FILE_NOT_FOUND, ERROR_INSUFFICIENT_BUFFER, ERROR_IO_PENDING, ERROR_PATH_NOT_FOUND,
        GENERIC_READ, GENERIC_WRITE, HANDLE, WAIT_OBJECT_0,
    };
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, CREATE_NEW, FILE_FLAG_OVERLAPPED, FILE_SHARE_NONE,
    };
    use windows::Win32::System::Threading::{
        CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
    };
    use windows::Win32::System::IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED};

    use super::{Completion, ExchangeDevice, Submission};
    use crate::error::{Error, Result};
    use crate::service::StopHook;
    use crate::sys::PageBuffer;

    const FILE_DEVICE_UNKNOWN: u32 = 0x22;
    const METHOD_OUT_DIRECT: u32 = 2;
    const METHOD_NEITHER: u32 = 3;
    const FILE_READ_WRITE_ACCESS: u32 = 3;

    const fn ctl_code(function: u32, method: u32) -> u32 {
        (FILE_DEVICE_UNKNOWN << 16) | (FILE_READ_WRITE_ACCESS << 14) | (function << 2) | method
    }

    /// Exchange a response for the next request.
    pub const IOCTL_EXCHANGE_IO: u32 = ctl_code(0x800, METHOD_NEITHER);
    /// Lock the exchange buffer into the driver's view.
    pub const IOCTL_LOCK_MEMORY: u32 = ctl_code(0x801, METHOD_OUT_DIRECT);

    struct Event(HANDLE);

    // Safety: event handles may be used from any thread.
    unsafe impl Send for Event {}
    unsafe impl Sync for Event {}

    impl Event {
        fn new(manual_reset: bool) -> Result<Self> {
            let handle = unsafe { CreateEventW(None, manual_reset, false, PCWSTR::null()) }?;
            Ok(Self(handle))
        }
    }

    impl Drop for Event {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Private device instance of the proxy driver.
    pub struct DriverDevice {
        handle: HANDLE,
        lock_overlapped: Box<OVERLAPPED>,
        _lock_event: Event,
        lock_outstanding: bool,
        exchange_overlapped: Box<OVERLAPPED>,
        exchange_event: Event,
        exchange_outstanding: bool,
        wake: std::sync::Arc<Event>,
    }

    // Safety: the device handle and overlapped blocks are owned by this value.
    unsafe impl Send for DriverDevice {}

    impl DriverDevice {
        /// Create the device instance `\\.\DevIoDrv\<name>`.
        pub fn open(name: &str) -> Result<Self> {
            crate::sys::validate_name(name)?;
            let path = HSTRING::from(format!(r"\\.\DevIoDrv\{name}"));
            let handle = unsafe {
                CreateFileW(
                    &path,
                    GENERIC_READ.0 | GENERIC_WRITE.0,
                    FILE_SHARE_NONE,
                    None,
                    CREATE_NEW,
                    FILE_FLAG_OVERLAPPED,
                    HANDLE::default(),
                )
            }
            .map_err(|e| {
                let code = e.code();
                if code == ERROR_FILE_EXISTS.to_hresult() {
                    Error::NameInUse(name.to_string())
                } else if code == ERROR_FILE_NOT_FOUND.to_hresult()
                    || code == ERROR_PATH_NOT_FOUND.to_hresult()
                {
                    Error::DriverUnreachable(format!("{}: {e}", path))
                } else if code == ERROR_ACCESS_DENIED.to_hresult() {
                    Error::PermissionDenied(format!("{}: {e}", path))
                } else {
                    Error::Windows(e)
                }
            })?;

            let lock_event = Event::new(true)?;
            let exchange_event = Event::new(true)?;
            let lock_overlapped = Box::new(OVERLAPPED {
                hEvent: lock_event.0,
                ..Default::default()
            });
            let exchange_overlapped = Box::new(OVERLAPPED {
                hEvent: exchange_event.0,
                ..Default::default()
            });
            Ok(Self {
                handle,
                lock_overlapped,
                _lock_event: lock_event,
                lock_outstanding: false,
                exchange_overlapped,
                exchange_event,
                exchange_outstanding: false,
                wake: std::sync::Arc::new(Event::new(false)?),
            })
        }

        fn classify(&self, err: &windows::core::Error) -> Option<Completion> {
            let code = err.code();
            if code == ERROR_INSUFFICIENT_BUFFER.to_hresult() {
                Some(Completion::BufferTooSmall)
            } else if code == ERROR_DEV_NOT_EXIST.to_hresult() {
                Some(Completion::DeviceGone)
            } else {
                None
            }
        }
    }

    impl ExchangeDevice for DriverDevice {
        fn lock_memory(&mut self, buffer: &mut PageBuffer) -> Result<()> {
            let slice = buffer.as_mut_slice();
            let result = unsafe {
                DeviceIoControl(
                    self.handle,
                    IOCTL_LOCK_MEMORY,
                    None,
                    0,
                    Some(slice.as_mut_ptr() as *mut c_void),
                    slice.len() as u32,
                    None,
                    Some(&mut *self.lock_overlapped as *mut OVERLAPPED),
                )
            };
            match result {
                Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                    self.lock_outstanding = true;
                    Ok(())
                }
                Err(e) => Err(e.into()),
                Ok(()) => Err(Error::protocol("driver completed the memory lock immediately")),
            }
        }

        fn unlock_memory(&mut self) -> Result<()> {
            if !self.lock_outstanding {
                return Ok(());
            }
            self.lock_outstanding = false;
            let mut transferred = 0u32;
            unsafe {
                let _ = CancelIoEx(self.handle, Some(&*self.lock_overlapped as *const OVERLAPPED));
                // The lock ends cancelled; only its completion matters here.
                let _ = GetOverlappedResult(self.handle, &*self.lock_overlapped, &mut transferred, true);
            }
            Ok(())
        }

        fn submit(&mut self, buffer: &mut PageBuffer) -> Result<Submission> {
            let slice = buffer.as_mut_slice();
            let result = unsafe {
                DeviceIoControl(
                    self.handle,
                    IOCTL_EXCHANGE_IO,
                    Some(slice.as_ptr() as *const c_void),
                    slice.len() as u32,
                    Some(slice.as_mut_ptr() as *mut c_void),
                    slice.len() as u32,
                    None,
                    Some(&mut *self.exchange_overlapped as *mut OVERLAPPED),
                )
            };
            match result {
                Ok(()) => Ok(Submission::Completed(Completion::Done)),
                Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                    self.exchange_outstanding = true;
                    Ok(Submission::Pending)
                }
                Err(e) => match self.classify(&e) {
                    Some(c) => Ok(Submission::Completed(c)),
                    None => Err(e.into()),
                },
            }
        }

        fn complete(&mut self, _buffer: &mut PageBuffer) -> Result<Completion> {
            let handles = [self.exchange_event.0, self.wake.0];
            let rc = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };
            if rc.0 == WAIT_OBJECT_0.0 + 1 {
                return Ok(Completion::Interrupted);
            }
            if rc != WAIT_OBJECT_0 {
                return Err(std::io::Error::last_os_error().into());
            }
            self.exchange_outstanding = false;
            let mut transferred = 0u32;
            let result = unsafe {
                GetOverlappedResult(self.handle, &*self.exchange_overlapped, &mut transferred, false)
            };
            match result {
                Ok(()) => Ok(Completion::Done),
                Err(e) => self.classify(&e).ok_or_else(|| e.into()),
            }
        }

        fn waker(&self) -> StopHook {
            let wake = std::sync::Arc::clone(&self.wake);
            std::sync::Arc::new(move || unsafe {
                let _ = SetEvent(wake.0);
            })
        }
    }

    impl Drop for DriverDevice {
        fn drop(&mut self) {
            // The kernel writes through the OVERLAPPEDs and the caller's buffer
            // until a cancelled operation has completed.
            if self.exchange_outstanding {
                self.exchange_outstanding = false;
                let mut transferred = 0u32;
                unsafe {
                    let _ = CancelIoEx(
                        self.handle,
                        Some(&*self.exchange_overlapped as *const OVERLAPPED),
                    );
                    let _ = GetOverlappedResult(
                        self.handle,
                        &*self.exchange_overlapped,
                        &mut transferred,
                        true,
                    );
                }
            }
            let _ = self.unlock_memory();
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
