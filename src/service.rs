//! Service lifecycle shared by all transports.
//!
//! A [`DevioService`] binds one provider to one transport. It runs the
//! transport's dispatch loop on a dedicated worker thread and coordinates
//! with the driver control plane to mount and dismount the kernel device.
//!
//! # Example
//!
//! ```rust,no_run
//! use devio::provider::{MemoryProvider, SharedProvider};
//! use devio::service::DevioService;
//! use devio::transport::tcp::TcpTransport;
//!
//! let provider = SharedProvider::new(MemoryProvider::with_capacity_mb(16));
//! let mut service = DevioService::builder()
//!     .provider(provider)
//!     .transport(TcpTransport::new("127.0.0.1:0"))
//!     .build()?;
//!
//! service.start()?;
//! // ... mount through a control plane, serve, then:
//! service.dismount()?;
//! # Ok::<(), devio::Error>(())
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::builder::ServiceBuilder;
use crate::control::{ControlPlane, DeviceRequest, ProxyFlags};
use crate::dispatch::TransferStats;
use crate::error::{ControlError, Error, Result};
use crate::provider::{SharedProvider, StorageProvider};

/// The state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created but not started.
    Created,
    /// Transport setup succeeded.
    Ready,
    /// Transport setup failed; the worker has exited or is exiting.
    InitFailed,
    /// Dispatch loop running.
    Serving,
    /// Teardown in progress.
    Stopping,
    /// Worker has exited.
    Shutdown,
}

impl ServiceState {
    fn rank(self) -> u8 {
        match self {
            ServiceState::Created => 0,
            ServiceState::Ready | ServiceState::InitFailed => 1,
            ServiceState::Serving => 2,
            ServiceState::Stopping => 3,
            ServiceState::Shutdown => 4,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "created"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::InitFailed => write!(f, "init-failed"),
            ServiceState::Serving => write!(f, "serving"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Lifecycle notifications. Each fires at most once per service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Ready,
    InitFailed(String),
    Stopping,
    Shutdown,
    /// The dispatch loop ended with an error or a panic.
    UnhandledFault(String),
}

/// Cooperative stop request for a running transport. Safe to call from any
/// thread, any number of times.
pub type StopHook = Arc<dyn Fn() + Send + Sync>;

/// A transport engine driven by [`DevioService`].
pub trait Transport: Send + 'static {
    /// Name or address the driver uses to reach this transport.
    fn proxy_identity(&self) -> String;

    /// Device flags selecting this transport type.
    fn proxy_flags(&self) -> ProxyFlags;

    /// Hook that makes `run` return as soon as it can.
    fn stop_hook(&self) -> StopHook;

    /// Set up, call [`ServeContext::ready`], then serve until the peer
    /// closes or a stop is requested.
    ///
    /// An error before `ready` is a setup failure. An error after it is a
    /// fault.
    fn run(self: Box<Self>, ctx: ServeContext) -> Result<TransferStats>;
}

type Listener = Box<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Configuration for a [`DevioService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long `start` waits for the transport to become ready.
    pub start_timeout: Duration,
    /// Extra removal attempts while the device reports access denied.
    pub dismount_retries: u32,
    pub dismount_retry_interval: Duration,
    /// Remove the kernel device if the dispatch loop faults.
    pub force_removal_on_crash: bool,
    /// Close the provider when the worker exits.
    pub owns_provider: bool,
    pub image_offset: u64,
    /// Sector size reported to the control plane; the provider's if unset.
    pub sector_size: Option<u32>,
    pub read_only: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            dismount_retries: 40,
            dismount_retry_interval: Duration::from_millis(100),
            force_removal_on_crash: true,
            owns_provider: true,
            image_offset: 0,
            sector_size: None,
            read_only: false,
        }
    }
}

struct Shared {
    state: Mutex<ServiceState>,
    changed: Condvar,
    watch: watch::Sender<ServiceState>,
    listeners: Mutex<Vec<Listener>>,
    identity: Mutex<String>,
    init_error: Mutex<Option<Error>>,
    device: Mutex<Option<u32>>,
    control: Mutex<Option<Arc<dyn ControlPlane>>>,
    config: ServiceConfig,
}

impl Shared {
    fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Move forward to `to`. Returns false (and emits nothing) if the service
    /// is already there or past it.
    fn transition(&self, to: ServiceState) -> bool {
        {
            let mut state = self.state.lock();
            if to.rank() <= state.rank() {
                return false;
            }
            tracing::debug!(from = %*state, to = %to, "service state");
            *state = to;
            self.changed.notify_all();
        }
        self.watch.send_replace(to);
        true
    }

    fn emit(&self, event: ServiceEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
    }

    /// Remove the mounted device after a fault, if policy allows.
    fn force_remove(&self) {
        if !self.config.force_removal_on_crash {
            return;
        }
        let Some(device) = *self.device.lock() else {
            return;
        };
        let Some(control) = self.control.lock().clone() else {
            return;
        };
        match control.remove_device(device) {
            Ok(()) | Err(ControlError::NotFound) => {
                tracing::warn!(device, "device force-removed after fault");
                *self.device.lock() = None;
            }
            Err(e) => tracing::error!(device, error = %e, "force removal failed"),
        }
    }
}

/// Handed to [`Transport::run`].
pub struct ServeContext {
    shared: Arc<Shared>,
    provider: Arc<SharedProvider>,
}

impl ServeContext {
    pub fn provider(&self) -> &Arc<SharedProvider> {
        &self.provider
    }

    /// Replace the identity reported to the control plane, e.g. once a
    /// listening address is known. Call before [`ServeContext::ready`].
    pub fn publish_identity(&self, identity: impl Into<String>) {
        *self.shared.identity.lock() = identity.into();
    }

    /// Signal that setup succeeded and serving begins.
    pub fn ready(&self) {
        if self.shared.transition(ServiceState::Ready) {
            tracing::info!(identity = %self.shared.identity.lock(), "service ready");
            self.shared.emit(ServiceEvent::Ready);
        }
        self.shared.transition(ServiceState::Serving);
    }

    /// Whether the service has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.shared.state().rank() >= ServiceState::Stopping.rank()
    }
}

/// Block-proxy server bound to one provider and one transport.
pub struct DevioService {
    shared: Arc<Shared>,
    provider: Arc<SharedProvider>,
    transport: Option<Box<dyn Transport>>,
    flags: ProxyFlags,
    stop: StopHook,
    worker: Option<thread::JoinHandle<()>>,
}

impl DevioService {
    /// Create a new service builder.
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub fn new(
        provider: Arc<SharedProvider>,
        transport: Box<dyn Transport>,
        config: ServiceConfig,
    ) -> Self {
        let (watch, _) = watch::channel(ServiceState::Created);
        let shared = Arc::new(Shared {
            state: Mutex::new(ServiceState::Created),
            changed: Condvar::new(),
            watch,
            listeners: Mutex::new(Vec::new()),
            identity: Mutex::new(transport.proxy_identity()),
            init_error: Mutex::new(None),
            device: Mutex::new(None),
            control: Mutex::new(None),
            config,
        });
        Self {
            flags: transport.proxy_flags(),
            stop: transport.stop_hook(),
            transport: Some(transport),
            shared,
            provider,
            worker: None,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    /// Observe state changes.
    pub fn state_watch(&self) -> watch::Receiver<ServiceState> {
        self.shared.watch.subscribe()
    }

    /// Wait until the worker has exited.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.state_watch();
        let _ = rx.wait_for(|state| *state == ServiceState::Shutdown).await;
    }

    /// Register a lifecycle listener.
    pub fn subscribe(&self, listener: impl Fn(&ServiceEvent) + Send + Sync + 'static) {
        self.shared.listeners.lock().push(Box::new(listener));
    }

    pub fn provider(&self) -> &Arc<SharedProvider> {
        &self.provider
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    /// Name or address the driver connects to.
    pub fn proxy_identity(&self) -> String {
        self.shared.identity.lock().clone()
    }

    pub fn proxy_flags(&self) -> ProxyFlags {
        self.flags
    }

    /// Device number while mounted.
    pub fn device_number(&self) -> Option<u32> {
        *self.shared.device.lock()
    }

    pub fn is_serving(&self) -> bool {
        self.state() == ServiceState::Serving
    }

    /// Launch the dispatch loop and wait for it to become ready.
    ///
    /// Setup failures are returned as the error the transport reported.
    pub fn start(&mut self) -> Result<()> {
        let transport = match (self.state(), self.transport.take()) {
            (ServiceState::Created, Some(t)) => t,
            (state, transport) => {
                self.transport = transport;
                return Err(Error::InvalidState {
                    expected: ServiceState::Created.to_string(),
                    actual: state.to_string(),
                });
            }
        };

        let ctx = ServeContext {
            shared: Arc::clone(&self.shared),
            provider: Arc::clone(&self.provider),
        };
        let shared = Arc::clone(&self.shared);
        let provider = Arc::clone(&self.provider);
        let worker = thread::Builder::new()
            .name(format!("devio-{}", self.proxy_identity()))
            .spawn(move || worker_main(transport, ctx, shared, provider))?;
        self.worker = Some(worker);

        let timeout = self.shared.config.start_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, ServiceState::Created | ServiceState::Ready) {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let reached = *state;
        drop(state);

        match reached {
            ServiceState::Created | ServiceState::Ready => {
                tracing::error!(?timeout, "transport did not become ready");
                (self.stop)();
                Err(Error::StartTimeout(timeout))
            }
            ServiceState::InitFailed => {
                self.join();
                Err(self
                    .shared
                    .init_error
                    .lock()
                    .take()
                    .unwrap_or_else(|| Error::InitFailed("transport setup failed".into())))
            }
            ServiceState::Serving => Ok(()),
            _ => {
                self.join();
                Err(Error::NotServing)
            }
        }
    }

    /// Ask the control plane for a kernel device backed by this service.
    ///
    /// On failure the service is stopped.
    pub fn mount(&mut self, control: Arc<dyn ControlPlane>) -> Result<u32> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }
        let mut flags = self.flags;
        if self.shared.config.read_only || !self.provider.can_write() {
            flags = flags | ProxyFlags::READ_ONLY;
        }
        let request = DeviceRequest {
            identity: self.proxy_identity(),
            flags,
            size: self.provider.length(),
            sector_size: self
                .shared
                .config
                .sector_size
                .unwrap_or_else(|| self.provider.sector_size()),
            image_offset: self.shared.config.image_offset,
        };

        match control.create_device(&request) {
            Ok(device) => {
                tracing::info!(device, identity = %request.identity, %flags, "device created");
                *self.shared.control.lock() = Some(control);
                *self.shared.device.lock() = Some(device);
                Ok(device)
            }
            Err(e) => {
                tracing::error!(identity = %request.identity, error = %e, "device creation failed");
                self.stop();
                Err(e.into())
            }
        }
    }

    /// Remove the device (if mounted), stop the loop and wait for the worker.
    pub fn dismount(&mut self) -> Result<()> {
        if self.shared.transition(ServiceState::Stopping) {
            self.shared.emit(ServiceEvent::Stopping);
        }

        let device = *self.shared.device.lock();
        let control = self.shared.control.lock().clone();
        let mut outcome = Ok(());
        if let (Some(device), Some(control)) = (device, control) {
            outcome = self.remove_device(control.as_ref(), device);
            if outcome.is_ok() {
                *self.shared.device.lock() = None;
            }
        }

        (self.stop)();
        self.join();
        outcome
    }

    fn remove_device(&self, control: &dyn ControlPlane, device: u32) -> Result<()> {
        let config = &self.shared.config;
        let mut attempt = 0;
        loop {
            match control.remove_device(device) {
                Ok(()) => {
                    tracing::info!(device, "device removed");
                    return Ok(());
                }
                Err(ControlError::NotFound) => {
                    tracing::info!(device, "device already gone, stopping transport");
                    (self.stop)();
                    return Ok(());
                }
                Err(ControlError::AccessDenied) if attempt < config.dismount_retries => {
                    attempt += 1;
                    tracing::debug!(device, attempt, "device busy, retrying removal");
                    thread::sleep(config.dismount_retry_interval);
                }
                Err(e) => {
                    tracing::warn!(device, attempt, error = %e, "device removal failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Stop the loop without touching the control plane.
    pub fn stop(&mut self) {
        if self.shared.transition(ServiceState::Stopping) {
            self.shared.emit(ServiceEvent::Stopping);
        }
        (self.stop)();
        self.join();
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("service worker panicked outside the dispatch loop");
            }
        }
    }
}

impl Drop for DevioService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for DevioService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevioService")
            .field("state", &self.state())
            .field("identity", &self.proxy_identity())
            .field("flags", &self.flags)
            .field("device", &self.device_number())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_main(
    transport: Box<dyn Transport>,
    ctx: ServeContext,
    shared: Arc<Shared>,
    provider: Arc<SharedProvider>,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| transport.run(ctx)));
    let was_ready = shared.state().rank() >= ServiceState::Serving.rank();

    let failure = match result {
        Ok(Ok(stats)) => {
            tracing::debug!(?stats, "dispatch loop finished");
            None
        }
        Ok(Err(e)) => Some(e),
        Err(payload) => Some(Error::WorkerPanicked(panic_message(payload.as_ref()))),
    };

    if let Some(error) = failure {
        if was_ready {
            let message = error.to_string();
            tracing::error!(error = %message, "dispatch loop fault");
            shared.emit(ServiceEvent::UnhandledFault(message));
            shared.force_remove();
        } else {
            let message = error.to_string();
            tracing::error!(error = %message, "transport setup failed");
            *shared.init_error.lock() = Some(error);
            if shared.transition(ServiceState::InitFailed) {
                shared.emit(ServiceEvent::InitFailed(message));
            }
        }
    }

    if shared.transition(ServiceState::Stopping) {
        shared.emit(ServiceEvent::Stopping);
    }
    if shared.config.owns_provider {
        provider.close();
    }
    if shared.transition(ServiceState::Shutdown) {
        tracing::info!("service shut down");
        shared.emit(ServiceEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Transport that becomes ready (or fails) and then idles until stopped.
    struct IdleTransport {
        fail_setup: bool,
        exit_before_ready: bool,
        fault: bool,
        fault_trigger: Option<Arc<AtomicBool>>,
        stop: Arc<AtomicBool>,
    }

    impl IdleTransport {
        fn new() -> Self {
            Self {
                fail_setup: false,
                exit_before_ready: false,
                fault: false,
                fault_trigger: None,
                stop: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Transport for IdleTransport {
        fn proxy_identity(&self) -> String {
            "idle".into()
        }

        fn proxy_flags(&self) -> ProxyFlags {
            ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_SHM
        }

        fn stop_hook(&self) -> StopHook {
            let stop = Arc::clone(&self.stop);
            Arc::new(move || stop.store(true, Ordering::SeqCst))
        }

        fn run(self: Box<Self>, ctx: ServeContext) -> Result<TransferStats> {
            if self.fail_setup {
                return Err(Error::NameInUse("idle".into()));
            }
            if self.exit_before_ready {
                return Ok(TransferStats::default());
            }
            ctx.ready();
            if self.fault {
                panic!("dispatch exploded");
            }
            while !self.stop.load(Ordering::SeqCst) {
                if let Some(trigger) = &self.fault_trigger {
                    if trigger.load(Ordering::SeqCst) {
                        return Err(Error::protocol("unknown request"));
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
            Ok(TransferStats::default())
        }
    }

    /// Control plane answering removal with a scripted sequence.
    struct ScriptedControl {
        removals: Mutex<Vec<std::result::Result<(), ControlError>>>,
        remove_calls: AtomicU32,
        fail_create: bool,
    }

    impl ScriptedControl {
        fn new(removals: Vec<std::result::Result<(), ControlError>>) -> Arc<Self> {
            Arc::new(Self {
                removals: Mutex::new(removals),
                remove_calls: AtomicU32::new(0),
                fail_create: false,
            })
        }
    }

    impl ControlPlane for ScriptedControl {
        fn create_device(&self, _request: &DeviceRequest) -> std::result::Result<u32, ControlError> {
            if self.fail_create {
                Err(ControlError::Failed("no driver".into()))
            } else {
                Ok(3)
            }
        }

        fn query_device(&self, _device: u32) -> std::result::Result<crate::control::DeviceInfo, ControlError> {
            Err(ControlError::NotFound)
        }

        fn remove_device(&self, _device: u32) -> std::result::Result<(), ControlError> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.removals.lock();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    fn service(transport: IdleTransport) -> DevioService {
        let config = ServiceConfig {
            start_timeout: Duration::from_secs(5),
            dismount_retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        DevioService::new(
            SharedProvider::new(MemoryProvider::new(4096)),
            Box::new(transport),
            config,
        )
    }

    fn record_events(service: &DevioService) -> Arc<Mutex<Vec<ServiceEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        service.subscribe(move |e| sink.lock().push(e.clone()));
        events
    }

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.start_timeout, Duration::from_secs(30));
        assert_eq!(config.dismount_retries, 40);
        assert_eq!(config.dismount_retry_interval, Duration::from_millis(100));
        assert!(config.force_removal_on_crash);
        assert!(config.owns_provider);
    }

    #[test]
    fn test_start_then_stop() {
        let mut svc = service(IdleTransport::new());
        let events = record_events(&svc);
        assert_eq!(svc.state(), ServiceState::Created);

        svc.start().unwrap();
        assert_eq!(svc.state(), ServiceState::Serving);
        assert!(matches!(svc.start(), Err(Error::InvalidState { .. })));

        svc.stop();
        assert_eq!(svc.state(), ServiceState::Shutdown);
        assert!(svc.provider().is_closed());
        assert_eq!(
            *events.lock(),
            vec![ServiceEvent::Ready, ServiceEvent::Stopping, ServiceEvent::Shutdown]
        );
    }

    #[test]
    fn test_setup_failure_surfaces_error() {
        let mut transport = IdleTransport::new();
        transport.fail_setup = true;
        let mut svc = service(transport);
        let events = record_events(&svc);

        assert!(matches!(svc.start(), Err(Error::NameInUse(_))));
        assert!(matches!(events.lock()[0], ServiceEvent::InitFailed(_)));
        assert!(!svc.is_serving());
    }

    #[test]
    fn test_start_reports_loop_that_already_ended() {
        let mut transport = IdleTransport::new();
        transport.exit_before_ready = true;
        let mut svc = service(transport);

        assert!(matches!(svc.start(), Err(Error::NotServing)));
        assert_eq!(svc.state(), ServiceState::Shutdown);
        assert!(svc.provider().is_closed());
    }

    #[test]
    fn test_mount_and_dismount_retries_busy_device() {
        let mut svc = service(IdleTransport::new());
        svc.start().unwrap();

        let control = ScriptedControl::new(vec![
            Err(ControlError::AccessDenied),
            Err(ControlError::AccessDenied),
            Ok(()),
        ]);
        assert_eq!(svc.mount(control.clone()).unwrap(), 3);
        assert_eq!(svc.device_number(), Some(3));

        svc.dismount().unwrap();
        assert_eq!(control.remove_calls.load(Ordering::SeqCst), 3);
        assert_eq!(svc.device_number(), None);
        assert_eq!(svc.state(), ServiceState::Shutdown);
    }

    #[test]
    fn test_dismount_gives_up_after_retries() {
        let mut svc = DevioService::new(
            SharedProvider::new(MemoryProvider::new(4096)),
            Box::new(IdleTransport::new()),
            ServiceConfig {
                dismount_retries: 2,
                dismount_retry_interval: Duration::from_millis(1),
                ..Default::default()
            },
        );
        svc.start().unwrap();
        let control = ScriptedControl::new(vec![Err(ControlError::AccessDenied); 10]);
        svc.mount(control.clone()).unwrap();

        assert!(matches!(
            svc.dismount(),
            Err(Error::Control(ControlError::AccessDenied))
        ));
        assert_eq!(control.remove_calls.load(Ordering::SeqCst), 3);
        // The loop is stopped regardless.
        assert_eq!(svc.state(), ServiceState::Shutdown);
    }

    #[test]
    fn test_mount_failure_stops_service() {
        let mut svc = service(IdleTransport::new());
        svc.start().unwrap();
        let control = Arc::new(ScriptedControl {
            removals: Mutex::new(Vec::new()),
            remove_calls: AtomicU32::new(0),
            fail_create: true,
        });
        assert!(matches!(svc.mount(control), Err(Error::Control(_))));
        assert_eq!(svc.state(), ServiceState::Shutdown);
    }

    #[test]
    fn test_mount_requires_serving() {
        let mut svc = service(IdleTransport::new());
        assert!(matches!(
            svc.mount(ScriptedControl::new(Vec::new())),
            Err(Error::NotServing)
        ));
    }

    #[test]
    fn test_panic_in_loop_is_fault() {
        let mut transport = IdleTransport::new();
        transport.fault = true;
        let mut svc = service(transport);
        let events = record_events(&svc);

        svc.start().unwrap();
        let mut rx = svc.state_watch();
        let deadline = Instant::now() + Duration::from_secs(5);
        while *rx.borrow_and_update() != ServiceState::Shutdown && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        svc.stop();

        let events = events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, ServiceEvent::UnhandledFault(m) if m.contains("dispatch exploded"))));
        assert_eq!(events.iter().filter(|e| **e == ServiceEvent::Shutdown).count(), 1);
    }

    #[test]
    fn test_fault_force_removes_device() {
        let trigger = Arc::new(AtomicBool::new(false));
        let mut transport = IdleTransport::new();
        transport.fault_trigger = Some(Arc::clone(&trigger));
        let mut svc = service(transport);
        svc.start().unwrap();

        let control = ScriptedControl::new(Vec::new());
        svc.mount(control.clone()).unwrap();
        let mut rx = svc.state_watch();
        trigger.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(5);
        while *rx.borrow_and_update() != ServiceState::Shutdown && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(svc.state(), ServiceState::Shutdown);
        assert_eq!(control.remove_calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.device_number(), None);

        // Nothing left to remove.
        svc.dismount().unwrap();
        assert_eq!(control.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_shutdown() {
        let mut svc = service(IdleTransport::new());
        svc.start().unwrap();
        let stop = svc.stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stop();
        });
        tokio::time::timeout(Duration::from_secs(5), svc.wait_shutdown())
            .await
            .unwrap();
        assert_eq!(svc.state(), ServiceState::Shutdown);
    }
}
