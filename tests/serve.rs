//! End-to-end sessions: a service on its worker thread, a peer on the test
//! thread.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use devio::client::{ShmClient, StreamClient};
use devio::protocol::{
    get_u64, put_u64, write_request_code, RequestCode, SharedRequest, HEADER_SIZE,
};
use devio::provider::{
    FakeMbrProvider, MemoryProvider, OffsetProvider, SharedProvider, PREFIX_SIZE,
};
use devio::reservation::{SharedOperation, SharedResponseCode};
use devio::service::StopHook;
use devio::sys::PageBuffer;
use devio::transport::exchange::{Completion, ExchangeDevice, Submission};
use devio::transport::{ExchangeTransport, ShmTransport, TcpTransport};
use devio::{
    ControlError, ControlPlane, DeviceInfo, DeviceRequest, DevioService, Error, ProxyFlags,
    ServiceEvent, ServiceState,
};

fn megabyte() -> Arc<SharedProvider> {
    SharedProvider::new(MemoryProvider::with_capacity_mb(1))
}

fn wait_for(service: &DevioService, state: ServiceState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.state() != state {
        assert!(Instant::now() < deadline, "stuck in {}", service.state());
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn record_events(service: &DevioService) -> Arc<Mutex<Vec<ServiceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    service.subscribe(move |event| sink.lock().push(event.clone()));
    events
}

fn shm_name(tag: &str) -> String {
    format!("dv{}{}", std::process::id(), tag)
}

#[test]
fn test_tcp_session() {
    let mut service = DevioService::builder()
        .provider(megabyte())
        .transport(TcpTransport::new("127.0.0.1:0"))
        .build()
        .unwrap();
    service.start().unwrap();
    assert!(service.is_serving());

    let mut client = StreamClient::connect(service.proxy_identity()).unwrap();
    let info = client.info().unwrap();
    assert_eq!(info.file_size, 1_048_576);
    assert_eq!(info.required_alignment, 1);
    assert_eq!(info.flags, 0);

    assert_eq!(client.read(1_048_000, 8192).unwrap().len(), 576);
    assert_eq!(client.write(4096, b"block proxy").unwrap(), 11);
    assert_eq!(client.read(4096, 11).unwrap(), b"block proxy");
    client.close().unwrap();

    wait_for(&service, ServiceState::Shutdown);
    assert!(service.provider().is_closed());
}

#[test]
fn test_tcp_serves_decorated_volume() {
    // A volume stored 64 KiB into its image, presented as a partitioned disk.
    let mut image = vec![0u8; 128 * 1024];
    image[65536 + 1000..65536 + 1004].copy_from_slice(b"vol!");
    let volume = OffsetProvider::new(MemoryProvider::from_vec(image), 65536).unwrap();
    let disk = FakeMbrProvider::with_signature(volume, 0xD15C_0001).unwrap();

    let mut service = DevioService::builder()
        .provider(SharedProvider::new(disk))
        .transport(TcpTransport::new("127.0.0.1:0"))
        .build()
        .unwrap();
    service.start().unwrap();

    let mut client = StreamClient::connect(service.proxy_identity()).unwrap();
    assert_eq!(client.info().unwrap().file_size, (PREFIX_SIZE + 65536) as u64);

    let mbr = client.read(0, 512).unwrap();
    assert_eq!(&mbr[510..], &[0x55, 0xAA]);
    assert_eq!(&mbr[0x1B8..0x1BC], &0xD15C_0001u32.to_le_bytes());

    let at = (PREFIX_SIZE + 1000) as i64;
    assert_eq!(client.read(at, 4).unwrap(), b"vol!");
    client.close().unwrap();
    wait_for(&service, ServiceState::Shutdown);
}

#[test]
fn test_tcp_shared_request_ends_session() {
    let mut service = DevioService::builder()
        .provider(megabyte())
        .transport(TcpTransport::new("127.0.0.1:0"))
        .build()
        .unwrap();
    let events = record_events(&service);
    service.start().unwrap();

    let mut stream = TcpStream::connect(service.proxy_identity()).unwrap();
    write_request_code(&mut stream, RequestCode::Shared).unwrap();
    stream.write_all(&[0u8; 48]).unwrap();

    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply);
    assert!(reply.is_empty());

    wait_for(&service, ServiceState::Shutdown);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ServiceEvent::UnhandledFault(_))));
}

#[test]
fn test_shm_session() {
    let name = shm_name("s");
    let buffer_size = HEADER_SIZE + 64 * 1024;
    let mut service = DevioService::builder()
        .provider(SharedProvider::new(
            MemoryProvider::with_capacity_mb(1).with_reservations(),
        ))
        .transport(ShmTransport::new(name.clone()).with_buffer_size(buffer_size))
        .build()
        .unwrap();
    service.start().unwrap();
    assert_eq!(
        service.proxy_flags(),
        ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_SHM
    );

    let mut client = ShmClient::open(&name, buffer_size)
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    let info = client.info().unwrap();
    assert_eq!(info.file_size, 1_048_576);
    assert!(info.supports_shared());

    assert_eq!(client.write(0, &[0xAB; 1024]).unwrap(), 1024);
    assert_eq!(client.read(0, 1024).unwrap(), vec![0xAB; 1024]);
    assert_eq!(client.read(1_048_000, 8192).unwrap().len(), 576);

    let register = SharedRequest {
        operation: SharedOperation::Register as u64,
        current_channel_key: 1,
        operation_channel_key: 0x1234,
        ..Default::default()
    };
    let (response, _) = client.shared(&register).unwrap();
    assert_eq!(response.error_code, SharedResponseCode::NoError as u64);

    let read_keys = SharedRequest {
        operation: SharedOperation::ReadKeys as u64,
        current_channel_key: 1,
        ..Default::default()
    };
    let (response, keys) = client.shared(&read_keys).unwrap();
    assert_eq!(response.length, 8);
    assert_eq!(keys, vec![0x1234]);

    client.close().unwrap();
    wait_for(&service, ServiceState::Shutdown);
}

#[test]
fn test_shm_name_claimed_once() {
    let name = shm_name("d");
    let transport = || ShmTransport::new(name.clone()).with_buffer_size(HEADER_SIZE + 4096);

    let mut first = DevioService::builder()
        .provider(megabyte())
        .transport(transport())
        .build()
        .unwrap();
    first.start().unwrap();

    let mut second = DevioService::builder()
        .provider(megabyte())
        .transport(transport())
        .build()
        .unwrap();
    let events = record_events(&second);
    assert!(matches!(second.start(), Err(Error::NameInUse(_))));
    assert_eq!(second.state(), ServiceState::Shutdown);
    assert!(matches!(events.lock()[0], ServiceEvent::InitFailed(_)));

    assert!(first.is_serving());
    let mut client = ShmClient::open(&name, HEADER_SIZE + 4096)
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    assert_eq!(client.info().unwrap().file_size, 1_048_576);
    client.close().unwrap();
    wait_for(&first, ServiceState::Shutdown);
}

#[test]
fn test_stop_without_peer() {
    let mut service = DevioService::builder()
        .provider(megabyte())
        .transport(ShmTransport::new(shm_name("w")).with_buffer_size(HEADER_SIZE + 4096))
        .build()
        .unwrap();
    service.start().unwrap();
    service.stop();
    assert_eq!(service.state(), ServiceState::Shutdown);
}

/// Control plane whose devices vanish on their own before removal.
#[derive(Default)]
struct VanishingControl {
    created: Mutex<Vec<DeviceRequest>>,
    removals: Mutex<u32>,
}

impl ControlPlane for VanishingControl {
    fn create_device(&self, request: &DeviceRequest) -> Result<u32, ControlError> {
        self.created.lock().push(request.clone());
        Ok(7)
    }

    fn query_device(&self, _device_number: u32) -> Result<DeviceInfo, ControlError> {
        Err(ControlError::NotFound)
    }

    fn remove_device(&self, _device_number: u32) -> Result<(), ControlError> {
        *self.removals.lock() += 1;
        Err(ControlError::NotFound)
    }
}

#[test]
fn test_dismount_of_vanished_device() {
    let mut service = DevioService::builder()
        .provider(SharedProvider::new(
            MemoryProvider::with_capacity_mb(1).read_only(),
        ))
        .transport(TcpTransport::new("127.0.0.1:0"))
        .image_offset(512)
        .build()
        .unwrap();
    service.start().unwrap();

    let control = Arc::new(VanishingControl::default());
    assert_eq!(service.mount(control.clone()).unwrap(), 7);
    assert_eq!(service.device_number(), Some(7));
    {
        let created = control.created.lock();
        assert_eq!(created[0].identity, service.proxy_identity());
        assert_eq!(created[0].size, 1_048_576);
        assert_eq!(created[0].image_offset, 512);
        assert!(created[0].flags.contains(ProxyFlags::READ_ONLY));
        assert!(created[0].flags.contains(ProxyFlags::PROXY_TYPE_TCP));
    }

    service.dismount().unwrap();
    assert_eq!(*control.removals.lock(), 1);
    assert_eq!(service.device_number(), None);
    assert_eq!(service.state(), ServiceState::Shutdown);
}

/// Exchange device that plays a peer sending INFO then CLOSE.
struct LoopbackDevice {
    responses: Arc<Mutex<Vec<u64>>>,
    wake: Arc<AtomicBool>,
}

impl ExchangeDevice for LoopbackDevice {
    fn lock_memory(&mut self, _buffer: &mut PageBuffer) -> devio::Result<()> {
        Ok(())
    }

    fn unlock_memory(&mut self) -> devio::Result<()> {
        Ok(())
    }

    fn submit(&mut self, buffer: &mut PageBuffer) -> devio::Result<Submission> {
        let buf = buffer.as_mut_slice();
        self.responses.lock().push(get_u64(buf));
        put_u64(buf, RequestCode::Close as u64);
        Ok(Submission::Completed(Completion::Done))
    }

    fn complete(&mut self, _buffer: &mut PageBuffer) -> devio::Result<Completion> {
        Ok(Completion::Done)
    }

    fn waker(&self) -> StopHook {
        let wake = Arc::clone(&self.wake);
        Arc::new(move || wake.store(true, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn test_exchange_session() {
    let responses = Arc::new(Mutex::new(Vec::new()));
    let device = LoopbackDevice {
        responses: Arc::clone(&responses),
        wake: Arc::new(AtomicBool::new(false)),
    };
    let transport = ExchangeTransport::new("disk9", move || Ok(device)).with_buffer_size(8192);

    let mut service = DevioService::builder()
        .provider(megabyte())
        .transport(transport)
        .build()
        .unwrap();
    service.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), service.wait_shutdown())
        .await
        .unwrap();
    assert_eq!(*responses.lock(), vec![1_048_576]);
    assert!(service.proxy_flags().contains(ProxyFlags::PROXY_TYPE_EXCHANGE));
}

#[test]
fn test_exchange_open_failure_is_setup_failure() {
    let transport = ExchangeTransport::<LoopbackDevice>::new("disk9", || {
        Err(Error::DriverUnreachable("no driver".into()))
    });
    let mut service = DevioService::builder()
        .provider(megabyte())
        .transport(transport)
        .build()
        .unwrap();
    assert!(matches!(service.start(), Err(Error::DriverUnreachable(_))));
}
