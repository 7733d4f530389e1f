//! Byte-stream transport.
//!
//! One listening socket, one accepted connection. Requests and responses are
//! sequences of little-endian 64-bit words with no header area: a request
//! code, the request record, then for WRITE the payload. READ responses are
//! followed by their payload.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::ProxyFlags;
use crate::dispatch::TransferStats;
use crate::error::{Error, Result};
use crate::protocol::{
    read_request_code, ReadRequest, ReadResponse, RequestCode, WireRecord, WriteRequest,
    WriteResponse,
};
use crate::provider::{SharedProvider, StorageProvider};
use crate::service::{ServeContext, StopHook, Transport};

/// Largest READ/WRITE payload accepted by default.
pub const DEFAULT_MAX_TRANSFER: usize = 8 * 1024 * 1024;

const OUTPUT_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct StopState {
    stopping: AtomicBool,
    listening: Mutex<Option<SocketAddr>>,
    connection: Mutex<Option<TcpStream>>,
}

impl StopState {
    fn request_stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(conn) = self.connection.lock().as_ref() {
            let _ = conn.shutdown(Shutdown::Both);
            return;
        }
        // Wake a pending accept by connecting to ourselves.
        if let Some(mut addr) = *self.listening.lock() {
            if addr.ip().is_unspecified() {
                addr.set_ip(match addr {
                    SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                    SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
                });
            }
            let _ = TcpStream::connect(addr);
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Serves a provider to a single TCP peer.
pub struct TcpTransport {
    bind: String,
    max_transfer: usize,
    stop: Arc<StopState>,
}

impl TcpTransport {
    /// Listen on `bind` (e.g. `"0.0.0.0:9000"`, or port 0 for any).
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            max_transfer: DEFAULT_MAX_TRANSFER,
            stop: Arc::new(StopState::default()),
        }
    }

    pub fn with_max_transfer(mut self, max_transfer: usize) -> Self {
        self.max_transfer = max_transfer;
        self
    }
}

impl Transport for TcpTransport {
    fn proxy_identity(&self) -> String {
        self.bind.clone()
    }

    fn proxy_flags(&self) -> ProxyFlags {
        ProxyFlags::TYPE_PROXY | ProxyFlags::PROXY_TYPE_TCP
    }

    fn stop_hook(&self) -> StopHook {
        let stop = Arc::clone(&self.stop);
        Arc::new(move || stop.request_stop())
    }

    fn run(self: Box<Self>, ctx: ServeContext) -> Result<TransferStats> {
        let listener = TcpListener::bind(&self.bind)?;
        let local = listener.local_addr()?;
        *self.stop.listening.lock() = Some(local);
        ctx.publish_identity(local.to_string());
        ctx.ready();

        if self.stop.is_stopping() {
            return Ok(TransferStats::default());
        }
        let accepted = listener.accept();
        drop(listener);
        if self.stop.is_stopping() {
            tracing::debug!(%local, "stopped before a peer connected");
            return Ok(TransferStats::default());
        }
        let (stream, peer) = accepted?;
        tracing::info!(%local, %peer, "peer connected");
        let _ = stream.set_nodelay(true);

        *self.stop.connection.lock() = Some(stream.try_clone()?);
        if self.stop.is_stopping() {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(TransferStats::default());
        }

        let result = serve_stream(ctx.provider(), &stream, &stream, self.max_transfer);
        self.stop.connection.lock().take();
        match result {
            Err(Error::Io(e)) if self.stop.is_stopping() => {
                tracing::debug!(error = %e, "connection closed by stop request");
                Ok(TransferStats::default())
            }
            other => other,
        }
    }
}

/// Serve requests from `reader`, writing responses to `writer`, until the
/// peer sends CLOSE or closes the stream.
///
/// SHARED and unknown request codes end the session with an error and
/// nothing is written for them.
pub fn serve_stream<R: Read, W: Write>(
    provider: &SharedProvider,
    reader: R,
    writer: W,
    max_transfer: usize,
) -> Result<TransferStats> {
    let mut reader = BufReader::new(reader);
    let mut out = BufWriter::with_capacity(OUTPUT_BUFFER, writer);
    let mut data = Vec::new();
    let mut stats = TransferStats::default();

    loop {
        let Some(raw) = read_request_code(&mut reader)? else {
            tracing::debug!("peer closed the stream");
            break;
        };
        let code = RequestCode::try_from(raw)?;
        stats.requests += 1;
        tracing::trace!(%code, "request");

        match code {
            RequestCode::Info => provider.info().write_to(&mut out)?,
            RequestCode::Read => {
                let request = ReadRequest::read_from(&mut reader)?;
                stats.record_read(request.length);
                let length = (request.length as usize).min(max_transfer);
                if data.len() < length {
                    data.resize(length, 0);
                }
                match provider.read(&mut data[..length], request.offset) {
                    Ok(n) => {
                        ReadResponse::success(n as u64).write_to(&mut out)?;
                        out.write_all(&data[..n])?;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(offset = request.offset, length, error = %e, "read failed");
                        ReadResponse::failure().write_to(&mut out)?;
                    }
                }
            }
            RequestCode::Write => {
                let request = WriteRequest::read_from(&mut reader)?;
                stats.record_write(request.length);
                if request.length > max_transfer as u64 {
                    return Err(Error::protocol(format!(
                        "write of {} bytes exceeds the {max_transfer} byte limit",
                        request.length
                    )));
                }
                let length = request.length as usize;
                if data.len() < length {
                    data.resize(length, 0);
                }
                reader.read_exact(&mut data[..length])?;
                let response = match provider.write(&data[..length], request.offset) {
                    Ok(n) => WriteResponse::success(n as u64),
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(offset = request.offset, length, error = %e, "write failed");
                        WriteResponse::failure()
                    }
                };
                response.write_to(&mut out)?;
            }
            RequestCode::Close => {
                tracing::debug!("peer requested close");
                break;
            }
            RequestCode::Shared => {
                return Err(Error::protocol("SHARED is not supported on a byte stream"));
            }
            other => return Err(Error::protocol(format!("request {other} not supported"))),
        }
        out.flush()?;
    }

    out.flush()?;
    stats.log_summary("tcp");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{write_request_code, InfoResponse, ERROR_IO};
    use crate::provider::MemoryProvider;
    use std::io::{self, Cursor};

    /// Whether `e` is the kind of error a peer vanishing mid-session produces.
    fn is_disconnect(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        )
    }

    fn serve(provider: &SharedProvider, input: Vec<u8>) -> (Result<TransferStats>, Vec<u8>) {
        let mut output = Vec::new();
        let result = serve_stream(provider, Cursor::new(input), &mut output, 64 * 1024);
        (result, output)
    }

    fn megabyte() -> Arc<SharedProvider> {
        SharedProvider::new(MemoryProvider::with_capacity_mb(1))
    }

    #[test]
    fn test_info_and_clipped_read() {
        let provider = megabyte();
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Info).unwrap();
        write_request_code(&mut input, RequestCode::Read).unwrap();
        ReadRequest {
            offset: 1_048_000,
            length: 8192,
        }
        .write_to(&mut input)
        .unwrap();

        let (result, output) = serve(&provider, input);
        let stats = result.unwrap();
        assert_eq!(stats.requests, 2);

        let mut cursor = Cursor::new(output);
        let info = InfoResponse::read_from(&mut cursor).unwrap();
        assert_eq!(
            info,
            InfoResponse {
                file_size: 1_048_576,
                required_alignment: 1,
                flags: 0
            }
        );
        let read = ReadResponse::read_from(&mut cursor).unwrap();
        assert_eq!(read, ReadResponse::success(576));
        assert_eq!(cursor.get_ref().len() as u64 - cursor.position(), 576);
    }

    #[test]
    fn test_write_then_read() {
        let provider = megabyte();
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Write).unwrap();
        WriteRequest { offset: 100, length: 5 }.write_to(&mut input).unwrap();
        input.extend_from_slice(b"hello");
        write_request_code(&mut input, RequestCode::Read).unwrap();
        ReadRequest { offset: 100, length: 5 }.write_to(&mut input).unwrap();
        write_request_code(&mut input, RequestCode::Close).unwrap();

        let (result, output) = serve(&provider, input);
        result.unwrap();
        let mut cursor = Cursor::new(output);
        assert_eq!(
            WriteResponse::read_from(&mut cursor).unwrap(),
            WriteResponse::success(5)
        );
        assert_eq!(ReadResponse::read_from(&mut cursor).unwrap(), ReadResponse::success(5));
        let mut payload = [0u8; 5];
        cursor.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn test_shared_is_violation_without_response() {
        let provider = megabyte();
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Shared).unwrap();
        input.extend_from_slice(&[0u8; 48]);

        let (result, output) = serve(&provider, input);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert!(output.is_empty());
    }

    #[test]
    fn test_eof_is_orderly() {
        let (result, output) = serve(&megabyte(), Vec::new());
        assert_eq!(result.unwrap().requests, 0);
        assert!(output.is_empty());
    }

    #[test]
    fn test_truncated_request_is_error() {
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Read).unwrap();
        input.extend_from_slice(&[1, 2, 3]);
        let (result, _) = serve(&megabyte(), input);
        match result {
            Err(Error::Io(e)) => assert!(is_disconnect(&e)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_write_is_violation() {
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Write).unwrap();
        WriteRequest {
            offset: 0,
            length: 1 << 20,
        }
        .write_to(&mut input)
        .unwrap();
        let (result, _) = serve(&megabyte(), input);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_read_error_reported() {
        let mut input = Vec::new();
        write_request_code(&mut input, RequestCode::Read).unwrap();
        ReadRequest {
            offset: 2_000_000,
            length: 512,
        }
        .write_to(&mut input)
        .unwrap();
        let (result, output) = serve(&megabyte(), input);
        assert_eq!(result.unwrap().errors, 1);
        let response = ReadResponse::decode(&output).unwrap();
        assert_eq!(response.error_code, ERROR_IO);
        assert_eq!(response.length, 0);
        assert_eq!(output.len(), ReadResponse::SIZE);
    }
}
