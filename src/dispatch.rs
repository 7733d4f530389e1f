//! Request dispatch over a transport buffer.
//!
//! The shared-memory and kernel-exchange transports use the same buffer
//! convention: a request code at offset 0, the request record right after it,
//! and data starting at [`HEADER_SIZE`]. Responses overwrite the header (and
//! for READ the data area) in place.

use crate::error::{Error, Result};
use crate::protocol::{
    encode_keys, header_request_code, ReadRequest, ReadResponse, RequestCode, SharedRequest,
    WireRecord, WriteRequest, WriteResponse, DATA_OFFSET, HEADER_SIZE, REQUEST_BODY_OFFSET,
};
use crate::provider::{SharedProvider, StorageProvider};

/// What the transport should do after a request was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response has been written into the buffer; hand it back to the peer.
    Respond,
    /// The peer asked to close the session.
    Close,
}

/// Per-session transfer counters. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub largest_read: u64,
    pub largest_write: u64,
}

impl TransferStats {
    pub(crate) fn record_read(&mut self, requested: u64) {
        self.reads += 1;
        self.largest_read = self.largest_read.max(requested);
    }

    pub(crate) fn record_write(&mut self, requested: u64) {
        self.writes += 1;
        self.largest_write = self.largest_write.max(requested);
    }

    pub(crate) fn log_summary(&self, transport: &str) {
        tracing::debug!(
            transport,
            requests = self.requests,
            reads = self.reads,
            writes = self.writes,
            errors = self.errors,
            largest_read = self.largest_read,
            largest_write = self.largest_write,
            "session ended"
        );
    }
}

/// Largest READ/WRITE payload a buffer of `buffer_len` bytes can carry.
pub fn max_transfer(buffer_len: usize) -> usize {
    buffer_len.saturating_sub(HEADER_SIZE)
}

/// Handle the request currently held in `buf`.
///
/// Provider failures are reported to the peer as `ERROR_IO` and do not end
/// the session. Unknown or unsupported request codes are protocol violations
/// and are returned as errors.
pub fn dispatch_buffer(
    provider: &SharedProvider,
    buf: &mut [u8],
    stats: &mut TransferStats,
) -> Result<Outcome> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::protocol(format!(
            "transport buffer of {} bytes is smaller than the header",
            buf.len()
        )));
    }
    let max = max_transfer(buf.len());
    let raw = header_request_code(buf);
    let code = RequestCode::try_from(raw)?;
    stats.requests += 1;
    tracing::trace!(%code, "request");

    match code {
        RequestCode::Info => {
            provider.info().encode_into(buf)?;
            Ok(Outcome::Respond)
        }
        RequestCode::Read => {
            let request = ReadRequest::decode(&buf[REQUEST_BODY_OFFSET..])?;
            stats.record_read(request.length);
            let length = (request.length as usize).min(max);
            let response = match provider.read(&mut buf[DATA_OFFSET..DATA_OFFSET + length], request.offset) {
                Ok(n) => ReadResponse::success(n as u64),
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(offset = request.offset, length, error = %e, "read failed");
                    ReadResponse::failure()
                }
            };
            response.encode_into(buf)?;
            Ok(Outcome::Respond)
        }
        RequestCode::Write => {
            let request = WriteRequest::decode(&buf[REQUEST_BODY_OFFSET..])?;
            stats.record_write(request.length);
            let length = (request.length as usize).min(max);
            let response = match provider.write(&buf[DATA_OFFSET..DATA_OFFSET + length], request.offset) {
                Ok(n) => WriteResponse::success(n as u64),
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(offset = request.offset, length, error = %e, "write failed");
                    WriteResponse::failure()
                }
            };
            response.encode_into(buf)?;
            Ok(Outcome::Respond)
        }
        RequestCode::Shared => {
            let request = SharedRequest::decode(&buf[REQUEST_BODY_OFFSET..])?;
            let (mut response, keys) = match provider.shared_keys(&request) {
                Ok(answer) => answer,
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(operation = request.operation, error = %e, "shared request failed");
                    (io_error_shared_response(), Vec::new())
                }
            };
            response.length = encode_keys(&keys, &mut buf[DATA_OFFSET..DATA_OFFSET + max]) as u64;
            response.encode_into(buf)?;
            Ok(Outcome::Respond)
        }
        RequestCode::Close => Ok(Outcome::Close),
        other => Err(Error::protocol(format!("request {other} not supported"))),
    }
}

fn io_error_shared_response() -> crate::protocol::SharedResponse {
    crate::protocol::SharedResponse {
        error_code: crate::reservation::SharedResponseCode::IoError as u64,
        ..Default::default()
    }
}
