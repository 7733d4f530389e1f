//! Block-proxy protocol definitions.
//!
//! Every record is a sequence of little-endian 64-bit words. Buffer-based
//! transports (shared memory, kernel exchange) place the request code at
//! offset 0 of a fixed header area, the request body right after it, and the
//! response over the same bytes; data payloads start at [`HEADER_SIZE`].
//!
//! ```text
//! Buffer layout:
//!   0            8                         HEADER_SIZE              buffer end
//!   | code (u64) | request body / response |  data (max transfer)   |
//! ```
//!
//! The byte-stream transport sends the same words back to back with no
//! header area: `code`, then the request body, then any data.
//!
//! ## Requests and responses
//!
//! ```text
//! INFO   -> InfoResponse  { file_size, required_alignment, flags }
//! READ   ReadRequest  { offset, length }        -> ReadResponse  { error_code, length } + data
//! WRITE  WriteRequest { offset, length } + data -> WriteResponse { error_code, length }
//! SHARED SharedRequest { ... }                  -> SharedResponse { ..., length } + keys
//! CLOSE  (no body, no response)
//! ```

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Size of the header area in buffer-based transports.
pub const HEADER_SIZE: usize = 4096;

/// Offset of the request body (after the request code) within the header.
pub const REQUEST_BODY_OFFSET: usize = 8;

/// Offset of the data area within a transport buffer.
pub const DATA_OFFSET: usize = HEADER_SIZE;

/// Response error code for success.
pub const ERROR_NONE: u64 = 0;

/// Generic response error code for any provider failure.
pub const ERROR_IO: u64 = 1;

/// Bits of [`InfoResponse::flags`].
pub mod flags {
    /// The provider rejects writes.
    pub const READ_ONLY: u64 = 1 << 0;
    /// The provider serves SHARED (persistent reservation) requests.
    pub const SUPPORTS_SHARED: u64 = 1 << 1;
}

/// Request codes.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    Null = 0,
    Info = 1,
    Read = 2,
    Write = 3,
    Connect = 4,
    Close = 5,
    Unmap = 6,
    Zero = 7,
    Scsi = 8,
    Shared = 9,
}

impl TryFrom<u64> for RequestCode {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(RequestCode::Null),
            1 => Ok(RequestCode::Info),
            2 => Ok(RequestCode::Read),
            3 => Ok(RequestCode::Write),
            4 => Ok(RequestCode::Connect),
            5 => Ok(RequestCode::Close),
            6 => Ok(RequestCode::Unmap),
            7 => Ok(RequestCode::Zero),
            8 => Ok(RequestCode::Scsi),
            9 => Ok(RequestCode::Shared),
            other => Err(Error::UnknownRequest(other)),
        }
    }
}

impl std::fmt::Display for RequestCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestCode::Null => "NULL",
            RequestCode::Info => "INFO",
            RequestCode::Read => "READ",
            RequestCode::Write => "WRITE",
            RequestCode::Connect => "CONNECT",
            RequestCode::Close => "CLOSE",
            RequestCode::Unmap => "UNMAP",
            RequestCode::Zero => "ZERO",
            RequestCode::Scsi => "SCSI",
            RequestCode::Shared => "SHARED",
        };
        f.write_str(name)
    }
}

const MAX_WORDS: usize = 16;

/// A fixed-layout record made of 64-bit words.
pub trait WireRecord: Sized {
    /// Number of 64-bit words in the record.
    const WORDS: usize;

    /// Encoded size in bytes.
    const SIZE: usize = Self::WORDS * 8;

    /// Store the record's fields into `words` (exactly `WORDS` long).
    fn store(&self, words: &mut [u64]);

    /// Load the record's fields from `words` (exactly `WORDS` long).
    fn load(words: &[u64]) -> Self;

    /// Encode the record at the start of `buf`.
    fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(Error::protocol("buffer too small for record"));
        }
        let mut words = [0u64; MAX_WORDS];
        self.store(&mut words[..Self::WORDS]);
        for (chunk, word) in buf[..Self::SIZE].chunks_exact_mut(8).zip(&words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Decode the record from the start of `buf`.
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::protocol("buffer too small for record"));
        }
        let mut words = [0u64; MAX_WORDS];
        for (word, chunk) in words.iter_mut().zip(buf[..Self::SIZE].chunks_exact(8)) {
            *word = get_u64(chunk);
        }
        Ok(Self::load(&words[..Self::WORDS]))
    }

    /// Encode the record to bytes.
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        // Cannot fail: the buffer is exactly SIZE bytes.
        let _ = self.encode_into(&mut buf);
        buf
    }

    /// Read the record from a byte stream.
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; MAX_WORDS * 8];
        reader.read_exact(&mut buf[..Self::SIZE])?;
        Self::decode(&buf[..Self::SIZE])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Write the record to a byte stream.
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; MAX_WORDS * 8];
        self.encode_into(&mut buf[..Self::SIZE])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        writer.write_all(&buf[..Self::SIZE])
    }
}

/// Response to INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoResponse {
    pub file_size: u64,
    pub required_alignment: u64,
    pub flags: u64,
}

impl InfoResponse {
    pub fn is_read_only(&self) -> bool {
        self.flags & flags::READ_ONLY != 0
    }

    pub fn supports_shared(&self) -> bool {
        self.flags & flags::SUPPORTS_SHARED != 0
    }
}

impl WireRecord for InfoResponse {
    const WORDS: usize = 3;

    fn store(&self, words: &mut [u64]) {
        words.copy_from_slice(&[self.file_size, self.required_alignment, self.flags]);
    }

    fn load(words: &[u64]) -> Self {
        Self {
            file_size: words[0],
            required_alignment: words[1],
            flags: words[2],
        }
    }
}

/// Body of a READ request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: i64,
    pub length: u64,
}

/// Body of a WRITE request. `length` bytes of data follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub offset: i64,
    pub length: u64,
}

/// Response to READ. `length` bytes of data follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResponse {
    pub error_code: u64,
    pub length: u64,
}

/// Response to WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub error_code: u64,
    pub length: u64,
}

macro_rules! offset_length_record {
    ($ty:ident, $first:ident, $first_ty:ty) => {
        impl WireRecord for $ty {
            const WORDS: usize = 2;

            fn store(&self, words: &mut [u64]) {
                words[0] = self.$first as u64;
                words[1] = self.length;
            }

            fn load(words: &[u64]) -> Self {
                Self {
                    $first: words[0] as $first_ty,
                    length: words[1],
                }
            }
        }
    };
}

offset_length_record!(ReadRequest, offset, i64);
offset_length_record!(WriteRequest, offset, i64);
offset_length_record!(ReadResponse, error_code, u64);
offset_length_record!(WriteResponse, error_code, u64);

impl ReadResponse {
    pub fn success(length: u64) -> Self {
        Self { error_code: ERROR_NONE, length }
    }

    pub fn failure() -> Self {
        Self { error_code: ERROR_IO, length: 0 }
    }
}

impl WriteResponse {
    pub fn success(length: u64) -> Self {
        Self { error_code: ERROR_NONE, length }
    }

    pub fn failure() -> Self {
        Self { error_code: ERROR_IO, length: 0 }
    }
}

/// Body of a SHARED (persistent reservation) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedRequest {
    pub operation: u64,
    pub reserve_scope: u64,
    pub reserve_type: u64,
    pub existing_reservation_key: u64,
    pub current_channel_key: u64,
    pub operation_channel_key: u64,
}

impl WireRecord for SharedRequest {
    const WORDS: usize = 6;

    fn store(&self, words: &mut [u64]) {
        words.copy_from_slice(&[
            self.operation,
            self.reserve_scope,
            self.reserve_type,
            self.existing_reservation_key,
            self.current_channel_key,
            self.operation_channel_key,
        ]);
    }

    fn load(words: &[u64]) -> Self {
        Self {
            operation: words[0],
            reserve_scope: words[1],
            reserve_type: words[2],
            existing_reservation_key: words[3],
            current_channel_key: words[4],
            operation_channel_key: words[5],
        }
    }
}

/// Response to SHARED. `length` bytes of 64-bit registration keys follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedResponse {
    pub error_code: u64,
    pub unique_id: [u64; 2],
    pub channel_key: u64,
    pub generation: u64,
    pub reservation_key: u64,
    pub reservation_scope: u64,
    pub reservation_type: u64,
    pub length: u64,
}

impl WireRecord for SharedResponse {
    const WORDS: usize = 9;

    fn store(&self, words: &mut [u64]) {
        words.copy_from_slice(&[
            self.error_code,
            self.unique_id[0],
            self.unique_id[1],
            self.channel_key,
            self.generation,
            self.reservation_key,
            self.reservation_scope,
            self.reservation_type,
            self.length,
        ]);
    }

    fn load(words: &[u64]) -> Self {
        Self {
            error_code: words[0],
            unique_id: [words[1], words[2]],
            channel_key: words[3],
            generation: words[4],
            reservation_key: words[5],
            reservation_scope: words[6],
            reservation_type: words[7],
            length: words[8],
        }
    }
}

/// Read a little-endian u64 from the first eight bytes of `buf`.
pub fn get_u64(buf: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(word)
}

/// Write `value` as a little-endian u64 into the first eight bytes of `buf`.
pub fn put_u64(buf: &mut [u8], value: u64) {
    buf[..8].copy_from_slice(&value.to_le_bytes());
}

/// Read the request code from a transport buffer header.
pub fn header_request_code(buf: &[u8]) -> u64 {
    get_u64(buf)
}

/// Write a request code into a transport buffer header.
pub fn set_header_request_code(buf: &mut [u8], code: RequestCode) {
    put_u64(buf, code as u64);
}

/// Read a request code from a byte stream.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte. A stream
/// that ends part-way through the code is an error.
pub fn read_request_code<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside request code",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

/// Write a request code to a byte stream.
pub fn write_request_code<W: Write>(writer: &mut W, code: RequestCode) -> io::Result<()> {
    writer.write_all(&(code as u64).to_le_bytes())
}

/// Encode registration keys as little-endian words.
pub fn encode_keys(keys: &[u64], buf: &mut [u8]) -> usize {
    let count = keys.len().min(buf.len() / 8);
    for (chunk, key) in buf.chunks_exact_mut(8).zip(&keys[..count]) {
        chunk.copy_from_slice(&key.to_le_bytes());
    }
    count * 8
}

/// Decode little-endian registration keys.
pub fn decode_keys(buf: &[u8]) -> Vec<u64> {
    buf.chunks_exact(8).map(get_u64).collect()
}
