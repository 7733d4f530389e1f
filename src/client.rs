//! Peer side of the byte-stream and shared-memory transports.
//!
//! These play the role the kernel driver plays in production: they send
//! requests to a running service and decode its responses. Useful for tools
//! that read an exported image directly and for exercising a server.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{
    decode_keys, set_header_request_code, write_request_code, InfoResponse, ReadRequest,
    ReadResponse, RequestCode, SharedRequest, SharedResponse, WireRecord, WriteRequest,
    WriteResponse, DATA_OFFSET, ERROR_NONE, REQUEST_BODY_OFFSET,
};
use crate::sys::{NamedSignal, ObjectNames, SharedSection};

fn check_read(response: ReadResponse) -> Result<usize> {
    if response.error_code != ERROR_NONE {
        return Err(std::io::Error::other(format!(
            "server reported read error {}",
            response.error_code
        ))
        .into());
    }
    Ok(response.length as usize)
}

fn check_write(response: WriteResponse) -> Result<u64> {
    if response.error_code != ERROR_NONE {
        return Err(std::io::Error::other(format!(
            "server reported write error {}",
            response.error_code
        ))
        .into());
    }
    Ok(response.length)
}

/// Client for a [`TcpTransport`](crate::transport::TcpTransport) server.
pub struct StreamClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl StreamClient {
    /// Connect to a server.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    /// Ask for the device description.
    pub fn info(&mut self) -> Result<InfoResponse> {
        write_request_code(&mut self.writer, RequestCode::Info)?;
        self.writer.flush()?;
        Ok(InfoResponse::read_from(&mut self.reader)?)
    }

    /// Read up to `length` bytes at `offset`. Returns fewer bytes at the end
    /// of the device.
    pub fn read(&mut self, offset: i64, length: usize) -> Result<Vec<u8>> {
        write_request_code(&mut self.writer, RequestCode::Read)?;
        ReadRequest {
            offset,
            length: length as u64,
        }
        .write_to(&mut self.writer)?;
        self.writer.flush()?;

        let n = check_read(ReadResponse::read_from(&mut self.reader)?)?;
        let mut data = vec![0u8; n];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Write `data` at `offset`. Returns the number of bytes written.
    pub fn write(&mut self, offset: i64, data: &[u8]) -> Result<u64> {
        write_request_code(&mut self.writer, RequestCode::Write)?;
        WriteRequest {
            offset,
            length: data.len() as u64,
        }
        .write_to(&mut self.writer)?;
        self.writer.write_all(data)?;
        self.writer.flush()?;
        check_write(WriteResponse::read_from(&mut self.reader)?)
    }

    /// End the session.
    pub fn close(mut self) -> Result<()> {
        write_request_code(&mut self.writer, RequestCode::Close)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Client for a [`ShmTransport`](crate::transport::ShmTransport) server.
pub struct ShmClient {
    section: SharedSection,
    request: NamedSignal,
    response: NamedSignal,
    timeout: Duration,
}

impl ShmClient {
    /// Open the endpoint named `name` with a section of `buffer_size` bytes.
    pub fn open(name: &str, buffer_size: usize) -> Result<Self> {
        if buffer_size <= DATA_OFFSET {
            return Err(Error::InvalidConfig(format!(
                "shared buffer of {buffer_size} bytes leaves no room for data"
            )));
        }
        let names = ObjectNames::new(name)?;
        Ok(Self {
            section: SharedSection::open(names.section(), buffer_size)?,
            request: NamedSignal::open(&names.request())?,
            response: NamedSignal::open(&names.response())?,
            timeout: Duration::from_secs(30),
        })
    }

    /// How long to wait for each response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn data_capacity(&self) -> usize {
        self.section.len().saturating_sub(DATA_OFFSET)
    }

    fn call(&mut self, code: RequestCode) -> Result<()> {
        set_header_request_code(self.section.as_mut_slice(), code);
        self.request.post()?;
        if !self.response.wait_timeout(self.timeout)? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response to {code} within {:?}", self.timeout),
            )
            .into());
        }
        Ok(())
    }

    pub fn info(&mut self) -> Result<InfoResponse> {
        self.call(RequestCode::Info)?;
        InfoResponse::decode(self.section.as_slice())
    }

    /// Read up to `length` bytes at `offset`, at most one buffer's worth.
    pub fn read(&mut self, offset: i64, length: usize) -> Result<Vec<u8>> {
        let length = length.min(self.data_capacity());
        ReadRequest {
            offset,
            length: length as u64,
        }
        .encode_into(&mut self.section.as_mut_slice()[REQUEST_BODY_OFFSET..])?;
        self.call(RequestCode::Read)?;

        let n = check_read(ReadResponse::decode(self.section.as_slice())?)?.min(length);
        Ok(self.section.as_slice()[DATA_OFFSET..DATA_OFFSET + n].to_vec())
    }

    pub fn write(&mut self, offset: i64, data: &[u8]) -> Result<u64> {
        if data.len() > self.data_capacity() {
            return Err(Error::unsupported(format!(
                "write of {} bytes exceeds the shared buffer",
                data.len()
            )));
        }
        let buf = self.section.as_mut_slice();
        buf[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
        WriteRequest {
            offset,
            length: data.len() as u64,
        }
        .encode_into(&mut buf[REQUEST_BODY_OFFSET..])?;
        self.call(RequestCode::Write)?;
        check_write(WriteResponse::decode(self.section.as_slice())?)
    }

    /// Send a persistent reservation request. Returns the response and the
    /// registration keys that follow it.
    pub fn shared(&mut self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        request.encode_into(&mut self.section.as_mut_slice()[REQUEST_BODY_OFFSET..])?;
        self.call(RequestCode::Shared)?;

        let response = SharedResponse::decode(self.section.as_slice())?;
        let end = DATA_OFFSET + (response.length as usize).min(self.data_capacity());
        let keys = decode_keys(&self.section.as_slice()[DATA_OFFSET..end]);
        Ok((response, keys))
    }

    /// End the session and wait for the server to acknowledge.
    pub fn close(mut self) -> Result<()> {
        self.call(RequestCode::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_shm_client_rejects_headerless_buffer() {
        assert!(matches!(
            ShmClient::open("dvclient", DATA_OFFSET),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shm_read_ignores_oversized_length() {
        let name = format!("dvc{}", std::process::id());
        let names = ObjectNames::new(&name).unwrap();
        let size = DATA_OFFSET + 4096;
        let mut section = SharedSection::create(names.section(), size).unwrap();
        let request = NamedSignal::create(&names.request()).unwrap();
        let response = NamedSignal::create(&names.response()).unwrap();
        let mut client = ShmClient::open(&name, size)
            .unwrap()
            .with_timeout(Duration::from_secs(5));

        // A server answering with more data than was asked for.
        let server = thread::spawn(move || {
            request.wait().unwrap();
            let buf = section.as_mut_slice();
            ReadResponse::success(1 << 40).encode_into(buf).unwrap();
            buf[DATA_OFFSET..].fill(0x5A);
            response.post().unwrap();
            (section, request, response)
        });

        assert_eq!(client.read(0, 16).unwrap(), vec![0x5A; 16]);
        drop(server.join().unwrap());
    }
}
