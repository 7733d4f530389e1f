//! Providers over seekable byte streams and image files.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{clip, StorageProvider, DEFAULT_SECTOR_SIZE};
use crate::error::{Error, Result};

/// Provider over any `Read + Write + Seek` stream.
///
/// All access goes through one cursor, so requests are serialized.
pub struct StreamProvider<S> {
    stream: Mutex<S>,
    length: u64,
    writable: bool,
    sector_size: u32,
}

impl<S: Read + Write + Seek + Send> StreamProvider<S> {
    /// Wrap `stream`. Its length is taken once, from the end position.
    pub fn new(mut stream: S, writable: bool) -> Result<Self> {
        let length = stream.seek(SeekFrom::End(0))?;
        Ok(Self {
            stream: Mutex::new(stream),
            length,
            writable,
            sector_size: DEFAULT_SECTOR_SIZE,
        })
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S: Read + Write + Seek + Send> StorageProvider for StreamProvider<S> {
    fn length(&self) -> u64 {
        self.length
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let count = clip(offset, buf.len(), self.length)?;
        let mut stream = self.stream.lock();
        stream.seek(SeekFrom::Start(offset as u64))?;

        let mut done = 0;
        while done < count {
            match stream.read(&mut buf[done..count]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let count = clip(offset, buf.len(), self.length)?;
        let mut stream = self.stream.lock();
        stream.seek(SeekFrom::Start(offset as u64))?;
        stream.write_all(&buf[..count])?;
        Ok(count)
    }
}

impl<S> std::fmt::Debug for StreamProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProvider")
            .field("length", &self.length)
            .field("writable", &self.writable)
            .field("sector_size", &self.sector_size)
            .finish()
    }
}

/// Disk image file.
///
/// Requests whose offset, length and buffer address are all sector aligned
/// go through a second handle that bypasses the page cache. Everything else
/// uses the buffered cursor.
#[derive(Debug)]
pub struct FileProvider {
    path: PathBuf,
    cursor: StreamProvider<File>,
    direct: Option<File>,
}

impl FileProvider {
    /// Open an image file. `unbuffered` asks for the cache-bypassing fast
    /// path; if the platform or filesystem refuses it, the provider still
    /// works through the cursor.
    pub fn open(path: impl AsRef<Path>, writable: bool, unbuffered: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let cursor = StreamProvider::new(file, writable)?;

        let direct = if unbuffered {
            match open_direct(&path, writable) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::info!(path = %path.display(), error = %e, "unbuffered access unavailable");
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            path = %path.display(),
            length = cursor.length(),
            writable,
            direct = direct.is_some(),
            "image opened"
        );
        Ok(Self {
            path,
            cursor,
            direct,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cache-bypassing handle is in use.
    pub fn is_unbuffered(&self) -> bool {
        self.direct.is_some()
    }

    fn aligned(&self, offset: i64, len: usize, ptr: *const u8) -> bool {
        let align = self.cursor.sector_size() as u64;
        offset as u64 % align == 0 && len as u64 % align == 0 && ptr as usize as u64 % align == 0
    }

    /// Handle for the fast path, if this request qualifies for it.
    fn direct_for(&self, offset: i64, len: usize, count: usize, ptr: *const u8) -> Option<&File> {
        let file = self.direct.as_ref()?;
        (count == len && self.aligned(offset, len, ptr)).then_some(file)
    }
}

impl StorageProvider for FileProvider {
    fn length(&self) -> u64 {
        self.cursor.length()
    }

    fn sector_size(&self) -> u32 {
        self.cursor.sector_size()
    }

    fn can_write(&self) -> bool {
        self.cursor.can_write()
    }

    fn supports_parallel(&self) -> bool {
        self.direct.is_some()
    }

    fn required_alignment(&self) -> u64 {
        if self.direct.is_some() {
            self.cursor.sector_size() as u64
        } else {
            1
        }
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let count = clip(offset, buf.len(), self.length())?;
        match self.direct_for(offset, buf.len(), count, buf.as_ptr()) {
            Some(file) => {
                let mut done = 0;
                while done < count {
                    match read_at(file, &mut buf[done..count], offset as u64 + done as u64) {
                        Ok(0) => break,
                        Ok(n) => done += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(done)
            }
            None => self.cursor.read(buf, offset),
        }
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if !self.can_write() {
            return Err(Error::ReadOnly);
        }
        let count = clip(offset, buf.len(), self.length())?;
        match self.direct_for(offset, buf.len(), count, buf.as_ptr()) {
            Some(file) => {
                let mut done = 0;
                while done < count {
                    match write_at(file, &buf[done..count], offset as u64 + done as u64) {
                        Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                        Ok(n) => done += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(done)
            }
            None => self.cursor.write(buf, offset),
        }
    }
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path, writable: bool) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(writable)
        .custom_flags(libc::O_DIRECT)
        .open(path)
}

#[cfg(windows)]
fn open_direct(path: &Path, writable: bool) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    use windows::Win32::Storage::FileSystem::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH};
    OpenOptions::new()
        .read(true)
        .write(writable)
        .custom_flags(FILE_FLAG_NO_BUFFERING.0 | FILE_FLAG_WRITE_THROUGH.0)
        .open(path)
}

#[cfg(not(any(target_os = "linux", windows)))]
fn open_direct(_path: &Path, _writable: bool) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unbuffered file access not available on this platform",
    ))
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::PageBuffer;
    use std::io::Cursor;

    #[test]
    fn test_stream_read_write() {
        let provider = StreamProvider::new(Cursor::new(vec![0u8; 4096]), true).unwrap();
        assert_eq!(provider.length(), 4096);

        provider.write(b"devio", 1000).unwrap();
        let mut back = [0u8; 5];
        assert_eq!(provider.read(&mut back, 1000).unwrap(), 5);
        assert_eq!(&back, b"devio");
    }

    #[test]
    fn test_stream_write_clipped_at_end() {
        let provider = StreamProvider::new(Cursor::new(vec![0u8; 1024]), true).unwrap();
        assert_eq!(provider.write(&[1u8; 100], 1000).unwrap(), 24);
        // The stream must not have grown.
        assert_eq!(provider.into_inner().into_inner().len(), 1024);
    }

    #[test]
    fn test_stream_read_only() {
        let provider = StreamProvider::new(Cursor::new(vec![0u8; 1024]), false).unwrap();
        assert!(!provider.can_write());
        assert!(matches!(provider.write(&[1], 0), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_file_provider_round_trip() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0x5Au8; 1 << 20]).unwrap();
        image.flush().unwrap();

        let provider = FileProvider::open(image.path(), true, false).unwrap();
        assert_eq!(provider.length(), 1 << 20);
        assert!(!provider.is_unbuffered());
        assert_eq!(provider.required_alignment(), 1);

        provider.write(&[1, 2, 3], 77).unwrap();
        let mut back = [0u8; 5];
        provider.read(&mut back, 76).unwrap();
        assert_eq!(back, [0x5A, 1, 2, 3, 0x5A]);

        let mut tail = vec![0u8; 8192];
        assert_eq!(provider.read(&mut tail, 1_048_000).unwrap(), 576);
    }

    #[test]
    fn test_file_provider_unbuffered_falls_back() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0u8; 64 * 1024]).unwrap();
        image.flush().unwrap();

        // Whether or not the filesystem accepts unbuffered access, unaligned
        // requests are served.
        let provider = FileProvider::open(image.path(), true, true).unwrap();
        provider.write(b"odd", 3).unwrap();
        let mut back = [0u8; 3];
        provider.read(&mut back, 3).unwrap();
        assert_eq!(&back, b"odd");
    }

    #[test]
    fn test_file_provider_direct_writes_visible_to_cursor() {
        // tmpfs refuses O_DIRECT, so stay on the working directory's filesystem.
        let mut image = tempfile::NamedTempFile::new_in(".").unwrap();
        image.write_all(&vec![0u8; 64 * 1024]).unwrap();
        image.flush().unwrap();

        let provider = FileProvider::open(image.path(), true, true).unwrap();
        if !provider.is_unbuffered() {
            return;
        }
        assert_eq!(provider.required_alignment(), DEFAULT_SECTOR_SIZE as u64);
        assert!(provider.supports_parallel());

        let mut block = PageBuffer::new(4096).unwrap();
        block.as_mut_slice().fill(0xC3);
        assert_eq!(provider.write(block.as_slice(), 8192).unwrap(), 4096);

        let mut edge = [0u8; 3];
        provider.read(&mut edge, 8191).unwrap();
        assert_eq!(edge, [0, 0xC3, 0xC3]);

        provider.write(b"xyz", 8192).unwrap();
        let mut back = PageBuffer::new(4096).unwrap();
        assert_eq!(provider.read(back.as_mut_slice(), 8192).unwrap(), 4096);
        assert_eq!(&back.as_slice()[..4], b"xyz\xC3");
        assert!(back.as_slice()[4..].iter().all(|b| *b == 0xC3));
    }
}
