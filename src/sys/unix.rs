//! Named objects on Unix: `flock` for name ownership, POSIX semaphores for
//! signals, POSIX shared memory for sections.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Derived names carry a suffix, so only the character set is checked here.
fn check_component(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn posix_name(name: &str) -> Result<CString> {
    check_component(name)?;
    CString::new(format!("/{name}")).map_err(|_| Error::InvalidName(name.to_string()))
}

fn os_error(what: &str, name: &str) -> Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => {
            Error::PermissionDenied(format!("{what} {name}: {err}"))
        }
        Some(libc::EEXIST) => Error::NameInUse(name.to_string()),
        _ => Error::Io(io::Error::new(err.kind(), format!("{what} {name}: {err}"))),
    }
}

/// Exclusive claim on an object name, released on drop.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    _file: File,
}

impl NamedLock {
    fn path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}.devio.lock"))
    }

    /// Claim `name`. Fails with [`Error::NameInUse`] if another live server
    /// holds it.
    pub fn acquire(name: &str) -> Result<Self> {
        check_component(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::path(name))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::NameInUse(name.to_string()));
            }
            return Err(err.into());
        }

        tracing::trace!(name, "named lock acquired");
        Ok(Self {
            name: name.to_string(),
            _file: file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Auto-reset signal backed by a named POSIX semaphore.
///
/// Each `post` releases exactly one `wait`.
#[derive(Debug)]
pub struct NamedSignal {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

// Safety: POSIX semaphores may be posted and waited on from any thread.
unsafe impl Send for NamedSignal {}
unsafe impl Sync for NamedSignal {}

impl NamedSignal {
    /// Create the signal, replacing any stale object left by a dead server.
    /// The caller is expected to hold the matching [`NamedLock`].
    pub fn create(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        let sem = unsafe {
            libc::sem_unlink(cname.as_ptr());
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(os_error("sem_open", name));
        }
        Ok(Self {
            sem,
            name: cname,
            owner: true,
        })
    }

    /// Open a signal created by a server.
    pub fn open(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(os_error("sem_open", name));
        }
        Ok(Self {
            sem,
            name: cname,
            owner: false,
        })
    }

    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Block until the signal is posted.
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    /// Wait up to `timeout`. Returns whether the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        // sem_timedwait is not available everywhere, so poll.
        let deadline = Instant::now() + timeout;
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => return Err(err.into()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }
}

impl Drop for NamedSignal {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

#[cfg(not(target_os = "macos"))]
unsafe fn shm_open(name: &CString, oflag: libc::c_int) -> libc::c_int {
    libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::mode_t)
}

#[cfg(target_os = "macos")]
unsafe fn shm_open(name: &CString, oflag: libc::c_int) -> libc::c_int {
    libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::c_uint)
}

/// Named shared memory mapping.
#[derive(Debug)]
pub struct SharedSection {
    ptr: *mut u8,
    size: usize,
    name: CString,
    owner: bool,
}

// Safety: the mapping is owned by this value; access goes through &/&mut self.
unsafe impl Send for SharedSection {}
unsafe impl Sync for SharedSection {}

impl SharedSection {
    /// Create a section of `size` bytes, replacing any stale one.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let cname = posix_name(name)?;
        let fd = unsafe {
            libc::shm_unlink(cname.as_ptr());
            shm_open(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)
        };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = os_error("ftruncate", name);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }
        let section = Self::map(fd, size, cname, true, name);
        unsafe { libc::close(fd) };
        section
    }

    /// Open a section created by a server.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let cname = posix_name(name)?;
        let fd = unsafe { shm_open(&cname, libc::O_RDWR) };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }
        let section = Self::map(fd, size, cname, false, name);
        unsafe { libc::close(fd) };
        section
    }

    fn map(fd: libc::c_int, size: usize, cname: CString, owner: bool, name: &str) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = os_error("mmap", name);
            if owner {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
            return Err(err);
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: cname,
            owner,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for SharedSection {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

/// Page-aligned, zero-filled private buffer.
#[derive(Debug)]
pub struct PageBuffer {
    ptr: *mut u8,
    size: usize,
}

// Safety: PageBuffer owns its allocation and can be sent between threads.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::unsupported("zero-sized page buffer"));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}
