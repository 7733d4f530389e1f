//! Named objects on Windows: a named mutex for name ownership, auto-reset
//! events for signals and a pagefile-backed file mapping for sections.

use std::time::Duration;

use windows::core::HSTRING;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualAlloc,
    VirtualFree, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT, MEM_RELEASE,
    MEM_RESERVE, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, OpenEventW, SetEvent, WaitForSingleObject, EVENT_MODIFY_STATE,
    INFINITE, SYNCHRONIZATION_SYNCHRONIZE,
};

use crate::error::{Error, Result};

fn check_component(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['\\', '\0']) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn map_error(err: windows::core::Error, name: &str) -> Error {
    if err.code() == ERROR_ACCESS_DENIED.to_hresult() {
        Error::PermissionDenied(format!("{name}: {err}"))
    } else {
        Error::Windows(err)
    }
}

/// Exclusive claim on an object name, released on drop.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    handle: HANDLE,
}

// Safety: the handle is owned by this value and only closed on drop.
unsafe impl Send for NamedLock {}
unsafe impl Sync for NamedLock {}

impl NamedLock {
    /// Claim `name`. Fails with [`Error::NameInUse`] if another live server
    /// holds it.
    pub fn acquire(name: &str) -> Result<Self> {
        check_component(name)?;
        let wide = HSTRING::from(name);
        let handle = unsafe { CreateMutexW(None, true, &wide) }.map_err(|e| map_error(e, name))?;
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(Error::NameInUse(name.to_string()));
        }
        tracing::trace!(name, "named lock acquired");
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Auto-reset named event.
#[derive(Debug)]
pub struct NamedSignal {
    handle: HANDLE,
}

// Safety: event handles may be signalled and waited on from any thread.
unsafe impl Send for NamedSignal {}
unsafe impl Sync for NamedSignal {}

impl NamedSignal {
    pub fn create(name: &str) -> Result<Self> {
        check_component(name)?;
        let wide = HSTRING::from(name);
        let handle =
            unsafe { CreateEventW(None, false, false, &wide) }.map_err(|e| map_error(e, name))?;
        Ok(Self { handle })
    }

    pub fn open(name: &str) -> Result<Self> {
        check_component(name)?;
        let wide = HSTRING::from(name);
        let handle = unsafe {
            OpenEventW(EVENT_MODIFY_STATE | SYNCHRONIZATION_SYNCHRONIZE, false, &wide)
        }
        .map_err(|e| map_error(e, name))?;
        Ok(Self { handle })
    }

    pub fn post(&self) -> Result<()> {
        unsafe { SetEvent(self.handle) }?;
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        let rc = unsafe { WaitForSingleObject(self.handle, INFINITE) };
        if rc != WAIT_OBJECT_0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let millis = timeout.as_millis().min((INFINITE - 1) as u128) as u32;
        let rc = unsafe { WaitForSingleObject(self.handle, millis) };
        if rc == WAIT_OBJECT_0 {
            Ok(true)
        } else if rc == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }
}

impl Drop for NamedSignal {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Named shared memory mapping.
#[derive(Debug)]
pub struct SharedSection {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    size: usize,
}

// Safety: the mapping is owned by this value; access goes through &/&mut self.
unsafe impl Send for SharedSection {}
unsafe impl Sync for SharedSection {}

impl SharedSection {
    pub fn create(name: &str, size: usize) -> Result<Self> {
        check_component(name)?;
        let wide = HSTRING::from(name);
        let size64 = size as u64;
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size64 >> 32) as u32,
                size64 as u32,
                &wide,
            )
        }
        .map_err(|e| map_error(e, name))?;
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(Error::NameInUse(name.to_string()));
        }
        Self::map(handle, size, name)
    }

    pub fn open(name: &str, size: usize) -> Result<Self> {
        check_component(name)?;
        let wide = HSTRING::from(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &wide) }
            .map_err(|e| map_error(e, name))?;
        Self::map(handle, size, name)
    }

    fn map(handle: HANDLE, size: usize, name: &str) -> Result<Self> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = std::io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(Error::Io(std::io::Error::new(
                err.kind(),
                format!("MapViewOfFile {name}: {err}"),
            )));
        }
        Ok(Self { handle, view, size })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.size) }
    }
}

impl Drop for SharedSection {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Page-aligned, zero-filled private buffer.
#[derive(Debug)]
pub struct PageBuffer {
    ptr: *mut std::ffi::c_void,
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
        let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { ptr, size })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.size) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}
