//! Platform named objects.
//!
//! Each platform module provides the same four types:
//!
//! - [`NamedLock`]: held for the lifetime of a server to claim an object name
//! - [`NamedSignal`]: auto-reset signal that can be opened by name from
//!   another process
//! - [`SharedSection`]: named shared memory mapping
//! - [`PageBuffer`]: page-aligned private buffer

use crate::error::{Error, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{NamedLock, NamedSignal, PageBuffer, SharedSection};

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use win32::{NamedLock, NamedSignal, PageBuffer, SharedSection};

/// Longest object name accepted.
pub const MAX_NAME_LEN: usize = 64;

/// Check that `name` can be used to derive platform object names.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.chars().all(valid_char) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Names of the objects that make up one shared-memory endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    base: String,
}

impl ObjectNames {
    pub fn new(base: &str) -> Result<Self> {
        validate_name(base)?;
        Ok(Self {
            base: base.to_string(),
        })
    }

    /// The shared memory section.
    pub fn section(&self) -> &str {
        &self.base
    }

    /// Signalled by the peer when a request is ready.
    pub fn request(&self) -> String {
        format!("{}_Request", self.base)
    }

    /// Signalled by the server when a response is ready.
    pub fn response(&self) -> String {
        format!("{}_Response", self.base)
    }

    /// Held by the server to claim the name.
    pub fn server(&self) -> String {
        format!("{}_Server", self.base)
    }
}
