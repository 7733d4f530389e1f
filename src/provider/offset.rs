//! Offset view over another provider.

use super::{clip, estimate_volume_length, StorageProvider};
use crate::error::{Error, Result};
use crate::protocol::{SharedRequest, SharedResponse};

/// Presents the bytes of `base` starting at a fixed offset.
///
/// `read(0, n)` on the view is `base.read(delta, n)`. The view's length is
/// fixed at construction.
#[derive(Debug)]
pub struct OffsetProvider<P> {
    base: P,
    delta: i64,
    length: u64,
}

impl<P: StorageProvider> OffsetProvider<P> {
    /// View `base` from `delta` to its end.
    pub fn new(base: P, delta: u64) -> Result<Self> {
        let outer = base.length();
        if delta > outer || delta > i64::MAX as u64 {
            return Err(Error::OutOfRange {
                offset: delta.min(i64::MAX as u64) as i64,
                length: 0,
            });
        }
        Ok(Self {
            length: outer - delta,
            delta: delta as i64,
            base,
        })
    }

    /// View `base` from `delta`, sized by the volume boot sector found there
    /// when one can be recognised. Falls back to the rest of `base`.
    pub fn with_detected_length(base: P, delta: u64) -> Result<Self> {
        let mut view = Self::new(base, delta)?;
        if let Some(detected) = estimate_volume_length(&view.base, view.delta) {
            if detected <= view.length {
                tracing::debug!(delta, detected, outer = view.length, "volume length detected");
                view.length = detected;
            }
        }
        Ok(view)
    }

    pub fn delta(&self) -> u64 {
        self.delta as u64
    }

    pub fn base(&self) -> &P {
        &self.base
    }

    pub fn into_inner(self) -> P {
        self.base
    }

    fn translate(&self, offset: i64) -> Result<i64> {
        offset.checked_add(self.delta).ok_or(Error::OutOfRange {
            offset,
            length: 0,
        })
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl<P: StorageProvider> StorageProvider for OffsetProvider<P> {
    fn length(&self) -> u64 {
        self.length
    }

    fn sector_size(&self) -> u32 {
        self.base.sector_size()
    }

    fn can_write(&self) -> bool {
        self.base.can_write()
    }

    fn supports_parallel(&self) -> bool {
        self.base.supports_parallel()
    }

    fn supports_shared(&self) -> bool {
        self.base.supports_shared()
    }

    fn use_lazy_writes(&self) -> bool {
        self.base.use_lazy_writes()
    }

    /// The base alignment, reduced to what the offset itself preserves.
    fn required_alignment(&self) -> u64 {
        let base = self.base.required_alignment().max(1);
        gcd(base, self.delta as u64)
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let count = clip(offset, buf.len(), self.length)?;
        self.base.read(&mut buf[..count], self.translate(offset)?)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let count = clip(offset, buf.len(), self.length)?;
        self.base.write(&buf[..count], self.translate(offset)?)
    }

    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        self.base.shared_keys(request)
    }
}
