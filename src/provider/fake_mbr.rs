//! Synthetic partition table over a raw volume.
//!
//! Presents an unpartitioned volume image as a disk with one partition.
//! The disk is made of three disjoint regions:
//!
//! ```text
//! 0              PREFIX_SIZE          PREFIX_SIZE + base    end
//! | synthetic MBR | base provider      | zero pad           |
//! ```
//!
//! The pad exists only when the volume's boot sector claims more sectors than
//! the base provider holds. Every request is split at region boundaries and
//! each piece goes to exactly one region.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{clip, StorageProvider};
use crate::error::{Error, Result};
use crate::protocol::{SharedRequest, SharedResponse};

/// Size of the synthetic region in front of the volume.
pub const PREFIX_SIZE: usize = 64 * 1024;

/// Partition type written into the table (NTFS / exFAT / IFS).
pub const PARTITION_TYPE_NTFS: u8 = 0x07;

const BOOT_SECTOR_SIZE: usize = 512;
const DISK_SIGNATURE_OFFSET: usize = 0x1B8;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const MBR_SIGNATURE_OFFSET: usize = 0x1FE;

// Volume boot sector fields.
const BPB_BYTES_PER_SECTOR: usize = 0x0B;
const BPB_TOTAL_SECTORS_16: usize = 0x13;
const BPB_TOTAL_SECTORS_32: usize = 0x20;
const BPB_TOTAL_SECTORS_64: usize = 0x28;

/// Boot code placed at the start of the synthetic MBR: prints a message
/// through the BIOS teletype service and halts.
const BOOT_CODE: &[u8] = &[
    0xFA, // cli
    0x33, 0xC0, // xor ax, ax
    0x8E, 0xD0, // mov ss, ax
    0xBC, 0x00, 0x7C, // mov sp, 0x7C00
    0xFB, // sti
    0x8E, 0xD8, // mov ds, ax
    0xBE, 0x1C, 0x7C, // mov si, 0x7C1C (message)
    0xAC, // lodsb
    0x84, 0xC0, // test al, al
    0x74, 0x06, // jz halt
    0xB4, 0x0E, // mov ah, 0x0E
    0xCD, 0x10, // int 0x10
    0xEB, 0xF5, // jmp lodsb
    0xF4, // halt: hlt
    0xEB, 0xFD, // jmp halt
    b'N', b'o', b't', b' ', b'a', b' ', b'b', b'o', b'o', b't', b'a', b'b', b'l', b'e', b' ',
    b'd', b'i', b's', b'k', b'\r', b'\n', 0,
];

/// Estimate the byte length of the volume whose boot sector sits at `offset`.
///
/// Checks the 16-bit, 32-bit and 64-bit total-sector fields in that order and
/// takes the first one that is non-zero (and, for the 64-bit field,
/// non-negative), scaled by the bytes-per-sector field. Returns `None` if the
/// sector cannot be read or carries no usable count.
pub fn estimate_volume_length<P: StorageProvider + ?Sized>(base: &P, offset: i64) -> Option<u64> {
    let mut sector = [0u8; BOOT_SECTOR_SIZE];
    match base.read(&mut sector, offset) {
        Ok(n) if n == BOOT_SECTOR_SIZE => {}
        Ok(_) => return None,
        Err(e) => {
            tracing::debug!(offset, error = %e, "cannot read boot sector");
            return None;
        }
    }

    let bytes_per_sector = u16::from_le_bytes([
        sector[BPB_BYTES_PER_SECTOR],
        sector[BPB_BYTES_PER_SECTOR + 1],
    ]) as u64;
    if !bytes_per_sector.is_power_of_two() || !(128..=4096).contains(&bytes_per_sector) {
        return None;
    }

    let total16 = u16::from_le_bytes([
        sector[BPB_TOTAL_SECTORS_16],
        sector[BPB_TOTAL_SECTORS_16 + 1],
    ]) as i64;
    let mut raw32 = [0u8; 4];
    raw32.copy_from_slice(&sector[BPB_TOTAL_SECTORS_32..BPB_TOTAL_SECTORS_32 + 4]);
    let total32 = u32::from_le_bytes(raw32) as i64;
    let mut raw64 = [0u8; 8];
    raw64.copy_from_slice(&sector[BPB_TOTAL_SECTORS_64..BPB_TOTAL_SECTORS_64 + 8]);
    let total64 = i64::from_le_bytes(raw64);

    let sectors = [total16, total32, total64].into_iter().find(|&n| n > 0)?;
    (sectors as u64).checked_mul(bytes_per_sector)
}

/// Build the 64 KiB synthetic prefix for a partition of `partition_bytes`.
fn build_prefix(partition_bytes: u64, sector_size: u32, disk_signature: u32) -> Vec<u8> {
    let mut prefix = vec![0u8; PREFIX_SIZE];
    prefix[..BOOT_CODE.len()].copy_from_slice(BOOT_CODE);
    prefix[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
        .copy_from_slice(&disk_signature.to_le_bytes());

    let sector_size = sector_size.max(1) as u64;
    let start_lba = (PREFIX_SIZE as u64 / sector_size) as u32;
    let sector_count = partition_bytes
        .div_ceil(sector_size)
        .min(u32::MAX as u64) as u32;

    let entry = &mut prefix[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + 16];
    entry[0] = 0x80; // active
    entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]); // CHS unused, LBA only
    entry[4] = PARTITION_TYPE_NTFS;
    entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    entry[8..12].copy_from_slice(&start_lba.to_le_bytes());
    entry[12..16].copy_from_slice(&sector_count.to_le_bytes());

    prefix[MBR_SIGNATURE_OFFSET] = 0x55;
    prefix[MBR_SIGNATURE_OFFSET + 1] = 0xAA;
    prefix
}

fn random_signature() -> u32 {
    let mut raw = [0u8; 4];
    if getrandom::getrandom(&mut raw).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x5EED_5EED);
        return nanos | 1;
    }
    u32::from_le_bytes(raw) | 1
}

const PAD_PAGE: u64 = 4096;

/// Zero-filled region that only allocates pages once they are written.
#[derive(Debug, Default)]
struct SparsePad {
    pages: RwLock<HashMap<u64, Box<[u8]>>>,
}

impl SparsePad {
    fn read(&self, mut at: u64, buf: &mut [u8]) {
        let pages = self.pages.read();
        let mut done = 0;
        while done < buf.len() {
            let inner = (at % PAD_PAGE) as usize;
            let piece = (PAD_PAGE as usize - inner).min(buf.len() - done);
            let dst = &mut buf[done..done + piece];
            match pages.get(&(at / PAD_PAGE)) {
                Some(page) => dst.copy_from_slice(&page[inner..inner + piece]),
                None => dst.fill(0),
            }
            done += piece;
            at += piece as u64;
        }
    }

    fn write(&self, mut at: u64, buf: &[u8]) {
        let mut pages = self.pages.write();
        let mut done = 0;
        while done < buf.len() {
            let inner = (at % PAD_PAGE) as usize;
            let piece = (PAD_PAGE as usize - inner).min(buf.len() - done);
            let page = pages
                .entry(at / PAD_PAGE)
                .or_insert_with(|| vec![0u8; PAD_PAGE as usize].into_boxed_slice());
            page[inner..inner + piece].copy_from_slice(&buf[done..done + piece]);
            done += piece;
            at += piece as u64;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Prefix,
    Base,
    Pad,
}

/// Raw volume presented as a partitioned disk.
#[derive(Debug)]
pub struct FakeMbrProvider<P> {
    base: P,
    base_length: u64,
    prefix: RwLock<Vec<u8>>,
    pad: SparsePad,
    length: u64,
}

impl<P: StorageProvider> FakeMbrProvider<P> {
    /// Wrap `base`, sizing the partition from its boot sector when possible.
    pub fn new(base: P) -> Result<Self> {
        Self::with_signature(base, random_signature())
    }

    /// Wrap `base` with a fixed disk signature.
    pub fn with_signature(base: P, disk_signature: u32) -> Result<Self> {
        let base_length = base.length();
        let partition_bytes = estimate_volume_length(&base, 0).unwrap_or(base_length);
        let pad_length = partition_bytes.saturating_sub(base_length);
        let length = (PREFIX_SIZE as u64)
            .checked_add(base_length)
            .and_then(|n| n.checked_add(pad_length))
            .filter(|&n| n <= i64::MAX as u64)
            .ok_or_else(|| {
                Error::unsupported(format!("volume claims {partition_bytes} bytes"))
            })?;

        tracing::debug!(
            base_length,
            partition_bytes,
            pad_length,
            disk_signature = format_args!("{disk_signature:08x}"),
            "synthetic MBR built"
        );

        Ok(Self {
            prefix: RwLock::new(build_prefix(partition_bytes, base.sector_size(), disk_signature)),
            pad: SparsePad::default(),
            length,
            base_length,
            base,
        })
    }

    pub fn base(&self) -> &P {
        &self.base
    }

    /// Region containing `pos`, with its start and exclusive end.
    fn region_at(&self, pos: u64) -> (Region, u64, u64) {
        let prefix_end = PREFIX_SIZE as u64;
        let base_end = prefix_end + self.base_length;
        if pos < prefix_end {
            (Region::Prefix, 0, prefix_end)
        } else if pos < base_end {
            (Region::Base, prefix_end, base_end)
        } else {
            (Region::Pad, base_end, self.length)
        }
    }

    /// Split `[offset, offset + count)` by region and hand each piece to `op`
    /// as `(region, offset within region, range within caller buffer)`.
    fn split(
        &self,
        offset: i64,
        count: usize,
        mut op: impl FnMut(Region, u64, std::ops::Range<usize>) -> Result<usize>,
    ) -> Result<usize> {
        let mut done = 0usize;
        while done < count {
            let pos = offset as u64 + done as u64;
            let (region, start, end) = self.region_at(pos);
            let piece = ((end - pos) as usize).min(count - done);
            let moved = op(region, pos - start, done..done + piece)?;
            done += moved;
            if moved < piece {
                break;
            }
        }
        Ok(done)
    }
}

impl<P: StorageProvider> StorageProvider for FakeMbrProvider<P> {
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

    fn required_alignment(&self) -> u64 {
        self.base.required_alignment()
    }

    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let count = clip(offset, buf.len(), self.length)?;
        self.split(offset, count, |region, at, range| {
            let at_usize = at as usize;
            let len = range.len();
            match region {
                Region::Prefix => {
                    buf[range].copy_from_slice(&self.prefix.read()[at_usize..at_usize + len]);
                    Ok(len)
                }
                Region::Base => self.base.read(&mut buf[range], at as i64),
                Region::Pad => {
                    self.pad.read(at, &mut buf[range]);
                    Ok(len)
                }
            }
        })
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if !self.base.can_write() {
            return Err(Error::ReadOnly);
        }
        let count = clip(offset, buf.len(), self.length)?;
        self.split(offset, count, |region, at, range| {
            let at_usize = at as usize;
            let len = range.len();
            match region {
                Region::Prefix => {
                    self.prefix.write()[at_usize..at_usize + len].copy_from_slice(&buf[range]);
                    Ok(len)
                }
                Region::Base => self.base.write(&buf[range], at as i64),
                Region::Pad => {
                    self.pad.write(at, &buf[range]);
                    Ok(len)
                }
            }
        })
    }

    fn shared_keys(&self, request: &SharedRequest) -> Result<(SharedResponse, Vec<u64>)> {
        self.base.shared_keys(request)
    }
}
