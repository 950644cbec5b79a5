//! Process memory access for the unwinder.
//!
//! Two variants are provided: a safe reader that reports success or failure
//! per read and never faults the caller, and an unchecked fast path for
//! callers that have already validated the mapping. The unwinder only ever
//! reads; nothing here allocates on the read path.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::arch::Arch;

/// Read-only view of the traced process's address space.
pub trait ProcessMemory: Send + Sync {
    /// Fill `buf` from `addr`. Returns false (without faulting) when any part
    /// of the range is unreadable.
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Fast path for callers that have already validated the mapping.
    ///
    /// # Safety
    /// `addr..addr + buf.len()` must be mapped and readable for the entire
    /// duration of the call.
    unsafe fn read_unchecked(&self, addr: u64, buf: &mut [u8]) -> bool {
        self.read(addr, buf)
    }

    /// Read one little-endian machine word of `arch` at `addr`.
    fn read_word(&self, addr: u64, arch: Arch) -> Option<u64> {
        let mut buf = [0u8; 8];
        let len = arch.word_size();
        if !self.read(addr, &mut buf[..len]) {
            return None;
        }
        Some(u64::from_le_bytes(buf))
    }

    /// Read a little-endian u32 at `addr`.
    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        if !self.read(addr, &mut buf) {
            return None;
        }
        Some(u32::from_le_bytes(buf))
    }
}

/// Reader over the current process, backed by `/proc/self/mem`.
///
/// Reading through the proc file turns a wild access into an I/O error
/// instead of a fault, which is what the safe contract requires.
pub struct LocalMemory {
    mem: File,
}

impl LocalMemory {
    /// # Errors
    /// Returns an error if `/proc/self/mem` cannot be opened.
    pub fn new() -> io::Result<Self> {
        Ok(Self { mem: File::open("/proc/self/mem")? })
    }
}

impl ProcessMemory for LocalMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        self.mem.read_exact_at(buf, addr).is_ok()
    }

    unsafe fn read_unchecked(&self, addr: u64, buf: &mut [u8]) -> bool {
        std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        true
    }
}

/// Test substitute: a set of address-tagged byte regions.
///
/// Reads inside a region succeed, everything else fails, which makes the
/// bounds-checking paths of the unwinder exercisable without a live process.
#[derive(Default)]
pub struct SliceMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl SliceMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` as readable starting at `addr`.
    pub fn add_region(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.push((addr, bytes));
    }

    /// Convenience for word-sized test fixtures.
    pub fn add_word(&mut self, addr: u64, value: u64, arch: Arch) {
        self.add_region(addr, value.to_le_bytes()[..arch.word_size()].to_vec());
    }
}

impl ProcessMemory for SliceMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        for (start, bytes) in &self.regions {
            let end = start + bytes.len() as u64;
            if addr >= *start && addr + buf.len() as u64 <= end {
                let offset = (addr - start) as usize;
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
                return true;
            }
        }
        false
    }
}
