//! Distinct types for the two address spaces this crate has to keep apart:
//! addresses as recorded in the ELF file (`ElfVa`) and addresses as observed
//! by the current process (`ProcAddr`). `base_addr` (SPEC_FULL.md §3, design
//! note on "`base_addr` delta") is the translation between them, not an
//! owning relationship, so it is modeled as a plain offset rather than
//! folded into either type.

use std::fmt;
use std::ops::{Add, Sub};

/// A virtual address as recorded in the object file (section headers,
/// symbol tables, relocation addends). Meaningless on its own until combined
/// with a `base_addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElfVa(pub u64);

/// An address as seen in the current process's memory map: what the crawler
/// disassembles, and what `mprotect`/`mmap` operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcAddr(pub usize);

impl ElfVa {
    pub fn to_proc(self, base_addr: usize) -> ProcAddr {
        ProcAddr(base_addr.wrapping_add(self.0 as usize))
    }
}

impl ProcAddr {
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn offset_from(self, other: ProcAddr) -> i64 {
        self.0 as i64 - other.0 as i64
    }
}

impl Add<u64> for ProcAddr {
    type Output = ProcAddr;
    fn add(self, rhs: u64) -> ProcAddr {
        ProcAddr(self.0.wrapping_add(rhs as usize))
    }
}

impl Add<usize> for ProcAddr {
    type Output = ProcAddr;
    fn add(self, rhs: usize) -> ProcAddr {
        ProcAddr(self.0.wrapping_add(rhs))
    }
}

impl Sub<usize> for ProcAddr {
    type Output = ProcAddr;
    fn sub(self, rhs: usize) -> ProcAddr {
        ProcAddr(self.0.wrapping_sub(rhs))
    }
}

impl fmt::Display for ProcAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Display for ElfVa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
