//! Trampoline placement and the actual bytes-on-the-wire emission of a
//! planned patch. Grounded in `intercept_desc.c`'s `get_min_address`/
//! `allocate_trampoline` for placement, and in `patch_offsets.h` for the
//! stack-frame layout the emitted prologue agrees with the external
//! assembly stub on.

use std::fs;

use nix::sys::mman::{mprotect, ProtFlags};

use crate::addr::ProcAddr;
use crate::consts::{
    round_down_address, round_up_to_page, RvcMode, RvcSizes, JUMP_2GB_POS_REACH, PAGE_SIZE,
};
use crate::encode::{rv_jal, rvc_nop, rvp_jump_2gb};
use crate::error::PatchError;
use crate::maps::MemoryRegion;
use crate::patch::{PatchDesc, PatchShape};

/// Default guess before `/proc/sys/vm/mmap_min_addr` has been consulted;
/// matches the source's own fallback value.
const DEFAULT_MIN_ADDRESS: usize = 0x10000;

/// `addi x0, x0, 0`: the base-ISA NOP, for padding when RVC is disabled and
/// `rvc_nop`'s 2-byte encoding would desync every instruction after it.
fn rv_nop(buf: &mut [u8]) -> u8 {
    buf[0..4].copy_from_slice(&0x0000_0013u32.to_le_bytes());
    4
}

/// Reads `/proc/sys/vm/mmap_min_addr`, falling back to the same guess the
/// original uses if the file is missing or unparsable (sandboxed or
/// non-Linux test environments).
pub fn min_mmap_address() -> usize {
    fs::read_to_string("/proc/sys/vm/mmap_min_addr")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MIN_ADDRESS)
}

/// Picks a starting guess for the trampoline, then walks `regions` (assumed
/// sorted by address, as `/proc/self/maps` always is) looking for the first
/// gap at or after that guess big enough for `size` bytes -- one page at a
/// time, exactly as the original's `fgets` loop over `/proc/self/maps` does.
///
/// Pure and allocation-free: the actual `mmap` call lives in
/// [`allocate_trampoline`], which this is split out of so the placement
/// logic can be exercised without touching real memory.
pub fn find_trampoline_guess(
    text_start: ProcAddr,
    text_end: ProcAddr,
    min_address: usize,
    size: usize,
    regions: &[MemoryRegion],
) -> Result<ProcAddr, PatchError> {
    let mut guess = if text_end.0 < i32::MAX as usize {
        0
    } else {
        round_down_address(text_end.0.saturating_sub(i32::MAX as usize)) + PAGE_SIZE
    };
    if guess < min_address {
        guess = min_address;
    }

    for region in regions {
        if region.end.0 < guess {
            continue;
        }
        if region.start.0 >= guess + size {
            break;
        }
        guess = region.end.0;
        if guess as i64 >= text_start.0 as i64 + JUMP_2GB_POS_REACH {
            return Err(PatchError::Structural("unable to find place for trampoline".into()));
        }
    }

    Ok(ProcAddr(guess))
}

/// Reserves and maps the shared per-object trampoline. Respects
/// `INTERCEPT_NO_TRAMPOLINE` the same way the original does: present and
/// beginning with `'0'` disables it, in which case callers must fall back
/// to patch shapes that don't need one (and GW emits its direct-jump form
/// instead of routing through a trampoline).
///
/// # Safety
///
/// Maps memory with a fixed address chosen from `/proc/self/maps`; callers
/// must not already be relying on that address range being free for
/// something else racing this call.
pub unsafe fn allocate_trampoline(
    text_start: ProcAddr,
    text_end: ProcAddr,
    rvc: RvcMode,
) -> Result<Option<ProcAddr>, PatchError> {
    // Per the environment contract: the var disables the trampoline when
    // present and its value *begins with* '0' -- not when absent, and not
    // for other values. Preserved as-is from the source (see DESIGN.md).
    let disabled = std::env::var("INTERCEPT_NO_TRAMPOLINE").is_ok_and(|v| v.starts_with('0'));
    if disabled {
        return Ok(None);
    }

    let sizes = RvcSizes::for_mode(rvc);
    let size = sizes.trampoline_size() as usize;
    let regions = crate::maps::parse_proc_maps().map_err(|e| {
        PatchError::Structural(format!("failed to read /proc/self/maps: {e}"))
    })?;
    let guess = find_trampoline_guess(text_start, text_end, min_mmap_address(), size, &regions)?;

    let addr = unsafe {
        libc::mmap(
            guess.0 as *mut libc::c_void,
            round_up_to_page(size),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(PatchError::Structural("mmap for trampoline failed".into()));
    }

    Ok(Some(ProcAddr(addr as usize)))
}

/// Overwrites `patch.dst_jmp_patch` in `.text` with the chosen shape,
/// `mprotect`-ing the containing pages writable first and restoring them
/// (executable, no longer writable) afterwards, then flushing the icache
/// over the touched range so other threads observe the new bytes.
///
/// # Safety
///
/// `patch.dst_jmp_patch .. +patch.patch_size_bytes` must be mapped,
/// executable memory belonging to the object the patch was planned
/// against; this overwrites it in place while the process is running.
pub unsafe fn apply_patch(
    patch: &PatchDesc,
    trampoline: ProcAddr,
    rvc: RvcMode,
) -> Result<(), PatchError> {
    let mut bytes = vec![0u8; patch.patch_size_bytes as usize];
    let mut n = 0usize;
    let nop = |buf: &mut [u8]| if rvc.is_enabled() { rvc_nop(buf) } else { rv_nop(buf) };

    if patch.start_with_c_nop {
        n += nop(&mut bytes[n..]) as usize;
    }

    // GW reaches the trampoline directly; MID and SML both rely on it being
    // within JAL's +/-1 MiB (MID via the shared gateway colocated with the
    // trampoline, SML because it has no room to spare for anything wider).
    n += match patch.shape {
        PatchShape::Gw => rvp_jump_2gb(
            &mut bytes[n..],
            rvc,
            patch.return_register,
            patch.return_register,
            patch.dst_jmp_patch.0 as u64,
            trampoline.0 as u64,
        ),
        PatchShape::Mid | PatchShape::Sml { .. } => {
            let from = patch.dst_jmp_patch + n;
            rv_jal(&mut bytes[n..], patch.return_register, trampoline.offset_from(from) as i32)
        }
    } as usize;

    while n < bytes.len() {
        n += nop(&mut bytes[n..]) as usize;
    }

    let page_addr = round_down_address(patch.dst_jmp_patch.0);
    let span = (patch.dst_jmp_patch.0 + patch.patch_size_bytes as usize) - page_addr;
    let mapped_len = round_up_to_page(span);

    let page_ptr = std::ptr::NonNull::new(page_addr as *mut std::ffi::c_void)
        .expect("page-aligned address from a real .text mapping is never null");

    unsafe {
        mprotect(page_ptr, mapped_len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC)?;
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            patch.dst_jmp_patch.as_mut_ptr(),
            bytes.len(),
        );
        mprotect(page_ptr, mapped_len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)?;
    }

    flush_icache(patch.dst_jmp_patch, bytes.len());

    Ok(())
}

/// RISC-V has no user-mode cache-flush instruction; glibc and musl both
/// expose this as the `__riscv_flush_icache` syscall wrapper, `SYS_riscv_hwprobe`'s
/// sibling. `flags = 0` (`SYS_RISCV_FLUSH_ICACHE_LOCAL`) flushes only the
/// calling hart, which is enough here since every thread re-reads `.text`
/// through the same mapping and the syscall itself is a full barrier on the
/// executing hart.
fn flush_icache(start: ProcAddr, len: usize) {
    const SYS_RISCV_FLUSH_ICACHE: i64 = 259;
    const SYS_RISCV_FLUSH_ICACHE_LOCAL: usize = 1;
    unsafe {
        libc::syscall(
            SYS_RISCV_FLUSH_ICACHE,
            start.0,
            start.0 + len,
            SYS_RISCV_FLUSH_ICACHE_LOCAL,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, end: usize) -> MemoryRegion {
        MemoryRegion {
            start: ProcAddr(start),
            end: ProcAddr(end),
            readable: true,
            writable: false,
            executable: false,
            private: true,
            offset: 0,
            device: "00:00".into(),
            inode: 0,
            pathname: None,
        }
    }

    #[test]
    fn guess_starts_at_zero_for_low_text() {
        let guess = find_trampoline_guess(
            ProcAddr(0x1000),
            ProcAddr(0x2000),
            0x10000,
            0x1000,
            &[],
        )
        .unwrap();
        assert_eq!(guess, ProcAddr(0x10000));
    }

    #[test]
    fn guess_skips_over_overlapping_mappings() {
        let regions = vec![region(0x10000, 0x20000), region(0x30000, 0x40000)];
        let guess =
            find_trampoline_guess(ProcAddr(0x1000), ProcAddr(0x2000), 0x10000, 0x1000, &regions)
                .unwrap();
        assert_eq!(guess, ProcAddr(0x20000));
    }

    #[test]
    fn guess_stops_early_once_past_the_candidate() {
        let regions = vec![region(0x50000, 0x60000)];
        let guess =
            find_trampoline_guess(ProcAddr(0x1000), ProcAddr(0x2000), 0x10000, 0x1000, &regions)
                .unwrap();
        assert_eq!(guess, ProcAddr(0x10000));
    }
}
