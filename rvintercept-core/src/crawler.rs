//! Sliding-window crawl over `.text`, producing one [`CrawledSyscall`] per
//! `ecall` found along with the instructions surrounding it. Grounded in
//! `intercept_desc.c`'s `crawl_text`/`fill_up_patch`; the window stays a
//! fixed-size array exactly as the original keeps `surr[]`, rather than
//! growing a `VecDeque`, so the FIFO shift (`memmove`) and the end-of-.text
//! reconciliation loop translate line for line.

use std::slice;

use crate::addr::ProcAddr;
use crate::consts::{RvcMode, SURROUNDING_INSTRS_NUM, SYSCALL_IDX};
use crate::disasm::{DisasmContext, InterceptDisasmResult};
use crate::elf::ElfDescriptor;

/// One `ecall` site plus the (up to) six instructions on either side of it,
/// as decoded at crawl time. Not yet a patch plan: [`crate::patch`] turns
/// this into a [`crate::patch::PatchDesc`] once a shape has been chosen.
#[derive(Debug, Clone, Copy)]
pub struct CrawledSyscall {
    pub surrounding_instrs: [InterceptDisasmResult; SURROUNDING_INSTRS_NUM],
    pub syscall_addr: ProcAddr,
    /// Offset of the `ecall` within the object file, i.e. relative to
    /// `text_offset`, not to the in-memory `.text` mapping.
    pub syscall_offset: u64,
    /// Index of the `ecall` within `surrounding_instrs` (`SYSCALL_IDX`,
    /// except for sites trailing `.text` whose window is short).
    pub syscall_idx: u8,
}

/// Disassembles every instruction in `desc`'s `.text`, recording each
/// `ecall` site found and marking any AUIPC-relative jump target that
/// decoding turns up along the way.
///
/// # Safety
///
/// `desc.text_start..=desc.text_end` must be mapped, readable memory
/// belonging to the object at `desc.path` loaded at `desc.base_addr` --
/// the live in-process mapping of the library being intercepted, not
/// merely the bytes read from disk to build `desc`.
pub unsafe fn crawl_text(desc: &mut ElfDescriptor, rvc: RvcMode) -> Vec<CrawledSyscall> {
    let ctx = DisasmContext::new(rvc);
    let len = desc.text_end.offset_from(desc.text_start) as usize + 1;
    let code = unsafe { slice::from_raw_parts(desc.text_start.as_ptr(), len) };

    let mut surr = [InterceptDisasmResult::default(); SURROUNDING_INSTRS_NUM];
    let mut patches = Vec::new();

    let mut pos = 0usize;
    while pos < len {
        let address = desc.text_start + pos;
        let result = ctx.next_instruction(&code[pos..], address);

        if result.length == 0 {
            pos += 1;
            continue;
        }

        if result.has_ip_relative_opr {
            if let Some(target) = result.rip_ref_addr {
                desc.mark_jump(target);
            }
        }

        if surr[SYSCALL_IDX].is_syscall {
            patches.push(fill_up_patch(desc, &surr, SYSCALL_IDX as u8));
        }

        surr.rotate_left(1);
        surr[SURROUNDING_INSTRS_NUM - 1] = result;

        pos += result.length as usize;
    }

    // The last SURROUNDING_INSTRS_NUM - SYSCALL_IDX instructions in .text
    // never got a chance to reach SYSCALL_IDX before the loop above ended,
    // so any ecall among them is checked here, re-centering the window.
    for i in SYSCALL_IDX..SURROUNDING_INSTRS_NUM {
        if !surr[i].is_syscall {
            continue;
        }

        let offset = i - SYSCALL_IDX;
        if offset > 0 {
            surr.rotate_left(offset);
            for slot in &mut surr[SURROUNDING_INSTRS_NUM - offset..] {
                *slot = InterceptDisasmResult::default();
            }
        }

        // Re-centering (above) moves the ecall to SYSCALL_IDX exactly as
        // the main-loop case does, so it's recorded the same way here --
        // not at its pre-centering position `i`, which after the shift
        // would no longer hold the ecall at all for offset >= 4.
        patches.push(fill_up_patch(desc, &surr, SYSCALL_IDX as u8));
    }

    patches
}

fn fill_up_patch(
    desc: &ElfDescriptor,
    surr: &[InterceptDisasmResult; SURROUNDING_INSTRS_NUM],
    syscall_idx: u8,
) -> CrawledSyscall {
    let syscall_addr = surr[syscall_idx as usize]
        .address
        .expect("the ecall slot of a reported syscall is always a decoded instruction");
    let syscall_offset =
        (syscall_addr.offset_from(desc.text_start) as u64).wrapping_add(desc.text_offset);

    CrawledSyscall { surrounding_instrs: *surr, syscall_addr, syscall_offset, syscall_idx }
}
