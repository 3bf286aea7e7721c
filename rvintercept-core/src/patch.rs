//! Patch shape selection (§4.5). The upstream `patcher.c` that would have
//! implemented this was never retrieved alongside the rest of the C sources
//! this crate is grounded on (see DESIGN.md); this module is built directly
//! from SPEC_FULL.md's prose description of the three shapes and their
//! selection rules, cross-checked against the sizes `consts::RvcSizes`
//! derives from `rv_encode.h`'s macros.

use crate::addr::ProcAddr;
use crate::consts::{Reg, RvcMode, RvcSizes, RV_INS_SIZE};
use crate::crawler::CrawledSyscall;
use crate::disasm::InterceptDisasmResult;
use crate::elf::ElfDescriptor;
use crate::encode::{rv_jal, rvp_jump_2gb};
use crate::error::{PatchError, UnsafeReason};

/// Which of the three overwrite shapes a site was patched with, and how
/// `a7` (the syscall number) reaches the stub. Replaces the source's
/// `int16_t syscall_num` sentinel encoding (`-2` = GW, `-1` = MID, `>= 0` =
/// SML's static value) with an explicit sum type, per SPEC_FULL.md's design
/// note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchShape {
    /// `ecall` plus (usually) one trailing register-setter; `a7` is read
    /// from the live register by the stub.
    Gw,
    /// Short `JAL` to a shared per-library gateway, which performs the same
    /// `JUMP_2GB` the gateway itself would have. `a7` still comes from the
    /// live register.
    Mid,
    /// `a7` is a static immediate recovered from the instruction window;
    /// no relocation is needed beyond the `ecall` itself.
    Sml { a7: i16 },
}

/// A fully planned patch site: where to write, what shape, and what must be
/// relocated. Produced by [`plan_patch`] from a [`CrawledSyscall`].
#[derive(Debug, Clone)]
pub struct PatchDesc {
    pub shape: PatchShape,
    pub syscall_addr: ProcAddr,
    pub syscall_offset: u64,
    pub syscall_idx: u8,
    /// First byte overwritten in `.text`, excluding any leading `c.nop`.
    pub dst_jmp_patch: ProcAddr,
    pub patch_size_bytes: u8,
    pub start_with_c_nop: bool,
    pub end_with_c_nop: bool,
    /// True if `ra` is read or written by any instruction preceding the
    /// `ecall` within the crawled window; if so the gateway/trampoline must
    /// not assume `ra` is free to clobber on its way in.
    pub is_ra_used_before: bool,
    /// Register the patch prologue uses to hold the return linkage back
    /// into the relocated block; `ra` unless `is_ra_used_before`.
    pub return_register: Reg,
    /// Instructions displaced by the overwrite, in original order, minus
    /// the `ecall` itself (which the stub replaces, not relocates).
    pub displaced: Vec<InterceptDisasmResult>,
}

struct Window {
    lo: usize,
    hi: usize,
    size_bytes: u32,
}

/// Plans a patch for one crawled `ecall` site.
pub fn plan_patch(
    crawled: &CrawledSyscall,
    desc: &ElfDescriptor,
    rvc: RvcMode,
    trampoline: ProcAddr,
) -> Result<PatchDesc, PatchError> {
    let surr = &crawled.surrounding_instrs;
    let idx = crawled.syscall_idx as usize;
    let sizes = RvcSizes::for_mode(rvc);

    let sml = sml_candidate(surr, idx);

    // A window that can't be grown large enough, or is blocked immediately
    // by an unsafe neighbor, just disqualifies that shape; only a genuine
    // `UnsafeSite` is worth preserving as the reason if every shape fails.
    let mut last_unsafe = None;
    let mut try_window = |needed: u32| match select_window(desc, surr, idx, needed) {
        Ok(w) => Some(w),
        Err(e) => {
            last_unsafe = Some(e);
            None
        }
    };

    let gw_window = try_window(sizes.type_gw_size());
    let gw_ok = gw_window.as_ref().is_some_and(|w| {
        let dst = surr[w.lo].address.expect("window bounds only ever include decoded instructions");
        rvp_jump_2gb(&mut [0u8; 8], rvc, Reg::T0, Reg::T0, dst.0 as u64, trampoline.0 as u64) != 0
    });

    let mid_window = try_window(sizes.type_mid_size());
    let mid_ok = mid_window.as_ref().is_some_and(|w| {
        let dst = surr[w.lo].address.expect("window bounds only ever include decoded instructions");
        rv_jal(&mut [0u8; 4], Reg::Ra, trampoline.offset_from(dst) as i32) != 0
    });

    // Rule 3: GW/MID preferred over SML whenever either fits; MID is the
    // smaller of the two and wins when both are reachable.
    let (shape, window) = if mid_ok {
        (PatchShape::Mid, mid_window.unwrap())
    } else if gw_ok {
        (PatchShape::Gw, gw_window.unwrap())
    } else if let Some(a7) = sml {
        match try_window(RV_INS_SIZE as u32) {
            Some(w) => (PatchShape::Sml { a7 }, w),
            None => {
                let err = last_unsafe.unwrap_or(PatchError::Structural(
                    "no room for SML overwrite".into(),
                ));
                log::warn!("skipping ecall at {}: {err}", crawled.syscall_addr);
                return Err(err);
            }
        }
    } else {
        let err = last_unsafe.unwrap_or(PatchError::Structural(
            "neither GW, MID, nor SML is reachable or fits at this site".into(),
        ));
        log::warn!("skipping ecall at {}: {err}", crawled.syscall_addr);
        return Err(err);
    };

    build_patch_desc(crawled, surr, idx, shape, window, &sizes)
}

/// Rule 1: walk backwards from the instruction just before `ecall`. A
/// modified `a7` anywhere along the way disqualifies SML outright; the
/// first predecessor found to load a static value becomes the candidate.
fn sml_candidate(surr: &[InterceptDisasmResult], idx: usize) -> Option<i16> {
    for r in surr[..idx].iter().rev() {
        if !r.is_set {
            continue;
        }
        if r.is_a7_modified {
            return None;
        }
        if r.a7_set >= 0 {
            return Some(r.a7_set);
        }
    }
    None
}

/// Greedily grows a window centered on `idx` until it holds at least
/// `needed` bytes, alternating towards the following instructions first
/// (mirroring the GW/MID epilogue naturally sitting after the `ecall`) and
/// falling back to preceding ones. Refuses (rule 4) to cross a jump-target
/// interior or swallow an `AUIPC`; running out of `.text` on both sides
/// before reaching `needed` is a separate, non-safety failure.
fn select_window(
    desc: &ElfDescriptor,
    surr: &[InterceptDisasmResult],
    idx: usize,
    needed: u32,
) -> Result<Window, PatchError> {
    let ecall = surr[idx];
    if !ecall.is_set {
        return Err(PatchError::Structural("ecall slot is not a decoded instruction".into()));
    }

    let mut lo = idx;
    let mut hi = idx;
    let mut size_bytes = ecall.length as u32;

    loop {
        if size_bytes >= needed {
            return Ok(Window { lo, hi, size_bytes });
        }

        let can_extend_hi = hi + 1 < surr.len() && surr[hi + 1].is_set;
        let can_extend_lo = lo > 0 && surr[lo - 1].is_set;

        if !can_extend_hi && !can_extend_lo {
            return Err(PatchError::Structural(
                "surrounding window exhausted before reaching the required overwrite size".into(),
            ));
        }

        if can_extend_hi && extend_is_safe(desc, surr, lo, hi + 1) {
            let r = surr[hi + 1];
            size_bytes += r.length as u32;
            hi += 1;
            continue;
        }

        if can_extend_lo && extend_is_safe(desc, surr, lo - 1, hi) {
            let r = surr[lo - 1];
            size_bytes += r.length as u32;
            lo -= 1;
            continue;
        }

        // Both candidate extensions are blocked by rule 4 or an AUIPC.
        return Err(PatchError::UnsafeSite(unsafe_reason(surr, lo, hi)));
    }
}

/// True if growing the window to `[new_lo, new_hi]` doesn't add an `AUIPC`
/// or cross a jump destination other than at the window's first byte.
fn extend_is_safe(
    desc: &ElfDescriptor,
    surr: &[InterceptDisasmResult],
    new_lo: usize,
    new_hi: usize,
) -> bool {
    for (i, r) in surr[new_lo..=new_hi].iter().enumerate() {
        if !r.is_set {
            return false;
        }
        if r.has_ip_relative_opr && r.address.is_some() {
            // has_ip_relative_opr is AUIPC-only after disasm's quirk (§9).
            return false;
        }
        if i > 0 {
            if let Some(addr) = r.address {
                if desc.has_jump(addr) {
                    return false;
                }
            }
        }
    }
    true
}

/// Which of rule 4's two hazards is blocking further growth of `[lo, hi]`,
/// for error reporting once both directions have been ruled out.
fn unsafe_reason(surr: &[InterceptDisasmResult], lo: usize, hi: usize) -> UnsafeReason {
    let neighbor = |i: usize| surr.get(i).copied();
    let blocked_by_auipc = [neighbor(hi + 1), lo.checked_sub(1).and_then(neighbor)]
        .into_iter()
        .flatten()
        .any(|r| r.is_set && r.has_ip_relative_opr);
    if blocked_by_auipc {
        UnsafeReason::ContainsAuipc
    } else {
        UnsafeReason::ClobbersJumpTarget
    }
}

fn build_patch_desc(
    crawled: &CrawledSyscall,
    surr: &[InterceptDisasmResult; crate::consts::SURROUNDING_INSTRS_NUM],
    idx: usize,
    shape: PatchShape,
    window: Window,
    sizes: &RvcSizes,
) -> Result<PatchDesc, PatchError> {
    let is_ra_used_before = surr[..idx].iter().any(|r| r.is_set && r.is_ra_used);
    let return_register = if is_ra_used_before { Reg::T0 } else { Reg::Ra };

    let dst_jmp_patch =
        surr[window.lo].address.expect("window bounds only ever include decoded instructions");

    // The window grows in whole-instruction steps, so it can overshoot the
    // shape's own instruction bytes; the remainder is filled with c.nop so
    // the overwrite region still ends exactly where the last displaced
    // instruction used to. Padding lands on whichever side grew further.
    let shape_size = match shape {
        PatchShape::Sml { .. } => crate::consts::RV_INS_SIZE as u32,
        PatchShape::Mid => sizes.type_mid_size(),
        PatchShape::Gw => sizes.type_gw_size(),
    };
    let gap = window.size_bytes.saturating_sub(shape_size);
    let start_with_c_nop = gap > 0 && (idx - window.lo) > (window.hi - idx);
    let end_with_c_nop = gap > 0 && !start_with_c_nop;

    let patch_size_bytes = window.size_bytes as u8;

    let displaced = surr[window.lo..=window.hi]
        .iter()
        .enumerate()
        .filter(|&(i, r)| window.lo + i != idx && r.is_set)
        .map(|(_, r)| *r)
        .collect();

    Ok(PatchDesc {
        shape,
        syscall_addr: crawled.syscall_addr,
        syscall_offset: crawled.syscall_offset,
        syscall_idx: crawled.syscall_idx,
        dst_jmp_patch,
        patch_size_bytes,
        start_with_c_nop,
        end_with_c_nop,
        is_ra_used_before,
        return_register,
        displaced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{SURROUNDING_INSTRS_NUM, SYSCALL_IDX};

    fn blank_window() -> [InterceptDisasmResult; SURROUNDING_INSTRS_NUM] {
        [InterceptDisasmResult::default(); SURROUNDING_INSTRS_NUM]
    }

    fn set(r: &mut InterceptDisasmResult, addr: u64, length: u8) {
        r.is_set = true;
        r.address = Some(ProcAddr(addr as usize));
        r.length = length;
        r.a7_set = -1;
    }

    #[test]
    fn sml_candidate_found_when_a7_loaded_and_untouched() {
        let mut surr = blank_window();
        set(&mut surr[4], 0x1000, 4);
        surr[4].a7_set = 64;
        set(&mut surr[5], 0x1004, 4);
        set(&mut surr[6], 0x1008, 4);

        assert_eq!(sml_candidate(&surr, 6), Some(64));
    }

    #[test]
    fn sml_disqualified_when_a7_modified_before_static_load() {
        let mut surr = blank_window();
        set(&mut surr[3], 0x1000, 4);
        surr[3].a7_set = 64;
        set(&mut surr[5], 0x1008, 4);
        surr[5].is_a7_modified = true;
        set(&mut surr[6], 0x100c, 4);

        assert_eq!(sml_candidate(&surr, 6), None);
    }

    #[test]
    fn select_window_grows_forward_first() {
        let mut surr = blank_window();
        for (i, r) in surr.iter_mut().enumerate() {
            set(r, 0x1000 + (i as u64) * 4, 4);
        }
        let desc = ElfDescriptor::for_test(ProcAddr(0x1000), ProcAddr(0x1000 + 13 * 4 - 1));

        let w = select_window(&desc, &surr, 6, 12).unwrap();
        assert!(w.size_bytes >= 12);
        assert!(w.hi > 6, "should have grown past the ecall towards later instructions first");
    }

    #[test]
    fn select_window_refuses_to_cross_jump_target() {
        let mut surr = blank_window();
        for (i, r) in surr.iter_mut().enumerate() {
            set(r, 0x1000 + (i as u64) * 4, 4);
        }
        let mut desc = ElfDescriptor::for_test(ProcAddr(0x1000), ProcAddr(0x1000 + 13 * 4 - 1));
        // Mark instruction 8's address as a jump target: the window must
        // not grow to include index 8 in its interior.
        desc.mark_jump(ProcAddr(0x1000 + 8 * 4));

        // 100 bytes can't be satisfied without crossing index 8's interior
        // (forward) once the backward side also runs out at index 0.
        match select_window(&desc, &surr, 6, 100) {
            Err(PatchError::UnsafeSite(UnsafeReason::ClobbersJumpTarget)) => {}
            other => panic!("expected a jump-target hazard, got {other:?}"),
        }
    }

    fn crawled_over(text_start: ProcAddr) -> (CrawledSyscall, ElfDescriptor) {
        let mut surr = blank_window();
        for (i, r) in surr.iter_mut().enumerate() {
            set(r, text_start.0 as u64 + (i as u64) * 4, 4);
        }
        surr[SYSCALL_IDX].is_syscall = true;
        let desc = ElfDescriptor::for_test(text_start, text_start + (13 * 4 - 1));
        let crawled = CrawledSyscall {
            surrounding_instrs: surr,
            syscall_addr: ProcAddr(text_start.0 + SYSCALL_IDX * 4),
            syscall_offset: (SYSCALL_IDX * 4) as u64,
            syscall_idx: SYSCALL_IDX as u8,
        };
        (crawled, desc)
    }

    #[test]
    fn plan_patch_prefers_mid_when_gateway_in_jal_reach() {
        let text_start = ProcAddr(0x1_0000);
        let (crawled, desc) = crawled_over(text_start);
        let trampoline = text_start + 0x200usize;

        let planned = plan_patch(&crawled, &desc, RvcMode::DISABLED, trampoline).unwrap();
        assert_eq!(planned.shape, PatchShape::Mid);
    }

    #[test]
    fn plan_patch_falls_back_to_sml_when_trampoline_unreachable() {
        let text_start = ProcAddr(0x1_0000);
        let (mut crawled, desc) = crawled_over(text_start);
        crawled.surrounding_instrs[5].a7_set = 64;

        // Four-plus GiB away: out of both rvp_jump_2gb's and rv_jal's reach.
        let trampoline = text_start + 0x1_0001_0000usize;

        let planned = plan_patch(&crawled, &desc, RvcMode::DISABLED, trampoline).unwrap();
        assert_eq!(planned.shape, PatchShape::Sml { a7: 64 });
    }
}
