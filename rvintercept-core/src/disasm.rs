//! RISC-V RV64GC + C decoder, wrapping `capstone` (`CS_ARCH_RISCV`) the same
//! way `disasm_wrapper.c` wraps it for the upstream interceptor. Capstone is
//! asked for full operand detail up front (`CS_OPT_DETAIL`); everything below
//! is just picking the handful of facts the crawler and planner consult back
//! out of an instruction's groups, operands, and implicit register effects:
//! syscalls, control transfers, AUIPC, and `a7`/`ra` dataflow. Floating point
//! and atomic operand semantics are never inspected beyond what's needed to
//! keep integer register tracking correct.

use capstone::arch::riscv::{ArchExtraMode, ArchMode as RiscVMode, RiscVInsn, RiscVInsnGroup, RiscVOperand, RiscVReg};
use capstone::arch::{ArchDetail, BuildsCapstone, BuildsCapstoneExtraMode};
use capstone::{Capstone, InsnId, RegId};

use crate::addr::ProcAddr;
use crate::consts::{Reg, RvcMode};

#[derive(Debug, Clone, Copy, Default)]
pub struct InterceptDisasmResult {
    pub address: Option<ProcAddr>,
    pub is_set: bool,
    pub is_syscall: bool,
    /// Decoded length in bytes (2 or 4), or 0 if decoding failed.
    pub length: u8,
    pub has_ip_relative_opr: bool,
    pub is_abs_jump: bool,
    pub rip_disp: i32,
    pub rip_ref_addr: Option<ProcAddr>,
    /// Immediate loaded into a7 by this instruction, or -1 if none.
    pub a7_set: i16,
    pub is_a7_modified: bool,
    pub is_ra_used: bool,
    pub reg_set: Option<Reg>,
    /// Mirrors the char array `disasm_wrapper.c` copies the mnemonic into,
    /// since capstone reuses one scratch buffer across instructions and
    /// won't outlive a single `next_instruction` call otherwise.
    #[cfg(debug_assertions)]
    pub mnemonic: [u8; 16],
}

impl InterceptDisasmResult {
    fn failed(address: ProcAddr) -> InterceptDisasmResult {
        InterceptDisasmResult {
            address: Some(address),
            a7_set: -1,
            ..Default::default()
        }
    }
}

pub struct DisasmContext {
    cs: Capstone,
}

impl DisasmContext {
    pub fn new(rvc: RvcMode) -> DisasmContext {
        let builder = Capstone::new().riscv().mode(RiscVMode::RiscV64);
        let builder = if rvc.is_enabled() {
            builder.extra_mode(std::iter::once(ArchExtraMode::RiscVC))
        } else {
            builder
        };
        let cs = builder.detail(true).build().expect("capstone RISC-V support must be built in");
        DisasmContext { cs }
    }

    /// Decodes the instruction starting at `code[0..]`, located at process
    /// address `address`. Mirrors `intercept_disasm_next_instruction`: on
    /// failure, `length` is 0 and the caller is expected to retry one byte
    /// further in.
    pub fn next_instruction(&self, code: &[u8], address: ProcAddr) -> InterceptDisasmResult {
        if code.is_empty() {
            return InterceptDisasmResult::failed(address);
        }

        let Ok(insns) = self.cs.disasm_count(code, address.0 as u64, 1) else {
            return InterceptDisasmResult::failed(address);
        };
        let Some(insn) = insns.iter().next() else {
            return InterceptDisasmResult::failed(address);
        };
        let Ok(detail) = self.cs.insn_detail(&insn) else {
            return InterceptDisasmResult::failed(address);
        };

        let mut result = InterceptDisasmResult {
            address: Some(address),
            is_set: true,
            length: insn.len() as u8,
            a7_set: -1,
            ..Default::default()
        };

        let id = insn.id();
        result.is_syscall = id == id_of(RiscVInsn::RISCV_INS_ECALL);
        result.is_abs_jump = id == id_of(RiscVInsn::RISCV_INS_JALR)
            || id == id_of(RiscVInsn::RISCV_INS_C_JALR)
            || id == id_of(RiscVInsn::RISCV_INS_C_JR);

        let operands: Vec<RiscVOperand> = match detail.arch_detail() {
            ArchDetail::RiscVDetail(d) => d.operands().collect(),
            _ => Vec::new(),
        };

        // Just check which jump is used here (absolute or relative) and save
        // the destination of the relative jumps.
        if !result.is_abs_jump && is_control_flow(&detail) {
            if let Some(RiscVOperand::Imm(imm)) = operands.last() {
                result.has_ip_relative_opr = true;
                result.rip_disp = *imm as i32;
                result.rip_ref_addr = Some(address + (*imm as i64 as u64));
            }
        }

        // auipc could be patched and relocated, but the absolute address
        // would have to be loaded into a register in the relocation space,
        // which is costly. For now just skip it unless it becomes needed.
        result.has_ip_relative_opr = id == id_of(RiscVInsn::RISCV_INS_AUIPC);

        get_a7(&mut result, id, &operands);
        check_ra(&mut result, &operands);
        check_reg_set(&mut result, id, &operands, &detail);

        #[cfg(debug_assertions)]
        {
            let mut mnemonic = [0u8; 16];
            if let Some(m) = insn.mnemonic() {
                let bytes = m.as_bytes();
                let n = bytes.len().min(mnemonic.len() - 1);
                mnemonic[..n].copy_from_slice(&bytes[..n]);
            }
            result.mnemonic = mnemonic;
        }

        result
    }
}

/// Finds the value of a7 that is used for the TYPE_SML patch, which relies on
/// static analysis to find out which a7 value was set last before ecall.
/// Because of the static nature of TYPE_SML, TYPE_GW and TYPE_MID (both
/// dynamically store the a7 value) are prioritized when choosing the patch.
///
/// The C.LI arm only ever matches when capstone was built in RVC mode --
/// without `CS_MODE_RISCVC` it never decodes a compressed instruction in the
/// first place, so there's no separate runtime flag to check here.
fn get_a7(result: &mut InterceptDisasmResult, id: InsnId, operands: &[RiscVOperand]) {
    let Some(RiscVOperand::Reg(op0)) = operands.first() else {
        return;
    };
    if *op0 != reg_of(RiscVReg::RISCV_REG_A7) {
        return;
    }

    if id == id_of(RiscVInsn::RISCV_INS_C_LI) {
        if let Some(RiscVOperand::Imm(imm)) = operands.get(1) {
            result.a7_set = *imm as i16;
        }
        return;
    }

    if id == id_of(RiscVInsn::RISCV_INS_ADDI) {
        if let Some(RiscVOperand::Reg(rs1)) = operands.get(1) {
            if *rs1 == reg_of(RiscVReg::RISCV_REG_ZERO) {
                if let Some(RiscVOperand::Imm(imm)) = operands.get(2) {
                    result.a7_set = *imm as i16;
                }
                return;
            }
        }
    }

    result.is_a7_modified = true;
}

/// In `asm_entry_point`, ra is used for jumping back and forth between
/// executing preceding and following instructions, so it gets overwritten.
/// That's why it's important to check if any patched instruction uses ra:
/// if it does, the original ra value must be restored before the patched
/// instructions run.
fn check_ra(result: &mut InterceptDisasmResult, operands: &[RiscVOperand]) {
    let ra = reg_of(RiscVReg::RISCV_REG_RA);
    result.is_ra_used = operands.iter().any(|op| matches!(op, RiscVOperand::Reg(r) if *r == ra));
}

/// Helps only the TYPE_SML patch, for the common case of a register being
/// set immediately after ecall: the patching size can then be only 4 bytes
/// (just ecall replaced with jal), because the register set right after
/// ecall is reused for the absolute jump back to glibc.
fn check_reg_set(
    result: &mut InterceptDisasmResult,
    id: InsnId,
    operands: &[RiscVOperand],
    detail: &capstone::InsnDetail,
) {
    if let Some(RiscVOperand::Reg(op0)) = operands.first() {
        let written = detail.regs_write().iter().any(|r| r == op0);
        let read = detail.regs_read().iter().any(|r| r == op0);
        if written && !read {
            result.reg_set = reg_from_capstone(*op0);
            return;
        }
    }
    // ra implicitly overwritten.
    if id == id_of(RiscVInsn::RISCV_INS_C_JAL) {
        result.reg_set = Some(Reg::Ra);
    } else if id == id_of(RiscVInsn::RISCV_INS_C_JALR) {
        let targets_ra = matches!(operands.first(), Some(RiscVOperand::Reg(r)) if *r == reg_of(RiscVReg::RISCV_REG_RA));
        if !targets_ra {
            result.reg_set = Some(Reg::Ra);
        }
    }
}

fn is_control_flow(detail: &capstone::InsnDetail) -> bool {
    const GROUPS: [RiscVInsnGroup; 4] = [
        RiscVInsnGroup::RISCV_GRP_RET,
        RiscVInsnGroup::RISCV_GRP_CALL,
        RiscVInsnGroup::RISCV_GRP_JUMP,
        RiscVInsnGroup::RISCV_GRP_BRANCH_RELATIVE,
    ];
    detail.groups().iter().any(|g| GROUPS.iter().any(|want| g.0 as u32 == *want as u32))
}

fn id_of(insn: RiscVInsn) -> InsnId {
    InsnId(insn as u32)
}

fn reg_of(reg: RiscVReg) -> RegId {
    RegId(reg as u16)
}

/// capstone numbers `X0..X31` consecutively starting at 1 (0 is
/// `RISCV_REG_INVALID`), so the offset from `X0` is exactly the ABI register
/// number our own [`Reg`] uses.
fn reg_from_capstone(id: RegId) -> Option<Reg> {
    let x0 = RiscVReg::RISCV_REG_X0 as u16;
    let x31 = RiscVReg::RISCV_REG_X31 as u16;
    if id.0 < x0 || id.0 > x31 {
        return None;
    }
    Reg::from_raw((id.0 - x0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{rv_jal, rvc_li};

    fn proc(a: u64) -> ProcAddr {
        ProcAddr(a as usize)
    }

    #[test]
    fn recognizes_ecall() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        let bytes = [0x73, 0x00, 0x00, 0x00];
        let r = ctx.next_instruction(&bytes, proc(0x1000));
        assert!(r.is_syscall);
        assert_eq!(r.length, 4);
    }

    #[test]
    fn tracks_a7_from_addi() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        // addi a7, zero, 93 (exit_group-ish immediate)
        let imm: u32 = 93 << 20;
        let rd = Reg::A7.raw() as u32;
        let word = imm | (Reg::Zero.raw() as u32) << 15 | rd << 7 | 0x13;
        let bytes = word.to_le_bytes();
        let r = ctx.next_instruction(&bytes, proc(0x1000));
        assert_eq!(r.a7_set, 93);
    }

    #[test]
    fn tracks_a7_from_compressed_li() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        let mut buf = [0u8; 2];
        rvc_li(&mut buf, Reg::A7, 5);
        let r = ctx.next_instruction(&buf, proc(0x2000));
        assert_eq!(r.length, 2);
        assert_eq!(r.a7_set, 5);
    }

    #[test]
    fn auipc_overrides_jump_flag_quirk() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        // auipc a0, 0
        let word: u32 = (Reg::A0.raw() as u32) << 7 | 0x17;
        let r = ctx.next_instruction(&word.to_le_bytes(), proc(0x3000));
        assert!(r.has_ip_relative_opr);
    }

    #[test]
    fn jal_sets_rip_disp_but_final_flag_is_auipc_only() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        let mut buf = [0u8; 4];
        rv_jal(&mut buf, Reg::Ra, 4);
        let r = ctx.next_instruction(&buf, proc(0x4000));
        assert_eq!(r.rip_disp, 4);
        assert!(!r.has_ip_relative_opr);
    }

    #[test]
    fn jalr_and_cjr_are_abs_jumps() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        let word: u32 = ((Reg::T0.raw() as u32) << 15) | 0x67;
        let r = ctx.next_instruction(&word.to_le_bytes(), proc(0x5000));
        assert!(r.is_abs_jump);
    }

    #[test]
    fn reg_set_tracks_distinct_destination() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        // add a0, a1, a2 -- rd != rs1, so reg_set should be a0.
        let word: u32 = (Reg::A2.raw() as u32) << 20
            | (Reg::A1.raw() as u32) << 15
            | (Reg::A0.raw() as u32) << 7
            | 0x33;
        let r = ctx.next_instruction(&word.to_le_bytes(), proc(0x6000));
        assert_eq!(r.reg_set, Some(Reg::A0));
    }

    #[test]
    fn reg_set_ignores_self_referential_rvc_addi() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        // c.addi a7, 4 -- destructive rd=rd+imm, must not report reg_set
        // even though it writes a7 (is_a7_modified still fires separately).
        let rd = Reg::A7.raw() as u16;
        let half: u16 = (rd << 7) | (4u16 << 2) | 0b01;
        let r = ctx.next_instruction(&half.to_le_bytes(), proc(0x8000));
        assert_eq!(r.reg_set, None);
        assert!(r.is_a7_modified);
    }

    #[test]
    fn reg_set_tracks_pure_write_lui() {
        let ctx = DisasmContext::new(RvcMode::ENABLED);
        // lui a0, 1
        let word: u32 = (1u32 << 12) | (Reg::A0.raw() as u32) << 7 | 0x37;
        let r = ctx.next_instruction(&word.to_le_bytes(), proc(0x9000));
        assert_eq!(r.reg_set, Some(Reg::A0));
    }

    #[test]
    fn decode_failure_reports_zero_length() {
        let ctx = DisasmContext::new(RvcMode::DISABLED);
        // A compressed-form halfword with RVC disabled must fail to decode.
        let bytes = [0x01, 0x00, 0x00, 0x00];
        let r = ctx.next_instruction(&bytes, proc(0x7000));
        assert_eq!(r.length, 0);
        assert!(!r.is_set);
    }
}
