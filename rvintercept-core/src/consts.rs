//! Instruction sizes, reach limits, and stack-frame offsets shared by every
//! component. Mirrors `rv_encode.h` / `patch_offsets.h` / `intercept.h` from
//! the upstream C implementation this crate's planner is grounded on.

/// RISC-V general-purpose register numbers, named per the standard ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Zero = 0,
    Ra = 1,
    Sp = 2,
    Gp = 3,
    Tp = 4,
    T0 = 5,
    T1 = 6,
    T2 = 7,
    S0 = 8,
    S1 = 9,
    A0 = 10,
    A1 = 11,
    A2 = 12,
    A3 = 13,
    A4 = 14,
    A5 = 15,
    A6 = 16,
    A7 = 17,
    S2 = 18,
    S3 = 19,
    S4 = 20,
    S5 = 21,
    S6 = 22,
    S7 = 23,
    S8 = 24,
    S9 = 25,
    S10 = 26,
    S11 = 27,
    T3 = 28,
    T4 = 29,
    T5 = 30,
    T6 = 31,
}

impl Reg {
    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(v: u8) -> Option<Reg> {
        use Reg::*;
        const ALL: [Reg; 32] = [
            Zero, Ra, Sp, Gp, Tp, T0, T1, T2, S0, S1, A0, A1, A2, A3, A4, A5, A6, A7, S2, S3, S4,
            S5, S6, S7, S8, S9, S10, S11, T3, T4, T5, T6,
        ];
        ALL.get(v as usize).copied()
    }
}

/// Whether the target supports the RISC-V "C" (compressed) extension. This
/// crate decides this once per process rather than at compile time (the
/// upstream C implementation used `#ifdef __riscv_c`), since the object
/// being patched is inspected, not the host building this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RvcMode(pub bool);

impl RvcMode {
    pub const ENABLED: RvcMode = RvcMode(true);
    pub const DISABLED: RvcMode = RvcMode(false);

    pub fn is_enabled(self) -> bool {
        self.0
    }
}

pub const RV_INS_SIZE: u8 = 4;
pub const RVC_INS_SIZE: u8 = 2;

pub const LUI_INS_SIZE: u8 = RV_INS_SIZE;
pub const ADDI_INS_SIZE: u8 = RV_INS_SIZE;
pub const ADDIW_INS_SIZE: u8 = RV_INS_SIZE;
pub const ECALL_INS_SIZE: u8 = RV_INS_SIZE;
pub const JAL_INS_SIZE: u8 = RV_INS_SIZE;
pub const JALR_INS_SIZE: u8 = RV_INS_SIZE;
pub const AUIPC_INS_SIZE: u8 = RV_INS_SIZE;

pub const JUMP_2GB_INS_SIZE: u32 = AUIPC_INS_SIZE as u32 + JALR_INS_SIZE as u32;

/// Worst case size of `rvp_jump_abs`: LUI + ADDIW + SLLI + ADDI + SLLI + JALR,
/// all non-compressed. The true emitted size depends on the destination and
/// is computed at encode time; this is only the upper bound used for
/// relocation-area sizing (`MAX_P_INS_SIZE`).
pub const JUMP_ABS_INS_SIZE: u32 = LUI_INS_SIZE as u32
    + ADDIW_INS_SIZE as u32
    + RV_INS_SIZE as u32 // slli
    + ADDI_INS_SIZE as u32
    + RV_INS_SIZE as u32 // slli
    + JALR_INS_SIZE as u32;

/// `JAL_MID_REACH` lies in between +/- offset: the positive offset is
/// `0xffffe` and the negative is `0x100000`; the bias of 2 is JAL's implicit
/// low bit.
pub const JAL_MID_REACH: i32 = 0xfffff;

/// Applies to the negative offset; the positive offset is
/// `JUMP_2GB_POS_REACH` due to 2's-complement bias and the AUIPC shift.
pub const JUMP_2GB_NEG_REACH: i64 = i32::MIN as i64;
pub const JUMP_2GB_POS_REACH: i64 = i32::MAX as i64 - 0xfff;

pub const MAX_PC_INS_SIZE: u32 = RV_INS_SIZE as u32;
/// Max size of the biggest pseudo instruction, `rvp_jump_abs`.
pub const MAX_P_INS_SIZE: u32 = JUMP_ABS_INS_SIZE;

pub const PAGE_SIZE: usize = 0x1000;

pub const INTERCEPTOR_EXIT_CODE: i32 = 111;

pub const SURROUNDING_INSTRS_NUM: usize = 13;
pub const SYSCALL_IDX: usize = 6;

/// Sizes of instructions whose width depends on whether RVC is enabled.
pub struct RvcSizes {
    pub c_nop: u32,
    pub modify_sp: u32,
    pub store_load: u32,
    pub slli: u32,
}

impl RvcSizes {
    pub fn for_mode(rvc: RvcMode) -> RvcSizes {
        if rvc.is_enabled() {
            RvcSizes {
                c_nop: RVC_INS_SIZE as u32,
                modify_sp: RVC_INS_SIZE as u32,
                store_load: RVC_INS_SIZE as u32,
                slli: RVC_INS_SIZE as u32,
            }
        } else {
            RvcSizes {
                c_nop: 0,
                modify_sp: RV_INS_SIZE as u32,
                store_load: RV_INS_SIZE as u32,
                slli: RV_INS_SIZE as u32,
            }
        }
    }

    pub fn type_mid_size(&self) -> u32 {
        self.modify_sp + self.store_load + JAL_INS_SIZE as u32 + self.store_load + self.modify_sp
    }

    pub fn type_gw_size(&self) -> u32 {
        self.modify_sp + self.store_load + JUMP_2GB_INS_SIZE + self.store_load + self.modify_sp
    }

    pub fn trampoline_size(&self) -> u32 {
        self.modify_sp + self.store_load + JUMP_ABS_INS_SIZE
    }

    pub fn direct_jump_offset(&self) -> u32 {
        self.store_load + self.modify_sp
    }
}

/// Stack-frame offsets the emitted patch prologue agrees with the (external)
/// assembly stub on. See SPEC_FULL.md §6.1.
pub mod patch_offsets {
    pub const PATCH_SP_OFF: i32 = 48;
    pub const ORIG_RA_OFF: i32 = 0;
    pub const MID_ORIG_RA_OFF: i32 = 8;
    pub const RET_ADDR_OFF: i32 = 16;
    pub const RELOC_ADDR_OFF: i32 = 24;
    pub const UNUSED_OFF1: i32 = 32;
    pub const UNUSED_OFF2: i32 = 40;
}

/// Tagged syscall-number sentinels mirroring the original's `TYPE_GW`/`TYPE_MID`
/// int16_t sentinel encoding. Kept here only as documentation of the magic
/// numbers; `crate::patch::PatchShape` is the sum type a port should use
/// instead (per SPEC_FULL.md's design notes).
pub const TYPE_GW: i16 = -2;
pub const TYPE_MID: i16 = -1;

pub fn round_down_address(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
