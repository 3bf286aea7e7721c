mod addr;
mod config;
mod consts;
mod crawler;
mod disasm;
mod elf;
mod emit;
mod encode;
mod error;
mod maps;
mod patch;

pub use addr::{ElfVa, ProcAddr};
pub use config::InterceptConfig;
pub use consts::{Reg, RvcMode, RvcSizes, SURROUNDING_INSTRS_NUM, SYSCALL_IDX};
pub use crawler::{crawl_text, CrawledSyscall};
pub use disasm::{DisasmContext, InterceptDisasmResult};
pub use elf::ElfDescriptor;
pub use emit::{allocate_trampoline, apply_patch, find_trampoline_guess, min_mmap_address};
pub use encode::{
    rv_addi, rv_addiw, rv_auipc, rv_jal, rv_jalr, rv_ld, rv_lui, rv_sd, rv_slli, rvc_addi,
    rvc_addi16sp, rvc_addiw, rvc_jalr, rvc_jr, rvc_ldsp, rvc_li, rvc_nop, rvc_sdsp, rvc_slli,
    rvp_jal, rvp_jump_2gb, rvp_jump_abs, rvp_ld_from_sym, rvp_sd_to_sym, rvpc_addi, rvpc_addisp,
    rvpc_addiw, rvpc_jalr, rvpc_ldsp, rvpc_li, rvpc_sdsp, rvpc_slli,
};
pub use error::{ElfError, PatchError, UnsafeReason};
pub use maps::{parse_proc_maps, MemoryRegion};
pub use patch::{plan_patch, PatchDesc, PatchShape};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rvc_mode_round_trips() {
        assert!(RvcMode::ENABLED.is_enabled());
        assert!(!RvcMode::DISABLED.is_enabled());
    }
}
