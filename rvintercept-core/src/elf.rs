//! ELF descriptor and jump-destination bitmap: the static analysis that
//! happens once per target object, before any disassembly. Grounded in
//! `intercept_desc.c`'s `find_sections`/`allocate_jump_table`/
//! `find_jumps_in_section_syms`/`find_jumps_in_section_rela`, reimplemented
//! against `goblin` instead of hand-parsed `Elf64_Shdr` arrays.

use std::path::{Path, PathBuf};

use goblin::elf::reloc::{RelocSection, R_X86_64_RELATIVE, R_X86_64_RELATIVE64};
use goblin::elf::section_header::{SHT_DYNSYM, SHT_RELA, SHT_SYMTAB};
use goblin::elf::sym::{Symtab, STT_FUNC};
use goblin::elf::Elf;

use crate::addr::{ElfVa, ProcAddr};
use crate::error::ElfError;

/// Bound on how many symbol/rela sections a single object may carry before
/// this is treated as malformed input, mirroring `section_list`'s fixed
/// `headers[0x10]` array in the original.
const MAX_TABLES: usize = 16;

/// Static description of one patched object: where its `.text` lives in
/// this process's address space, and which addresses within it are known
/// jump destinations.
pub struct ElfDescriptor {
    pub path: PathBuf,
    pub base_addr: usize,
    pub text_offset: u64,
    pub text_start: ProcAddr,
    pub text_end: ProcAddr,
    /// Section header index of `.text`, so symbols can be checked against it
    /// rather than just matched by address (`find_jumps_in_section_syms`).
    text_section_index: usize,
    /// 1 bit per 2-byte-aligned offset into `.text` (`allocate_jump_table`).
    jump_table: Vec<u8>,
}

impl ElfDescriptor {
    /// Reads `path` from disk (not the already-mapped copy: only some
    /// segments of a shared object are necessarily resident, and section
    /// headers in particular may not be) and builds the jump-destination
    /// bitmap from its symbol and relocation tables.
    pub fn open(path: &Path, base_addr: usize) -> Result<ElfDescriptor, ElfError> {
        let bytes = std::fs::read(path)?;
        let elf = Elf::parse(&bytes)?;

        let text_section_index = elf
            .section_headers
            .iter()
            .position(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(".text"))
            .ok_or(ElfError::MissingTextSection)?;
        let text = &elf.section_headers[text_section_index];

        let text_start = ProcAddr(base_addr.wrapping_add(text.sh_addr as usize));
        let text_end = text_start + (text.sh_size as usize - 1);
        log::debug!(
            "{}: .text {}..{} ({} bytes)",
            path.display(),
            text_start,
            text_end,
            text.sh_size
        );

        let mut desc = ElfDescriptor {
            path: path.to_path_buf(),
            base_addr,
            text_offset: text.sh_offset,
            text_start,
            text_end,
            text_section_index,
            jump_table: allocate_jump_table(text_start, text_end),
        };

        let mut table_count = 0usize;
        for sh in &elf.section_headers {
            match sh.sh_type {
                SHT_SYMTAB | SHT_DYNSYM => {
                    table_count += 1;
                    if table_count > MAX_TABLES {
                        return Err(ElfError::TooManyTables { kind: "symbol", limit: MAX_TABLES });
                    }
                    let count = (sh.sh_size / sh.sh_entsize.max(1)) as usize;
                    let symtab = Symtab::parse(&bytes, sh.sh_offset as usize, count, elf.ctx)?;
                    log::debug!("symbol table #{table_count}: {count} entries");
                    desc.mark_function_symbols(&symtab);
                }
                _ => {}
            }
        }

        let mut rela_count = 0usize;
        for sh in &elf.section_headers {
            if sh.sh_type != SHT_RELA {
                continue;
            }
            rela_count += 1;
            if rela_count > MAX_TABLES {
                return Err(ElfError::TooManyTables { kind: "rela", limit: MAX_TABLES });
            }
            let relocs =
                RelocSection::parse(&bytes, sh.sh_offset as usize, sh.sh_size as usize, true, elf.ctx)?;
            log::debug!("rela section #{rela_count}: {} entries", relocs.iter().count());
            desc.mark_relative_relocations(&relocs);
        }

        Ok(desc)
    }

    fn mark_function_symbols(&mut self, symtab: &Symtab) {
        for sym in symtab.iter() {
            if sym.st_type() != STT_FUNC {
                continue;
            }
            if sym.st_shndx != self.text_section_index {
                continue;
            }
            let va = ElfVa(sym.st_value);
            let addr = va.to_proc(self.base_addr);
            self.mark_jump(addr);
            if sym.st_size != 0 {
                self.mark_jump(addr + sym.st_size as usize);
            }
        }
    }

    fn mark_relative_relocations(&mut self, relocs: &RelocSection) {
        for reloc in relocs.iter() {
            if matches!(reloc.r_type, R_X86_64_RELATIVE | R_X86_64_RELATIVE64) {
                let addr = ElfVa(reloc.r_addend.unwrap_or(0) as u64).to_proc(self.base_addr);
                self.mark_jump(addr);
            }
        }
    }

    /// True if `addr` is a known jump destination in `.text`.
    pub fn has_jump(&self, addr: ProcAddr) -> bool {
        if addr < self.text_start || addr > self.text_end {
            return false;
        }
        let offset = addr.offset_from(self.text_start) as u64;
        is_bit_set(&self.jump_table, offset)
    }

    /// Marks `addr` as a jump destination, a no-op outside `.text`.
    pub fn mark_jump(&mut self, addr: ProcAddr) {
        if addr < self.text_start || addr > self.text_end {
            return;
        }
        let offset = addr.offset_from(self.text_start) as u64;
        set_bit(&mut self.jump_table, offset);
    }

    /// Builds a descriptor around an arbitrary in-memory range with no
    /// backing file, for tests in this crate that need to crawl a buffer
    /// they control directly rather than a real object on disk.
    #[cfg(test)]
    pub(crate) fn for_test(text_start: ProcAddr, text_end: ProcAddr) -> ElfDescriptor {
        ElfDescriptor {
            path: PathBuf::new(),
            base_addr: 0,
            text_offset: 0,
            text_start,
            text_end,
            text_section_index: 0,
            jump_table: allocate_jump_table(text_start, text_end),
        }
    }
}

fn allocate_jump_table(text_start: ProcAddr, text_end: ProcAddr) -> Vec<u8> {
    let bytes = text_end.offset_from(text_start) as usize + 1;
    vec![0u8; bytes / 16 + 1]
}

fn is_bit_set(table: &[u8], offset: u64) -> bool {
    table[(offset / 16) as usize] & (1 << (offset / 2 % 8)) != 0
}

fn set_bit(table: &mut [u8], offset: u64) {
    table[(offset / 16) as usize] |= 1 << (offset / 2 % 8);
}
