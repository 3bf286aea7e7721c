//! Builds a minimal ELF64 RV64 relocatable object entirely in memory --
//! header, one `.text` section, one symbol table, one string table, one
//! section-header string table -- and exercises `ElfDescriptor::open` +
//! `crawl_text` against it end to end, in the spirit of the teacher's
//! hand-constructed-input style of test (`test_parse_maps_line` builds a
//! fake `/proc/self/maps` line rather than reading a real one).

use rvintercept_core::{crawl_text, rv_addi, rv_jalr, CrawledSyscall, ElfDescriptor, Reg, RvcMode, SYSCALL_IDX};

const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const STT_FUNC: u8 = 2;
const STB_GLOBAL: u8 = 1;
const EM_RISCV: u16 = 243;
const ET_REL: u16 = 1;

struct StrTab {
    buf: Vec<u8>,
}

impl StrTab {
    fn new() -> StrTab {
        StrTab { buf: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let off = self.buf.len() as u32;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        off
    }
}

#[allow(clippy::too_many_arguments)]
fn section_header(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
) -> Vec<u8> {
    let mut v = Vec::with_capacity(64);
    v.extend_from_slice(&name.to_le_bytes());
    v.extend_from_slice(&sh_type.to_le_bytes());
    v.extend_from_slice(&flags.to_le_bytes());
    v.extend_from_slice(&addr.to_le_bytes());
    v.extend_from_slice(&offset.to_le_bytes());
    v.extend_from_slice(&size.to_le_bytes());
    v.extend_from_slice(&link.to_le_bytes());
    v.extend_from_slice(&info.to_le_bytes());
    v.extend_from_slice(&addralign.to_le_bytes());
    v.extend_from_slice(&entsize.to_le_bytes());
    v
}

fn sym(name: u32, info: u8, other: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(24);
    v.extend_from_slice(&name.to_le_bytes());
    v.push(info);
    v.push(other);
    v.extend_from_slice(&shndx.to_le_bytes());
    v.extend_from_slice(&value.to_le_bytes());
    v.extend_from_slice(&size.to_le_bytes());
    v
}

#[test]
fn crawls_ecall_from_a_synthetic_elf_object() {
    let _ = env_logger::builder().is_test(true).try_init();

    let text_instrs = {
        let mut buf = vec![0u8; 12];
        rv_addi(&mut buf[0..4], Reg::A7, Reg::Zero, 64);
        buf[4..8].copy_from_slice(&0x0000_0073u32.to_le_bytes());
        rv_jalr(&mut buf[8..12], Reg::Zero, Reg::Ra, 0);
        buf
    };

    // A second section whose `sh_addr` range overlaps `.text`'s once both
    // are translated through the same `base_addr` -- exercising that a
    // symbol belonging to it is never mistaken for a `.text` jump target
    // (`mark_function_symbols` must filter on section index, not just the
    // translated address).
    let data_bytes = vec![0u8; 4];

    let mut shstrtab = StrTab::new();
    let name_text = shstrtab.add(".text");
    let name_data = shstrtab.add(".data");
    let name_symtab = shstrtab.add(".symtab");
    let name_strtab = shstrtab.add(".strtab");
    let name_shstrtab = shstrtab.add(".shstrtab");

    let mut strtab = StrTab::new();
    let name_fn = strtab.add("syscall_fn");
    let name_data_sym = strtab.add("data_thing");

    // Section indices: 0 NULL, 1 .text, 2 .data, 3 .symtab, 4 .strtab, 5 .shstrtab.
    let null_sym = sym(0, 0, 0, 0, 0, 0);
    let fn_sym = sym(name_fn, (STB_GLOBAL << 4) | STT_FUNC, 0, 1, 0, text_instrs.len() as u64);
    // Same st_value as the ecall's offset within .text, but st_shndx points
    // at .data: must never mark text_start + 4 as a jump target.
    let data_sym = sym(name_data_sym, (STB_GLOBAL << 4) | STT_FUNC, 0, 2, 4, 0);
    let symtab_bytes = [null_sym, fn_sym, data_sym].concat();

    let mut file = vec![0u8; 64];

    let text_off = file.len() as u64;
    file.extend_from_slice(&text_instrs);

    let data_off = file.len() as u64;
    file.extend_from_slice(&data_bytes);

    let symtab_off = file.len() as u64;
    file.extend_from_slice(&symtab_bytes);

    let strtab_off = file.len() as u64;
    file.extend_from_slice(&strtab.buf);

    let shstrtab_off = file.len() as u64;
    file.extend_from_slice(&shstrtab.buf);

    let shoff = file.len() as u64;

    let sh_null = section_header(0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0, 0);
    let sh_text = section_header(
        name_text,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        0,
        text_off,
        text_instrs.len() as u64,
        0,
        0,
        4,
        0,
    );
    let sh_data = section_header(
        name_data,
        SHT_PROGBITS,
        SHF_ALLOC,
        0,
        data_off,
        data_bytes.len() as u64,
        0,
        0,
        4,
        0,
    );
    let sh_symtab = section_header(
        name_symtab,
        SHT_SYMTAB,
        0,
        0,
        symtab_off,
        symtab_bytes.len() as u64,
        4,
        1,
        8,
        24,
    );
    let sh_strtab =
        section_header(name_strtab, SHT_STRTAB, 0, 0, strtab_off, strtab.buf.len() as u64, 0, 0, 1, 0);
    let sh_shstrtab = section_header(
        name_shstrtab,
        SHT_STRTAB,
        0,
        0,
        shstrtab_off,
        shstrtab.buf.len() as u64,
        0,
        0,
        1,
        0,
    );

    file.extend_from_slice(&sh_null);
    file.extend_from_slice(&sh_text);
    file.extend_from_slice(&sh_data);
    file.extend_from_slice(&sh_symtab);
    file.extend_from_slice(&sh_strtab);
    file.extend_from_slice(&sh_shstrtab);

    file[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    file[4] = 2; // ELFCLASS64
    file[5] = 1; // ELFDATA2LSB
    file[6] = 1; // EI_VERSION
    file[16..18].copy_from_slice(&ET_REL.to_le_bytes());
    file[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
    file[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    file[40..48].copy_from_slice(&shoff.to_le_bytes());
    file[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    file[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    file[60..62].copy_from_slice(&6u16.to_le_bytes()); // e_shnum
    file[62..64].copy_from_slice(&5u16.to_le_bytes()); // e_shstrndx

    let path = std::env::temp_dir().join(format!("rvintercept_synth_{}.o", std::process::id()));
    std::fs::write(&path, &file).expect("write synthetic object");

    let mut live_text = text_instrs.clone();
    let base_addr = live_text.as_mut_ptr() as usize;

    let mut desc = ElfDescriptor::open(&path, base_addr).expect("parse synthetic object");
    std::fs::remove_file(&path).ok();

    // The STT_FUNC symbol at st_value = 0 marks the function's entry as a
    // known jump target.
    assert!(desc.has_jump(desc.text_start));

    // `data_thing` lives in .data, not .text, despite sharing the same
    // st_value as the ecall's offset into .text: must not be marked.
    assert!(!desc.has_jump(desc.text_start + 4));

    let found: Vec<CrawledSyscall> = unsafe { crawl_text(&mut desc, RvcMode::ENABLED) };
    assert_eq!(found.len(), 1);

    let crawled = &found[0];
    assert_eq!(crawled.syscall_idx as usize, SYSCALL_IDX);
    assert_eq!(crawled.syscall_offset, 4 + text_off);
    assert!(crawled.surrounding_instrs[SYSCALL_IDX].is_syscall);
}
