//! Reader for 64-bit little-endian relocatable (`ET_REL`) ELF objects
//! containing prebuilt BPF programs: section/symbol/relocation walking,
//! program-type inference from section-name prefixes, and the fixed
//! 20-byte `maps` section record format.

use crate::codec::{get_u32_le, get_u64_le};
use crate::error::{Error, Result};
use crate::insn::INSN_SIZE;
use crate::prog::ProgType;
use std::collections::HashMap;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_REL: u16 = 1;

const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_PROGBITS: u32 = 1;
const SHT_REL: u32 = 9;
const SHT_RELA: u32 = 4;
const SHF_EXECINSTR: u64 = 0x4;

const MAP_DEF_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    /// `sh_info`: for `SHT_REL`/`SHT_RELA` sections, the index of the
    /// section the relocations apply to.
    pub info: u32,
    pub entsize: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub shndx: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct MapDef {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

impl MapDef {
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < MAP_DEF_SIZE {
            return Err(Error::ElfParse("map definition record shorter than 20 bytes".into()));
        }
        Ok(MapDef {
            map_type: get_u32_le(b, 0),
            key_size: get_u32_le(b, 4),
            value_size: get_u32_le(b, 8),
            max_entries: get_u32_le(b, 12),
            flags: get_u32_le(b, 16),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProgramSection {
    pub name: String,
    pub prog_type: ProgType,
    pub instructions: Vec<u8>,
}

/// One relocation entry: an offset into the section named `target_section`
/// that needs the resolved address or fd of `symbol_name` (typically a `maps`
/// entry or another program section) spliced in as an `lddw` immediate.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub target_section: String,
    pub offset: u64,
    pub symbol_name: String,
    pub reloc_type: u32,
}

pub struct ElfObject {
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub programs: Vec<ProgramSection>,
    pub maps: HashMap<String, MapDef>,
    pub relocations: Vec<Relocation>,
    pub license: String,
    pub kernel_version: u32,
}

impl ElfObject {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 64 || data[0..4] != ELF_MAGIC {
            return Err(Error::ElfParse("bad ELF magic".into()));
        }
        if data[4] != ELFCLASS64 {
            return Err(Error::ElfParse("only 64-bit ELF objects are supported".into()));
        }
        if data[5] != ELFDATA2LSB {
            return Err(Error::ElfParse("only little-endian ELF objects are supported".into()));
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        if e_type != ET_REL {
            return Err(Error::ElfParse("only relocatable (ET_REL) objects are supported".into()));
        }
        let e_shoff = get_u64_le(data, 0x28) as usize;
        let e_shentsize = u16::from_le_bytes([data[0x3a], data[0x3b]]) as usize;
        let e_shnum = u16::from_le_bytes([data[0x3c], data[0x3d]]) as usize;
        let e_shstrndx = u16::from_le_bytes([data[0x3e], data[0x3f]]) as usize;

        if e_shoff == 0 || e_shnum == 0 {
            return Err(Error::ElfParse("no section headers present".into()));
        }

        // Raw headers first (name string deferred until shstrtab is known).
        struct RawShdr {
            name_off: u32,
            sh_type: u32,
            flags: u64,
            offset: u64,
            size: u64,
            link: u32,
            info: u32,
            entsize: u64,
        }
        let mut raw = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let base = e_shoff + i * e_shentsize;
            let h = &data[base..base + e_shentsize];
            raw.push(RawShdr {
                name_off: get_u32_le(h, 0),
                sh_type: get_u32_le(h, 4),
                flags: get_u64_le(h, 8),
                offset: get_u64_le(h, 24),
                size: get_u64_le(h, 32),
                link: get_u32_le(h, 40),
                info: get_u32_le(h, 44),
                entsize: get_u64_le(h, 56),
            });
        }

        let shstrtab = &raw[e_shstrndx];
        let shstr_data = &data[shstrtab.offset as usize..(shstrtab.offset + shstrtab.size) as usize];

        let mut sections = Vec::with_capacity(e_shnum);
        for h in &raw {
            let name = cstr_at(shstr_data, h.name_off as usize);
            let section_data = if h.sh_type == 8 {
                // SHT_NOBITS (.bss-like): no file-backed bytes.
                Vec::new()
            } else {
                data[h.offset as usize..(h.offset + h.size) as usize].to_vec()
            };
            sections.push(Section {
                name,
                sh_type: h.sh_type,
                flags: h.flags,
                offset: h.offset,
                size: h.size,
                link: h.link,
                info: h.info,
                entsize: h.entsize,
                data: section_data,
            });
        }

        let symbols = parse_symbols(&sections);
        let programs = parse_programs(&sections)?;
        let maps = parse_maps(&sections, &symbols)?;
        let relocations = parse_relocations(&sections, &symbols);
        let license = parse_license(&sections);
        let kernel_version = parse_kernel_version_section(&sections);

        Ok(ElfObject { sections, symbols, programs, maps, relocations, license, kernel_version })
    }
}

fn cstr_at(strtab: &[u8], offset: usize) -> String {
    if offset >= strtab.len() {
        return String::new();
    }
    let end = strtab[offset..].iter().position(|&b| b == 0).map(|p| offset + p).unwrap_or(strtab.len());
    String::from_utf8_lossy(&strtab[offset..end]).into_owned()
}

fn parse_symbols(sections: &[Section]) -> Vec<Symbol> {
    let Some(symtab) = sections.iter().find(|s| s.sh_type == SHT_SYMTAB) else {
        return Vec::new();
    };
    let Some(strtab) = sections.get(symtab.link as usize) else {
        return Vec::new();
    };
    const SYM_ENTRY_SIZE: usize = 24;
    let mut out = Vec::new();
    let mut off = 0;
    while off + SYM_ENTRY_SIZE <= symtab.data.len() {
        let e = &symtab.data[off..off + SYM_ENTRY_SIZE];
        let name_off = get_u32_le(e, 0) as usize;
        let shndx = u16::from_le_bytes([e[6], e[7]]);
        let value = get_u64_le(e, 8);
        out.push(Symbol { name: cstr_at(&strtab.data, name_off), value, shndx });
        off += SYM_ENTRY_SIZE;
    }
    out
}

/// Infer a program's type from its section-name prefix.
pub fn section_to_prog_type(name: &str) -> Option<ProgType> {
    if let Some(rest) = name.strip_prefix("kprobe/") {
        let _ = rest;
        return Some(ProgType::Kprobe);
    }
    if name.starts_with("xdp") {
        return Some(ProgType::Xdp);
    }
    if name.starts_with("tc") {
        return Some(ProgType::SchedCls);
    }
    if name.starts_with("tracepoint/") {
        return Some(ProgType::Tracepoint);
    }
    if name.starts_with("raw_tracepoint/") {
        return Some(ProgType::RawTracepoint);
    }
    if name.starts_with("cgroup/") {
        return Some(ProgType::CgroupSkb);
    }
    if !name.starts_with('.') {
        return Some(ProgType::SocketFilter);
    }
    None
}

fn parse_programs(sections: &[Section]) -> Result<Vec<ProgramSection>> {
    let mut out = Vec::new();
    for s in sections {
        if s.sh_type != SHT_PROGBITS || s.flags & SHF_EXECINSTR == 0 || s.name.starts_with('.') {
            continue;
        }
        let Some(prog_type) = section_to_prog_type(&s.name) else { continue };
        if s.data.len() % INSN_SIZE != 0 {
            return Err(Error::ElfParse(format!("section `{}` is not a whole number of instructions", s.name)));
        }
        out.push(ProgramSection { name: s.name.clone(), prog_type, instructions: s.data.clone() });
    }
    Ok(out)
}

fn parse_maps(sections: &[Section], symbols: &[Symbol]) -> Result<HashMap<String, MapDef>> {
    let mut out = HashMap::new();
    let Some((maps_idx, maps_section)) = sections.iter().enumerate().find(|(_, s)| s.name == "maps") else {
        return Ok(out);
    };
    for sym in symbols {
        if sym.shndx as usize != maps_idx {
            continue;
        }
        let start = sym.value as usize;
        if start + MAP_DEF_SIZE > maps_section.data.len() {
            continue;
        }
        let def = MapDef::from_bytes(&maps_section.data[start..start + MAP_DEF_SIZE])?;
        out.insert(sym.name.clone(), def);
    }
    Ok(out)
}

/// Walk every `SHT_REL`/`SHT_RELA` section and resolve each entry's symbol
/// index against the symbol table its `link` field points at. Application
/// against the loaded instruction stream is left to the caller.
fn parse_relocations(sections: &[Section], symbols: &[Symbol]) -> Vec<Relocation> {
    let mut out = Vec::new();
    for sec in sections {
        if sec.sh_type != SHT_REL && sec.sh_type != SHT_RELA {
            continue;
        }
        let Some(target) = sections.get(sec.info as usize) else { continue };
        let entry_size = if sec.sh_type == SHT_RELA { 24 } else { 16 };
        let mut off = 0;
        while off + entry_size <= sec.data.len() {
            let e = &sec.data[off..off + entry_size];
            let r_offset = get_u64_le(e, 0);
            let r_info = get_u64_le(e, 8);
            let sym_idx = (r_info >> 32) as usize;
            let reloc_type = (r_info & 0xffff_ffff) as u32;
            let symbol_name = symbols.get(sym_idx).map(|s| s.name.clone()).unwrap_or_default();

            out.push(Relocation { target_section: target.name.clone(), offset: r_offset, symbol_name, reloc_type });
            off += entry_size;
        }
    }
    out
}

fn parse_license(sections: &[Section]) -> String {
    sections
        .iter()
        .find(|s| s.name == "license")
        .map(|s| crate::codec::cstr_from_fixed(&s.data))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "GPL".to_string())
}

fn parse_kernel_version_section(sections: &[Section]) -> u32 {
    sections.iter().find(|s| s.name == "version").filter(|s| s.data.len() >= 4).map(|s| get_u32_le(&s.data, 0)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_to_prog_type_matches_prefixes() {
        assert_eq!(section_to_prog_type("kprobe/foo"), Some(ProgType::Kprobe));
        assert_eq!(section_to_prog_type("xdp_drop"), Some(ProgType::Xdp));
        assert_eq!(section_to_prog_type("tc_ingress"), Some(ProgType::SchedCls));
        assert_eq!(section_to_prog_type("tracepoint/syscalls/sys_enter_open"), Some(ProgType::Tracepoint));
        assert_eq!(section_to_prog_type("raw_tracepoint/xyz"), Some(ProgType::RawTracepoint));
        assert_eq!(section_to_prog_type("cgroup/skb"), Some(ProgType::CgroupSkb));
        assert_eq!(section_to_prog_type("socket_filter"), Some(ProgType::SocketFilter));
        assert_eq!(section_to_prog_type(".text"), None);
    }

    #[test]
    fn map_def_parses_20_byte_record() {
        let mut b = [0u8; 20];
        b[0..4].copy_from_slice(&1u32.to_le_bytes()); // hash
        b[4..8].copy_from_slice(&4u32.to_le_bytes());
        b[8..12].copy_from_slice(&8u32.to_le_bytes());
        b[12..16].copy_from_slice(&10u32.to_le_bytes());
        let def = MapDef::from_bytes(&b).unwrap();
        assert_eq!(def.map_type, 1);
        assert_eq!(def.key_size, 4);
        assert_eq!(def.value_size, 8);
        assert_eq!(def.max_entries, 10);
    }

    #[test]
    fn map_def_rejects_short_record() {
        assert!(MapDef::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn cstr_at_stops_at_nul() {
        let tab = b"\0foo\0bar\0";
        assert_eq!(cstr_at(tab, 1), "foo");
        assert_eq!(cstr_at(tab, 5), "bar");
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 64];
        assert!(ElfObject::parse(&data).is_err());
    }

    #[test]
    fn parse_license_defaults_to_gpl() {
        assert_eq!(parse_license(&[]), "GPL");
    }

    fn section(name: &str, sh_type: u32, info: u32, data: Vec<u8>) -> Section {
        Section { name: name.into(), sh_type, flags: 0, offset: 0, size: data.len() as u64, link: 0, info, entsize: 0, data }
    }

    #[test]
    fn relocations_resolve_symbol_name_and_target_section() {
        let symbols = vec![
            Symbol { name: String::new(), value: 0, shndx: 0 },
            Symbol { name: "my_map".into(), value: 0, shndx: 3 },
        ];
        let mut rela_entry = [0u8; 24];
        rela_entry[0..8].copy_from_slice(&16u64.to_le_bytes()); // r_offset
        let r_info: u64 = (1u64 << 32) | 1; // sym index 1, type 1
        rela_entry[8..16].copy_from_slice(&r_info.to_le_bytes());

        let sections = vec![
            section("kprobe/foo", SHT_PROGBITS, 0, vec![0u8; 32]),
            section(".rela.text", SHT_RELA, 0, rela_entry.to_vec()),
        ];
        let relocs = parse_relocations(&sections, &symbols);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].symbol_name, "my_map");
        assert_eq!(relocs[0].offset, 16);
        assert_eq!(relocs[0].reloc_type, 1);
        assert_eq!(relocs[0].target_section, "kprobe/foo");
    }
}
