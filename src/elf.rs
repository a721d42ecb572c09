//! ELF32/ELF64 header and section-table parsing
use crate::binary::{ParsedBinary, SectionRec};
use crate::detect::BinFormat;
use crate::error::AnalysisError;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

const ELF_HEADER_SIGNATURE: &[u8] = b"\x7f\x45\x4c\x46";

const SHF_EXECINSTR: u64 = 0x4;

fn rdu16<R: Read>(r: &mut R, le: bool) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    match le {
        true => Ok(u16::from_le_bytes(buf)),
        false => Ok(u16::from_be_bytes(buf)),
    }
}

fn rdu32<R: Read>(r: &mut R, le: bool) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    match le {
        true => Ok(u32::from_le_bytes(buf)),
        false => Ok(u32::from_be_bytes(buf)),
    }
}

fn rdu64<R: Read>(r: &mut R, le: bool) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    match le {
        true => Ok(u64::from_le_bytes(buf)),
        false => Ok(u64::from_be_bytes(buf)),
    }
}

fn eh_object_type(object: u16) -> &'static str {
    match object {
        0x00 => "No type",
        0x01 => "Relocatable",
        0x02 => "Executable",
        0x03 => "Shared object",
        0x04 => "Core",
        _ => "*** UNKNOWN ***",
    }
}

fn eh_machine_type(machine: u16) -> String {
    match machine {
        0x02 => "SPARC".to_string(),
        0x03 => "x86".to_string(),
        0x08 => "MIPS".to_string(),
        0x14 => "PowerPC".to_string(),
        0x16 => "S390".to_string(),
        0x28 => "ARM".to_string(),
        0x2A => "SuperH".to_string(),
        0x32 => "IA-64".to_string(),
        0x3E => "AMD64".to_string(),
        0xB7 => "AArch64".to_string(),
        0xF3 => "RISC-V".to_string(),
        _ => format!("unknown ({machine:#x})"),
    }
}

// Word width implied by the machine; RISC-V and unknown machines fall back
// to the identification class.
fn eh_machine_bits(machine: u16) -> Option<u32> {
    match machine {
        0x02 | 0x03 | 0x08 | 0x14 | 0x28 | 0x2A => Some(32),
        0x16 | 0x32 | 0x3E | 0xB7 => Some(64),
        _ => None,
    }
}

fn section_type(sh_type: u32) -> String {
    match sh_type {
        0x0 => "NULL".to_string(),
        0x1 => "PROGBITS".to_string(),
        0x2 => "SYMTAB".to_string(),
        0x3 => "STRTAB".to_string(),
        0x4 => "RELA".to_string(),
        0x5 => "HASH".to_string(),
        0x6 => "DYNAMIC".to_string(),
        0x7 => "NOTE".to_string(),
        0x8 => "NOBITS".to_string(),
        0x9 => "REL".to_string(),
        0x0B => "DYNSYM".to_string(),
        0x0E => "INIT_ARRAY".to_string(),
        0x0F => "FINI_ARRAY".to_string(),
        0x11 => "GROUP".to_string(),
        _ => format!("{sh_type:#x}"),
    }
}

fn section_flags(sh_flags: u64) -> String {
    let mut f: Vec<&'static str> = vec![];
    if sh_flags & 0x1 > 0 {
        f.push("WRITE");
    }
    if sh_flags & 0x2 > 0 {
        f.push("ALLOC");
    }
    if sh_flags & 0x4 > 0 {
        f.push("EXEC");
    }
    f.join("|")
}

struct SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
}

impl SectionHeader {
    fn new<R: Read>(mut r: R, x64: bool, le: bool) -> Result<Self, std::io::Error> {
        Ok(Self {
            sh_name: rdu32(&mut r, le)?,
            sh_type: rdu32(&mut r, le)?,
            sh_flags: match x64 {
                true => rdu64(&mut r, le)?,
                false => rdu32(&mut r, le)?.into(),
            },
            sh_addr: match x64 {
                true => rdu64(&mut r, le)?,
                false => rdu32(&mut r, le)?.into(),
            },
            sh_offset: match x64 {
                true => rdu64(&mut r, le)?,
                false => rdu32(&mut r, le)?.into(),
            },
            sh_size: match x64 {
                true => rdu64(&mut r, le)?,
                false => rdu32(&mut r, le)?.into(),
            },
        })
    }
}

// NUL-terminated name at `off` inside the string-table span, or None when
// the offset runs outside the table or the bytes are not valid UTF-8
fn strtab_name(buf: &[u8], tab_off: u64, tab_size: u64, off: u32) -> Option<String> {
    let start = tab_off.checked_add(off as u64)?;
    let end = tab_off.checked_add(tab_size)?.min(buf.len() as u64);
    if start >= end {
        return None;
    }
    let span = &buf[start as usize..end as usize];
    let nul = span.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&span[..nul]).ok().map(String::from)
}

/// Parse an ELF image into the uniform binary record
pub fn parse(buf: &[u8]) -> Result<ParsedBinary, AnalysisError> {
    if buf.len() < 16 {
        return Err(AnalysisError::TooSmall("ELF"));
    }
    if &buf[0..4] != ELF_HEADER_SIGNATURE {
        return Err(AnalysisError::invalid("ELF", "header signature mismatch"));
    }
    let x64 = match buf[4] {
        1 => false,
        2 => true,
        _ => {
            return Err(AnalysisError::invalid("ELF", "invalid class specification"));
        }
    };
    let le = buf[5] != 2;
    if buf.len() < if x64 { 64 } else { 52 } {
        return Err(AnalysisError::TooSmall("ELF"));
    }

    let mut issues: Vec<String> = vec![];
    let mut r = Cursor::new(buf);
    r.seek(SeekFrom::Start(16))?;

    let e_type = rdu16(&mut r, le)?;
    let e_machine = rdu16(&mut r, le)?;
    let _e_version = rdu32(&mut r, le)?;
    let e_entry = match x64 {
        true => rdu64(&mut r, le)?,
        false => rdu32(&mut r, le)?.into(),
    };
    let _e_phoff = match x64 {
        true => rdu64(&mut r, le)?,
        false => rdu32(&mut r, le)?.into(),
    };
    let e_shoff: u64 = match x64 {
        true => rdu64(&mut r, le)?,
        false => rdu32(&mut r, le)?.into(),
    };
    let _e_flags = rdu32(&mut r, le)?;
    let _e_ehsize = rdu16(&mut r, le)?;
    let _e_phentsize = rdu16(&mut r, le)?;
    let _e_phnum = rdu16(&mut r, le)?;
    let e_shentsize = rdu16(&mut r, le)?;
    let e_shnum = rdu16(&mut r, le)?;
    let e_shstrndx = rdu16(&mut r, le)?;

    if e_shentsize != 40 && e_shentsize != 64 {
        issues.push("EH_UNUSUAL_SHENTSIZE".to_string());
    }

    let mut raw_headers = Vec::new();
    if e_shoff > 0 {
        for i in 0..e_shnum {
            let off = e_shoff + i as u64 * e_shentsize as u64;
            if r.seek(SeekFrom::Start(off)).is_err() {
                issues.push("SH_TRUNCATED".to_string());
                break;
            }
            match SectionHeader::new(&mut r, x64, le) {
                Ok(sh) => raw_headers.push(sh),
                Err(_) => {
                    issues.push("SH_TRUNCATED".to_string());
                    break;
                }
            }
        }
    }

    // String table holding the section names; a bad index degrades every
    // name to its synthesized form instead of failing the parse
    let strtab = raw_headers
        .get(e_shstrndx as usize)
        .map(|sh| (sh.sh_offset, sh.sh_size));
    if strtab.is_none() && e_shnum > 0 {
        issues.push("EH_BAD_SHSTRNDX".to_string());
    }

    let mut sections = Vec::with_capacity(raw_headers.len());
    for (i, sh) in raw_headers.iter().enumerate() {
        let name = strtab
            .and_then(|(off, size)| strtab_name(buf, off, size, sh.sh_name))
            .unwrap_or_else(|| format!("section_{i}"));
        sections.push(SectionRec {
            name,
            virtual_address: sh.sh_addr,
            virtual_size: sh.sh_size,
            raw_offset: sh.sh_offset,
            // NOBITS sections occupy no file space
            raw_size: if sh.sh_type == 0x8 { 0 } else { sh.sh_size },
            flags: sh.sh_flags as u32,
            flags_str: section_flags(sh.sh_flags),
            type_str: section_type(sh.sh_type),
            is_code: sh.sh_flags & SHF_EXECINSTR != 0,
        });
    }

    let bits = eh_machine_bits(e_machine).unwrap_or(if x64 { 64 } else { 32 });
    let arch = eh_machine_type(e_machine);
    let type_str = eh_object_type(e_type).to_string();

    let mut info = BTreeMap::new();
    info.insert("class".to_string(), if x64 { "ELF64" } else { "ELF32" }.to_string());
    info.insert(
        "endianness".to_string(),
        if le { "little-endian" } else { "big-endian" }.to_string(),
    );
    info.insert("machine".to_string(), arch.clone());
    info.insert("object_type".to_string(), type_str.clone());
    info.insert("entry_point".to_string(), format!("{e_entry:#x}"));
    info.insert("section_count".to_string(), e_shnum.to_string());

    let summary = format!(
        "{} {}, {}, {} sections",
        if x64 { "ELF64" } else { "ELF32" },
        type_str,
        arch,
        sections.len()
    );

    let mut parsed = ParsedBinary {
        format: BinFormat::Elf,
        type_str,
        arch,
        bits,
        entry_point: (e_entry != 0).then_some(e_entry),
        sections,
        info,
        summary,
        issues,
    };
    parsed.clamp_sections(buf.len() as u64);
    Ok(parsed)
}
