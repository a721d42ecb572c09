//! PE (DOS/COFF/optional header) and section-table parsing
use crate::binary::{ParsedBinary, SectionRec};
use crate::detect::BinFormat;
use crate::error::AnalysisError;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

const PE_SIGNATURE: &[u8] = b"PE\x00\x00";
const OPT_MAGIC_PE32PLUS: u16 = 0x20B;

const IMAGE_FILE_DLL: u16 = 0x2000;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_SCN_CNT_CODE: u32 = 0x20;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;

fn rdu16<R: Read>(r: &mut R) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn rdu32<R: Read>(r: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn rdu64<R: Read>(r: &mut R) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn machine_type(machine: u16) -> String {
    match machine {
        0x014c => "x86".to_string(),
        0x0200 => "IA-64".to_string(),
        0x01c0 => "ARM".to_string(),
        0x01c4 => "ARM Thumb-2".to_string(),
        0xaa64 => "AArch64".to_string(),
        0x8664 => "AMD64".to_string(),
        0x5032 => "RISC-V (32-bit)".to_string(),
        0x5064 => "RISC-V (64-bit)".to_string(),
        _ => format!("unknown ({machine:#x})"),
    }
}

fn subsystem_type(subsystem: u16) -> String {
    match subsystem {
        1 => "Native".to_string(),
        2 => "Windows GUI".to_string(),
        3 => "Windows console".to_string(),
        5 => "OS/2 console".to_string(),
        7 => "POSIX console".to_string(),
        9 => "Windows CE GUI".to_string(),
        10 => "EFI application".to_string(),
        11 => "EFI boot driver".to_string(),
        12 => "EFI runtime driver".to_string(),
        13 => "EFI ROM image".to_string(),
        14 => "Xbox".to_string(),
        16 => "Windows boot application".to_string(),
        _ => format!("unknown ({subsystem:#x})"),
    }
}

fn section_flags(flags: u32) -> String {
    let mut f: Vec<&'static str> = vec![];
    if flags & IMAGE_SCN_CNT_CODE > 0 {
        f.push("CODE");
    }
    if flags & 0x40 > 0 {
        f.push("INIT_DATA");
    }
    if flags & 0x80 > 0 {
        f.push("UNINIT_DATA");
    }
    if flags & IMAGE_SCN_MEM_EXECUTE > 0 {
        f.push("EXEC");
    }
    if flags & 0x4000_0000 > 0 {
        f.push("READ");
    }
    if flags & 0x8000_0000 > 0 {
        f.push("WRITE");
    }
    if f.is_empty() {
        format!("{flags:#x}")
    } else {
        f.join("|")
    }
}

fn timestamp_str(ts: u32) -> String {
    match chrono::DateTime::from_timestamp(ts as i64, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{ts:#x}"),
    }
}

/// Parse a PE image into the uniform binary record
pub fn parse(buf: &[u8]) -> Result<ParsedBinary, AnalysisError> {
    if buf.len() < 0x40 {
        return Err(AnalysisError::TooSmall("PE"));
    }
    if &buf[0..2] != b"MZ" {
        return Err(AnalysisError::invalid("PE", "MZ signature mismatch"));
    }
    let mut r = Cursor::new(buf);
    r.seek(SeekFrom::Start(0x3c))?;
    let e_lfanew = rdu32(&mut r)? as u64;
    if e_lfanew + 4 > buf.len() as u64 {
        return Err(AnalysisError::invalid("PE", "e_lfanew past end of file"));
    }
    if &buf[e_lfanew as usize..e_lfanew as usize + 4] != PE_SIGNATURE {
        return Err(AnalysisError::invalid("PE", "PE signature missing"));
    }

    let mut issues: Vec<String> = vec![];

    // COFF file header
    r.seek(SeekFrom::Start(e_lfanew + 4))?;
    let machine = rdu16(&mut r)?;
    let n_sections = rdu16(&mut r)?;
    let timestamp = rdu32(&mut r)?;
    let _ptr_symtab = rdu32(&mut r)?;
    let _n_symbols = rdu32(&mut r)?;
    let size_of_optional = rdu16(&mut r)?;
    let characteristics = rdu16(&mut r)?;

    let opt_base = e_lfanew + 24;
    let mut pe32plus = false;
    let mut entry_point = 0u32;
    let mut base_of_code = 0u32;
    let mut image_base = 0u64;
    let mut subsystem = 0u16;
    if size_of_optional >= 2 {
        pe32plus = rdu16(&mut r).map(|m| m == OPT_MAGIC_PE32PLUS).unwrap_or(false);
        r.seek(SeekFrom::Start(opt_base + 16))?;
        entry_point = rdu32(&mut r).unwrap_or(0);
        base_of_code = rdu32(&mut r).unwrap_or(0);
        image_base = if pe32plus {
            r.seek(SeekFrom::Start(opt_base + 24))?;
            rdu64(&mut r).unwrap_or(0)
        } else {
            r.seek(SeekFrom::Start(opt_base + 28))?;
            rdu32(&mut r).unwrap_or(0) as u64
        };
        // Subsystem is read at +68 for either optional-header shape,
        // matching the PE32+ layout only
        r.seek(SeekFrom::Start(opt_base + 68))?;
        subsystem = rdu16(&mut r).unwrap_or(0);
    } else {
        issues.push("OPT_HEADER_MISSING".to_string());
    }
    let bits: u32 = if pe32plus {
        64
    } else if size_of_optional >= 2 {
        32
    } else if matches!(machine, 0x8664 | 0xaa64 | 0x0200 | 0x5064) {
        64
    } else {
        32
    };

    // Section table
    let mut sections = Vec::with_capacity(n_sections as usize);
    let table_base = opt_base + size_of_optional as u64;
    for i in 0..n_sections {
        let off = table_base + i as u64 * 40;
        if r.seek(SeekFrom::Start(off)).is_err() {
            issues.push("SECTION_TABLE_TRUNCATED".to_string());
            break;
        }
        let mut name_raw = [0u8; 8];
        let entry = (|| -> Result<SectionRec, std::io::Error> {
            r.read_exact(&mut name_raw)?;
            let virtual_size = rdu32(&mut r)?;
            let virtual_address = rdu32(&mut r)?;
            let raw_size = rdu32(&mut r)?;
            let raw_offset = rdu32(&mut r)?;
            r.seek(SeekFrom::Current(12))?;
            let flags = rdu32(&mut r)?;
            let name = String::from_utf8_lossy(&name_raw)
                .trim_end_matches('\0')
                .to_string();
            Ok(SectionRec {
                name: if name.is_empty() {
                    format!("section_{i}")
                } else {
                    name
                },
                virtual_address: virtual_address as u64,
                virtual_size: virtual_size as u64,
                raw_offset: raw_offset as u64,
                raw_size: raw_size as u64,
                flags,
                flags_str: section_flags(flags),
                type_str: if flags & IMAGE_SCN_CNT_CODE > 0 {
                    "code".to_string()
                } else if flags & 0x80 > 0 {
                    "uninitialized data".to_string()
                } else {
                    "data".to_string()
                },
                is_code: flags & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE)
                    == (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE),
            })
        })();
        match entry {
            Ok(sec) => sections.push(sec),
            Err(_) => {
                issues.push("SECTION_TABLE_TRUNCATED".to_string());
                break;
            }
        }
    }

    let type_str = if characteristics & IMAGE_FILE_DLL > 0 {
        "DLL"
    } else if characteristics & IMAGE_FILE_EXECUTABLE_IMAGE > 0 {
        "EXE"
    } else {
        "OBJ"
    }
    .to_string();
    let arch = machine_type(machine);

    let mut info = BTreeMap::new();
    info.insert("machine".to_string(), arch.clone());
    info.insert("file_type".to_string(), type_str.clone());
    info.insert("timestamp".to_string(), timestamp_str(timestamp));
    info.insert(
        "optional_magic".to_string(),
        if pe32plus { "PE32+" } else { "PE32" }.to_string(),
    );
    info.insert("image_base".to_string(), format!("{image_base:#x}"));
    info.insert("entry_point".to_string(), format!("{entry_point:#x}"));
    info.insert("base_of_code".to_string(), format!("{base_of_code:#x}"));
    info.insert("subsystem".to_string(), subsystem_type(subsystem));
    info.insert(
        "characteristics".to_string(),
        format!("{characteristics:#06x}"),
    );

    let summary = format!(
        "PE {} {}, {}, {} sections",
        if pe32plus { "PE32+" } else { "PE32" },
        type_str,
        arch,
        sections.len()
    );

    let mut parsed = ParsedBinary {
        format: BinFormat::Pe,
        type_str,
        arch,
        bits,
        entry_point: (entry_point != 0).then_some(entry_point as u64),
        sections,
        info,
        summary,
        issues,
    };
    parsed.clamp_sections(buf.len() as u64);
    Ok(parsed)
}
