//! Uniform section model shared by every format parser
//!
//! Downstream stages (disassembly, analysis, report assembly) consume only
//! these records and never reach back into format-specific structures.
use crate::detect::BinFormat;
use std::collections::BTreeMap;

/// A section of the analyzed image, normalized across formats
#[derive(Debug, Clone)]
pub struct SectionRec {
    /// Printable name; empty names are synthesized as `section_<i>`
    pub name: String,
    /// Load address of the section
    pub virtual_address: u64,
    /// Size of the section once mapped
    pub virtual_size: u64,
    /// Offset of the section data in the file image
    pub raw_offset: u64,
    /// Size of the section data in the file image
    pub raw_size: u64,
    /// Raw flag bits as stored in the section table
    pub flags: u32,
    /// Display rendition of the flag bits
    pub flags_str: String,
    /// Display rendition of the section type
    pub type_str: String,
    /// Whether the format marks the section executable
    pub is_code: bool,
}

/// Header facts extracted by a format parser
#[derive(Debug)]
pub struct ParsedBinary {
    /// Detected container format
    pub format: BinFormat,
    /// File type description (EXE, DLL, Shared object, ...)
    pub type_str: String,
    /// Target architecture label
    pub arch: String,
    /// Word width of the target, one of 16/32/64
    pub bits: u32,
    /// Program entry point, when the format records one
    pub entry_point: Option<u64>,
    /// Section table, in file order
    pub sections: Vec<SectionRec>,
    /// Extra header facts for display
    pub info: BTreeMap<String, String>,
    /// One-line human summary
    pub summary: String,
    /// Structural anomalies that did not abort parsing
    pub issues: Vec<String>,
}

impl ParsedBinary {
    /// Section records must stay within the file image; out-of-range raw
    /// spans are clamped and recorded as issues.
    pub fn clamp_sections(&mut self, file_len: u64) {
        for sec in self.sections.iter_mut() {
            if sec.raw_size == 0 {
                continue;
            }
            if sec.raw_offset >= file_len {
                self.issues
                    .push(format!("SECTION_OUT_OF_FILE:{}", sec.name));
                sec.raw_size = 0;
            } else if sec
                .raw_offset
                .checked_add(sec.raw_size)
                .is_none_or(|end| end > file_len)
            {
                self.issues.push(format!("SECTION_CLAMPED:{}", sec.name));
                sec.raw_size = file_len - sec.raw_offset;
            }
        }
    }
}

/// Canonical address rendition: lowercase `0x` + hex zero-padded to the
/// architecture's nibble count (16 for 64-bit, 8 otherwise)
pub fn canon_addr(addr: u64, bits: u32) -> String {
    if bits == 64 {
        format!("{addr:#018x}")
    } else {
        format!("{addr:#010x}")
    }
}

/// Function label for an address: `sub_` + hex with leading zeros trimmed
pub fn func_label(addr: u64) -> String {
    format!("sub_{addr:x}")
}

/// Binary-unit size rendition with one decimal
pub fn human_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut val = size as f64;
    let mut unit = 0;
    while val >= 1024.0 && unit + 1 < UNITS.len() {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{:.1} {}", val, UNITS[unit])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert_eq!(canon_addr(0x401000, 32), "0x00401000");
        assert_eq!(canon_addr(0x401000, 64), "0x0000000000401000");
        assert_eq!(canon_addr(0x10, 16), "0x00000010");
    }

    #[test]
    fn function_labels() {
        assert_eq!(func_label(0x401000), "sub_401000");
        assert_eq!(func_label(0), "sub_0");
    }

    #[test]
    fn size_rendition() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MiB");
    }

    // raw_offset + raw_size overflowing u64 must clamp, not wrap
    #[test]
    fn clamp_overflowing_section() {
        let mut parsed = ParsedBinary {
            format: BinFormat::Elf,
            type_str: "Executable".to_string(),
            arch: "AMD64".to_string(),
            bits: 64,
            entry_point: None,
            sections: vec![SectionRec {
                name: ".text".to_string(),
                virtual_address: 0x1000,
                virtual_size: 0x20,
                raw_offset: 0x100,
                raw_size: u64::MAX,
                flags: 0x6,
                flags_str: "ALLOC|EXEC".to_string(),
                type_str: "PROGBITS".to_string(),
                is_code: true,
            }],
            info: BTreeMap::new(),
            summary: String::new(),
            issues: vec![],
        };
        parsed.clamp_sections(0x200);
        assert_eq!(parsed.sections[0].raw_size, 0x100, "raw_size mismatch");
        assert_eq!(parsed.issues, ["SECTION_CLAMPED:.text"], "issues mismatch");
    }
}
