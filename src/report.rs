//! The immutable analysis report surfaced to the consumer
use crate::analysis::{SigHit, XrefEntry};
use crate::binary::{SectionRec, canon_addr};
use crate::disasm::Instruction;
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary scalars of the analyzed file
#[derive(Debug, Serialize)]
pub struct FileInfo {
    /// Original file name as supplied by the input source
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Human-readable size
    pub size_str: String,
    /// Container format description
    pub format: String,
    /// File type description (EXE, DLL, Shared object, ...)
    #[serde(rename = "type")]
    pub type_str: String,
    /// Target architecture label
    pub arch: String,
    /// Word width of the target
    pub bits: u32,
    /// One-line human summary
    pub summary: String,
    /// Format-specific header facts
    #[serde(flatten)]
    pub info: BTreeMap<String, String>,
    /// Structural anomalies collected while parsing
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// One section row of the report
#[derive(Debug, Serialize)]
pub struct SectionInfo {
    pub name: String,
    /// Canonical address rendition
    pub virtual_address: String,
    /// Virtual (mapped) size
    pub size: u64,
    /// Size of the backing file data
    pub raw_size: u64,
    /// Display rendition of the section flags
    pub flags: String,
    pub is_code: bool,
    #[serde(rename = "type")]
    pub type_str: String,
}

impl SectionInfo {
    pub fn from_record(sec: &SectionRec, bits: u32) -> Self {
        Self {
            name: sec.name.clone(),
            virtual_address: canon_addr(sec.virtual_address, bits),
            size: sec.virtual_size,
            raw_size: sec.raw_size,
            flags: sec.flags_str.clone(),
            is_code: sec.is_code,
            type_str: sec.type_str.clone(),
        }
    }
}

/// The disassembly listing of the primary code section
#[derive(Debug, Serialize)]
pub struct DisasmInfo {
    /// Name of the section the listing covers
    pub section: String,
    /// Whether the hex framer substituted for a real decoder
    pub fallback: bool,
    pub instructions: Vec<Instruction>,
    /// Canonical base address of the listing
    pub base_va: String,
}

/// The static control-flow index
#[derive(Debug, Serialize)]
pub struct AnalysisInfo {
    /// Branch targets to their static call/jump sites
    pub xrefs: BTreeMap<String, Vec<XrefEntry>>,
    /// Detected function starts to their labels
    pub func_labels: BTreeMap<String, String>,
    /// Byte-signature hits inside the code section
    pub byte_sigs: Vec<SigHit>,
}

/// Produced once per analysis and immutable afterwards. The progress sink
/// treats it opaquely; the interpreter and the CFG builder are constructed
/// from it on demand.
#[derive(Debug, Serialize)]
pub struct Report {
    pub file: FileInfo,
    pub sections: Vec<SectionInfo>,
    pub disasm: DisasmInfo,
    pub analysis: AnalysisInfo,
}
