//! Decoder adapter: pluggable instruction decoding with a hex-dump fallback
//!
//! The actual instruction decoder is an external collaborator. It is wrapped
//! behind [`InstructionDecoder`] so that tests can inject a deterministic
//! fake and so that a missing or failing decoder degrades to the hex framer
//! instead of aborting the pipeline.
use crate::binary::canon_addr;
use crate::config::Config;
use serde::Serialize;
use tracing::debug;

/// One decoded (or hex-framed) instruction as surfaced in the report
#[derive(Debug, Clone, Serialize)]
pub struct Instruction {
    /// Canonical address (lowercase `0x`, zero-padded per word width)
    pub address: String,
    /// Space-separated lowercase hex of the encoded bytes
    pub bytes: String,
    /// Lowercase mnemonic
    pub mnemonic: String,
    /// Decoder-rendered operand text (NASM `NNNNh` dialect)
    pub operands: String,
}

impl Instruction {
    /// Numeric address parsed back from the canonical rendition
    pub fn addr(&self) -> Option<u64> {
        parse_canon_addr(&self.address)
    }
}

pub fn parse_canon_addr(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

/// Raw decoder output, one entry per instruction
#[derive(Debug, Clone)]
pub struct RawInst {
    /// Instruction pointer
    pub ip: u64,
    /// Encoded bytes, exactly this instruction's length
    pub bytes: Vec<u8>,
    /// Formatted text, mnemonic first
    pub text: String,
}

/// Signals that no decoding result can be produced; the adapter substitutes
/// the hex-dump fallback and never propagates this further
#[derive(Debug)]
pub struct DecoderUnavailable;

/// The pluggable decoding operation
pub trait InstructionDecoder {
    fn decode(
        &self,
        code: &[u8],
        base_va: u64,
        bits: u32,
    ) -> Result<Vec<RawInst>, DecoderUnavailable>;
}

/// A disassembly listing plus the flag telling whether it came from the
/// hex framer instead of a real decoder
#[derive(Debug, Clone, Serialize)]
pub struct Disassembly {
    pub instructions: Vec<Instruction>,
    pub fallback: bool,
}

const FALLBACK_ROW_LEN: usize = 16;

/// Decode a code buffer, degrading to the hex framer when the decoder is
/// absent or fails. Word widths other than 16/32/64 are clamped to 32.
pub fn disassemble(
    decoder: Option<&dyn InstructionDecoder>,
    code: &[u8],
    base_va: u64,
    bits: u32,
    config: &Config,
) -> Disassembly {
    let bits = match bits {
        16 | 32 | 64 => bits,
        _ => 32,
    };
    let code = &code[..code.len().min(config.max_decode_bytes)];

    if let Some(dec) = decoder {
        match dec.decode(code, base_va, bits) {
            Ok(raw) => {
                let instructions = raw
                    .into_iter()
                    .take(config.max_decode_insts)
                    .map(|r| format_inst(&r, bits))
                    .collect();
                return Disassembly {
                    instructions,
                    fallback: false,
                };
            }
            Err(DecoderUnavailable) => {
                debug!("decoder unavailable, substituting hex framer");
            }
        }
    }

    Disassembly {
        instructions: hex_rows(code, base_va, config.max_fallback_rows),
        fallback: true,
    }
}

fn format_inst(raw: &RawInst, bits: u32) -> Instruction {
    let text = raw.text.trim();
    let (mnemonic, operands) = match text.split_once(' ') {
        Some((m, o)) => (m.to_lowercase(), o.trim().to_lowercase()),
        None => (text.to_lowercase(), String::new()),
    };
    Instruction {
        address: canon_addr(raw.ip, bits),
        bytes: hex_bytes(&raw.bytes),
        mnemonic,
        operands,
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// The fallback shares the instruction record shape: one row per 16 bytes,
// the ASCII transliteration standing in for the mnemonic column
fn hex_rows(code: &[u8], base_va: u64, max_rows: usize) -> Vec<Instruction> {
    code.chunks(FALLBACK_ROW_LEN)
        .take(max_rows)
        .enumerate()
        .map(|(i, row)| Instruction {
            address: format!("{:#010x}", base_va + (i * FALLBACK_ROW_LEN) as u64),
            bytes: hex_bytes(row),
            mnemonic: row
                .iter()
                .map(|&b| {
                    if (0x20..=0x7e).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
            operands: String::new(),
        })
        .collect()
}
