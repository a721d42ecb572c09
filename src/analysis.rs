//! Static control-flow facts: cross-references, function starts and
//! byte-signature hits over the decoded code section
use crate::binary::{canon_addr, func_label};
use crate::config::Config;
use crate::disasm::Instruction;
use aho_corasick::AhoCorasick;
use serde::Serialize;
use std::collections::BTreeMap;

/// The closed set of conditional-branch mnemonics recognized by the xref
/// builder, the CFG builder and the interpreter's condition table
pub const JCC_MNEMONICS: [&str; 36] = [
    "jo", "jno", "js", "jns", "je", "jne", "jz", "jnz", "jb", "jnae", "jc", "jnb", "jae", "jnc",
    "jbe", "jna", "ja", "jnbe", "jl", "jnge", "jge", "jnl", "jle", "jng", "jg", "jnle", "jp",
    "jpe", "jnp", "jpo", "jcxz", "jecxz", "jrcxz", "loop", "loope", "loopne",
];

pub fn is_jcc(mnemonic: &str) -> bool {
    JCC_MNEMONICS.contains(&mnemonic)
}

/// Kind of a static branch site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XrefKind {
    Call,
    Jmp,
    Jcc,
}

/// One branch site naming a target
#[derive(Debug, Clone, Serialize)]
pub struct XrefEntry {
    /// Canonical address of the referencing instruction
    pub from: String,
    #[serde(rename = "type")]
    pub kind: XrefKind,
}

/// A byte-signature match inside the code section
#[derive(Debug, Clone, Serialize)]
pub struct SigHit {
    pub address: String,
    pub name: String,
    pub note: String,
}

/// Direct branch/call target parsing. Only the two immediate forms are
/// accepted (`NNNNh` and `0xNNNN`); registers, memory expressions and
/// symbols are indirect and yield None.
pub fn parse_target(operand: &str) -> Option<u64> {
    let op = operand.trim();
    if let Some(hex) = op.strip_prefix("0x").or_else(|| op.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    let hex = op.strip_suffix('h').or_else(|| op.strip_suffix('H'))?;
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Build the reverse index from branch targets to their static call/jump
/// sites. Indirect operands are skipped.
pub fn build_xrefs(insts: &[Instruction], bits: u32) -> BTreeMap<String, Vec<XrefEntry>> {
    let mut xrefs: BTreeMap<String, Vec<XrefEntry>> = BTreeMap::new();
    for inst in insts {
        let mnemonic = inst.mnemonic.trim().to_lowercase();
        let kind = match mnemonic.as_str() {
            "call" => XrefKind::Call,
            "jmp" => XrefKind::Jmp,
            m if is_jcc(m) => XrefKind::Jcc,
            _ => continue,
        };
        let Some(target) = parse_target(&inst.operands) else {
            continue;
        };
        xrefs
            .entry(canon_addr(target, bits))
            .or_default()
            .push(XrefEntry {
                from: inst.address.clone(),
                kind,
            });
    }
    xrefs
}

const END_OF_FLOW: [&str; 7] = ["ret", "retn", "retq", "retf", "ud2", "hlt", "int3"];

/// Linear function-start detection: a new function begins at the first
/// non-`int3` instruction after an end-of-flow instruction. Padding bytes
/// decoded as `int3` end a function but never start one.
pub fn detect_functions(insts: &[Instruction]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut at_boundary = true;
    for inst in insts {
        let mnemonic = inst.mnemonic.trim().to_lowercase();
        if at_boundary && mnemonic != "int3" {
            let label = match inst.addr() {
                Some(addr) => func_label(addr),
                None => format!("sub_{}", inst.address.trim_start_matches("0x")),
            };
            labels.insert(inst.address.clone(), label);
            at_boundary = false;
        }
        if END_OF_FLOW.contains(&mnemonic.as_str()) {
            at_boundary = true;
        }
    }
    labels
}

struct Signature {
    pattern: &'static [u8],
    name: &'static str,
    note: &'static str,
}

const SIGNATURES: [Signature; 8] = [
    Signature {
        pattern: b"\xf3\xaa",
        name: "rep stosb",
        note: "byte memory fill",
    },
    Signature {
        pattern: b"\xf3\xab",
        name: "rep stosd",
        note: "dword memory fill",
    },
    Signature {
        pattern: b"\xf3\xa4",
        name: "rep movsb",
        note: "byte memory copy",
    },
    Signature {
        pattern: b"\xf3\xa5",
        name: "rep movsd",
        note: "dword memory copy",
    },
    Signature {
        pattern: b"\x0f\x05",
        name: "syscall",
        note: "64-bit system call gate",
    },
    Signature {
        pattern: b"\xcd\x80",
        name: "int 0x80",
        note: "legacy 32-bit Linux system call",
    },
    Signature {
        pattern: b"\xff\x25",
        name: "jmp [mem]",
        note: "indirect jump, import thunk shape",
    },
    Signature {
        pattern: b"\xff\x15",
        name: "call [mem]",
        note: "indirect call through a pointer, import call shape",
    },
];

/// Scan the head of the code buffer for the fixed byte patterns. Hits are
/// reported pattern-major; matches of the same pattern never overlap.
pub fn scan_signatures(code: &[u8], base_va: u64, bits: u32, config: &Config) -> Vec<SigHit> {
    let window = &code[..code.len().min(config.max_signature_scan)];
    let mut hits = Vec::new();
    for sig in &SIGNATURES {
        let ac = AhoCorasick::new([sig.pattern]).unwrap();
        for m in ac.find_iter(window) {
            hits.push(SigHit {
                address: canon_addr(base_va + m.start() as u64, bits),
                name: sig.name.to_string(),
                note: sig.note.to_string(),
            });
        }
    }
    hits
}

#[cfg(test)]
mod test {
    use super::*;

    fn inst(address: &str, mnemonic: &str, operands: &str) -> Instruction {
        Instruction {
            address: address.to_string(),
            bytes: String::new(),
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
        }
    }

    #[test]
    fn target_forms() {
        assert_eq!(parse_target("401000h"), Some(0x401000));
        assert_eq!(parse_target("0x401010"), Some(0x401010));
        assert_eq!(parse_target(" 0FFh "), Some(0xff));
        assert_eq!(parse_target("rax"), None);
        assert_eq!(parse_target("[rip+0x200]"), None);
        assert_eq!(parse_target("qword [rax]"), None);
    }

    #[test]
    fn xref_index() {
        let insts = vec![
            inst("0x00000100", "call", "401000h"),
            inst("0x00000105", "jne", "0x401010"),
            inst("0x0000010a", "jmp", "rax"),
        ];
        let xrefs = build_xrefs(&insts, 32);
        assert_eq!(xrefs.len(), 2, "xref count mismatch");
        let callers = &xrefs["0x00401000"];
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].from, "0x00000100");
        assert_eq!(callers[0].kind, XrefKind::Call);
        let jcc = &xrefs["0x00401010"];
        assert_eq!(jcc[0].from, "0x00000105");
        assert_eq!(jcc[0].kind, XrefKind::Jcc);
    }

    #[test]
    fn function_starts() {
        let stream = [
            ("0x00000010", "push"),
            ("0x00000011", "mov"),
            ("0x00000014", "ret"),
            ("0x00000015", "int3"),
            ("0x00000016", "int3"),
            ("0x00000017", "push"),
            ("0x00000018", "mov"),
            ("0x0000001b", "ret"),
        ];
        let insts: Vec<Instruction> = stream.iter().map(|(a, m)| inst(a, m, "")).collect();
        let labels = detect_functions(&insts);
        assert_eq!(labels.len(), 2, "label count mismatch");
        assert_eq!(labels["0x00000010"], "sub_10");
        assert_eq!(labels["0x00000017"], "sub_17");
    }

    #[test]
    fn signature_hits() {
        let config = Config::default();
        let hits = scan_signatures(b"\xf3\xaa\x90\xf3\xab", 0x400000, 32, &config);
        assert_eq!(hits.len(), 2, "hit count mismatch");
        assert_eq!(hits[0].address, "0x00400000");
        assert_eq!(hits[0].name, "rep stosb");
        assert_eq!(hits[1].address, "0x00400003");
        assert_eq!(hits[1].name, "rep stosd");
    }
}
