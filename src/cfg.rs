//! Basic-block partitioning and successor edges over a linear listing
use crate::analysis::{is_jcc, parse_target};
use crate::disasm::Instruction;
use serde::Serialize;
use std::collections::BTreeSet;

/// How control reaches a successor block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Fall,
    Jump,
}

/// Successor edge of a basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// Address of the successor block
    pub to: u64,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
}

/// Maximal straight-line run of instructions with a single entry
#[derive(Debug, Clone, Serialize)]
pub struct BasicBlock {
    /// Address of the first instruction
    pub id: u64,
    pub insts: Vec<Instruction>,
    pub succs: Vec<Edge>,
}

const BLOCK_ENDERS: [&str; 7] = ["jmp", "ret", "retn", "retq", "retf", "ud2", "hlt"];
const NO_FLOW: [&str; 6] = ["ret", "retn", "retq", "retf", "ud2", "hlt"];

fn ends_block(mnemonic: &str) -> bool {
    BLOCK_ENDERS.contains(&mnemonic) || is_jcc(mnemonic) || mnemonic == "call"
}

/// Partition the linear listing into basic blocks and classify the edges
/// leaving each block. Blocks are referenced by address, never by pointer.
pub fn build_cfg(insts: &[Instruction]) -> Vec<BasicBlock> {
    let addrs: Vec<Option<u64>> = insts.iter().map(|i| i.addr()).collect();
    let in_map: BTreeSet<u64> = addrs.iter().flatten().copied().collect();

    // Leaders: the first instruction, every instruction after a
    // control-transfer, and every resolvable direct target
    let mut starts: BTreeSet<u64> = BTreeSet::new();
    if let Some(Some(first)) = addrs.first() {
        starts.insert(*first);
    }
    for (i, inst) in insts.iter().enumerate() {
        if !ends_block(&inst.mnemonic) {
            continue;
        }
        if let Some(Some(next)) = addrs.get(i + 1) {
            starts.insert(*next);
        }
        if let Some(target) = parse_target(&inst.operands) {
            if in_map.contains(&target) {
                starts.insert(target);
            }
        }
    }

    let mut blocks: Vec<BasicBlock> = Vec::new();
    for (inst, addr) in insts.iter().zip(&addrs) {
        let open_new = match addr {
            Some(a) => starts.contains(a) || blocks.is_empty(),
            None => blocks.is_empty(),
        };
        if open_new {
            blocks.push(BasicBlock {
                id: addr.unwrap_or(0),
                insts: Vec::new(),
                succs: Vec::new(),
            });
        }
        blocks.last_mut().unwrap().insts.push(inst.clone());
    }

    for i in 0..blocks.len() {
        let next_id = blocks.get(i + 1).map(|b| b.id);
        let Some(last) = blocks[i].insts.last() else {
            continue;
        };
        let mnemonic = last.mnemonic.as_str();
        let target = parse_target(&last.operands).filter(|t| in_map.contains(t));
        let mut succs = Vec::new();
        if is_jcc(mnemonic) {
            if let Some(to) = next_id {
                succs.push(Edge {
                    to,
                    kind: EdgeKind::Fall,
                });
            }
            if let Some(to) = target {
                succs.push(Edge {
                    to,
                    kind: EdgeKind::Jump,
                });
            }
        } else if mnemonic == "jmp" {
            if let Some(to) = target {
                succs.push(Edge {
                    to,
                    kind: EdgeKind::Jump,
                });
            }
        } else if NO_FLOW.contains(&mnemonic) {
            // no successors past an end-of-flow instruction
        } else if let Some(to) = next_id {
            succs.push(Edge {
                to,
                kind: EdgeKind::Fall,
            });
        }
        blocks[i].succs = succs;
    }
    blocks
}

#[cfg(test)]
mod test {
    use super::*;

    fn inst(address: u64, mnemonic: &str, operands: &str) -> Instruction {
        Instruction {
            address: format!("{address:#010x}"),
            bytes: String::new(),
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
        }
    }

    #[test]
    fn conditional_split() {
        let insts = vec![
            inst(0x00, "mov", "eax, 1"),
            inst(0x05, "jne", "0x10"),
            inst(0x08, "mov", "ebx, 2"),
            inst(0x0d, "jmp", "0x18"),
            inst(0x10, "mov", "ecx, 3"),
            inst(0x15, "nop", ""),
            inst(0x18, "ret", ""),
        ];
        let blocks = build_cfg(&insts);
        assert_eq!(blocks.len(), 4, "block count mismatch");
        assert_eq!(blocks[0].id, 0x00);
        assert_eq!(
            blocks[0].succs,
            vec![
                Edge {
                    to: 0x08,
                    kind: EdgeKind::Fall
                },
                Edge {
                    to: 0x10,
                    kind: EdgeKind::Jump
                },
            ]
        );
        assert_eq!(
            blocks[1].succs,
            vec![Edge {
                to: 0x18,
                kind: EdgeKind::Jump
            }]
        );
        assert_eq!(
            blocks[2].succs,
            vec![Edge {
                to: 0x18,
                kind: EdgeKind::Fall
            }]
        );
        assert!(blocks[3].succs.is_empty(), "ret block has successors");
    }

    #[test]
    fn call_falls_through() {
        let insts = vec![
            inst(0x00, "call", "0x20"),
            inst(0x05, "mov", "eax, 1"),
            inst(0x0a, "ret", ""),
        ];
        let blocks = build_cfg(&insts);
        assert_eq!(blocks.len(), 2, "block count mismatch");
        assert_eq!(
            blocks[0].succs,
            vec![Edge {
                to: 0x05,
                kind: EdgeKind::Fall
            }]
        );
    }
}
