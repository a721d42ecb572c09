//! Textual operand parsing for the interpreter
//!
//! Accepts the NASM-flavored forms emitted by the decoder: an optional
//! width keyword, bracketed memory expressions, register names and
//! immediates in `Nh`, `0xN` or decimal notation.
use crate::cpu::{Registers, resolve_reg};

/// One signed term of a memory address expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Reg { name: String, scale: u64, neg: bool },
    Imm { value: u64, neg: bool },
}

/// A parsed `[...]` memory operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRef {
    pub terms: Vec<Term>,
    /// Width in bits when a size keyword prefixed the operand
    pub width: Option<u32>,
}

/// Operand kinds the interpreter can act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(String),
    Mem(MemRef),
    Imm(u64),
    Unknown,
}

/// Immediate in `Nh`, `0xN` or decimal form, two's complement for a
/// leading minus
pub fn parse_imm(text: &str) -> Option<u64> {
    let s = text.trim();
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, s),
    };
    let value = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = s.strip_suffix('h') {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()?
    } else {
        s.parse::<u64>().ok()?
    };
    Some(if neg { value.wrapping_neg() } else { value })
}

fn parse_term(text: &str, neg: bool) -> Option<Term> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    if let Some((a, b)) = s.split_once('*') {
        // scaled index, written reg*N or N*reg
        let (reg, scale) = if resolve_reg(a.trim()).is_some() {
            (a.trim(), parse_imm(b)?)
        } else if resolve_reg(b.trim()).is_some() {
            (b.trim(), parse_imm(a)?)
        } else {
            return None;
        };
        return Some(Term::Reg {
            name: reg.to_string(),
            scale,
            neg,
        });
    }
    if resolve_reg(s).is_some() {
        return Some(Term::Reg {
            name: s.to_string(),
            scale: 1,
            neg,
        });
    }
    parse_imm(s).map(|value| Term::Imm { value, neg })
}

fn parse_mem_expr(expr: &str, width: Option<u32>) -> Option<MemRef> {
    let mut terms = Vec::new();
    let mut rest = expr.trim();
    let mut neg = false;
    if let Some(r) = rest.strip_prefix('-') {
        neg = true;
        rest = r;
    }
    loop {
        let (chunk, next) = match rest.find(['+', '-']) {
            Some(i) => (&rest[..i], Some((rest.as_bytes()[i] == b'-', &rest[i + 1..]))),
            None => (rest, None),
        };
        terms.push(parse_term(chunk, neg)?);
        match next {
            Some((sign, r)) => {
                neg = sign;
                rest = r;
            }
            None => break,
        }
    }
    Some(MemRef { terms, width })
}

/// Parse one operand. The optional `qword|dword|word|byte` keyword sets
/// the access width of a memory operand.
pub fn parse_operand(text: &str) -> Operand {
    let mut s = text.trim();
    let mut width = None;
    for (kw, w) in [("qword ", 64), ("dword ", 32), ("word ", 16), ("byte ", 8)] {
        if let Some(rest) = s.strip_prefix(kw) {
            width = Some(w);
            s = rest.trim();
            break;
        }
    }
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return match parse_mem_expr(inner, width) {
            Some(mem) => Operand::Mem(mem),
            None => Operand::Unknown,
        };
    }
    if resolve_reg(s).is_some() {
        return Operand::Reg(s.to_string());
    }
    match parse_imm(s) {
        Some(value) => Operand::Imm(value),
        None => Operand::Unknown,
    }
}

/// Evaluate a memory expression: signed terms summed modulo 2^64
pub fn eval_mem(mem: &MemRef, regs: &Registers) -> Option<u64> {
    let mut sum = 0u64;
    for term in &mem.terms {
        let value = match term {
            Term::Reg { name, scale, neg } => {
                let v = regs.get(name)?.wrapping_mul(*scale);
                if *neg { v.wrapping_neg() } else { v }
            }
            Term::Imm { value, neg } => {
                if *neg {
                    value.wrapping_neg()
                } else {
                    *value
                }
            }
        };
        sum = sum.wrapping_add(value);
    }
    Some(sum)
}
