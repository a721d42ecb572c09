//! Deterministic single-stepping interpreter over a decoded listing
//!
//! The interpreter owns all of its mutable state (registers, flags, paged
//! memory, breakpoints) and never mutates the instruction list it was
//! loaded with. Traps are returned as values; they do not corrupt state.
use crate::analysis::is_jcc;
use crate::config::Config;
use crate::cpu::{Flags, PAGE_SIZE, PagedMemory, Registers, resolve_reg, width_mask};
use crate::disasm::Instruction;
use crate::operand::{MemRef, Operand, eval_mem, parse_operand};
use crate::report::Report;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Initial stack pointer after a reset
pub const STACK_TOP: u64 = 0x7fff_0000;

/// Outcome of one `step`
#[derive(Debug)]
pub enum StepResult {
    Ok { inst: Instruction },
    Trap { error: String, inst: Option<Instruction> },
}

impl StepResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepResult::Ok { .. })
    }
}

/// Why a `run` session stopped
#[derive(Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The new `rip` landed on a breakpoint
    Breakpoint(u64),
    /// A step trapped
    Trap(String),
    /// The per-session step cap was reached
    StepCap,
    /// The caller's cancellation check fired
    Cancelled,
}

/// Result of a `run` session
#[derive(Debug)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub steps: usize,
}

fn two_ops<'a>(ops: &'a [Operand], what: &str) -> Result<(&'a Operand, &'a Operand), String> {
    match ops {
        [dst, src, ..] => Ok((dst, src)),
        _ => Err(format!("{what} expects two operands")),
    }
}

fn one_op<'a>(ops: &'a [Operand], what: &str) -> Result<&'a Operand, String> {
    ops.first()
        .ok_or_else(|| format!("{what} expects an operand"))
}

pub struct Interpreter {
    bits: u32,
    insts: Vec<Instruction>,
    by_addr: HashMap<u64, usize>,
    regs: Registers,
    flags: Flags,
    mem: PagedMemory,
    breakpoints: BTreeSet<u64>,
}

impl Interpreter {
    pub fn new(bits: u32) -> Self {
        Self {
            bits: match bits {
                16 | 32 | 64 => bits,
                _ => 32,
            },
            insts: Vec::new(),
            by_addr: HashMap::new(),
            regs: Registers::default(),
            flags: Flags::default(),
            mem: PagedMemory::default(),
            breakpoints: BTreeSet::new(),
        }
    }

    /// Build an interpreter over a report's disassembly listing
    pub fn from_report(report: &Report) -> Self {
        let mut interp = Self::new(report.file.bits);
        interp.load(&report.disasm.instructions);
        interp
    }

    /// Reset registers, flags and memory, then adopt a listing: `rip` at
    /// the first instruction, `rsp` at the stack top with a few stack
    /// pages pre-touched so dumps render.
    pub fn load(&mut self, insts: &[Instruction]) {
        self.insts = insts.to_vec();
        self.by_addr = self
            .insts
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| inst.addr().map(|a| (a, i)))
            .collect();
        self.reset();
    }

    /// Reset machine state without dropping the listing or breakpoints
    pub fn reset(&mut self) {
        self.regs.clear();
        self.flags.clear();
        self.mem.clear();
        if let Some(first) = self.insts.first().and_then(|i| i.addr()) {
            self.regs.set_rip(first);
        }
        self.regs.set_rsp(STACK_TOP);
        for i in 0..3u64 {
            self.mem.touch(STACK_TOP - i * PAGE_SIZE);
        }
    }

    fn word_bytes(&self) -> u32 {
        self.bits / 8
    }

    pub fn registers(&self) -> Vec<(&'static str, u64)> {
        self.regs.snapshot()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn reg(&self, name: &str) -> Option<u64> {
        self.regs.get(name)
    }

    pub fn set_reg(&mut self, name: &str, value: u64) -> Option<()> {
        self.regs.set(name, value)
    }

    pub fn read_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        self.mem.read_block(addr, len)
    }

    pub fn write_mem(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.mem.write_u8(addr.wrapping_add(i as u64), b);
        }
    }

    pub fn add_breakpoint(&mut self, addr: u64) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u64) {
        self.breakpoints.remove(&addr);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.breakpoints.iter().copied()
    }

    /// Execute the instruction at the current `rip`. The fallthrough
    /// address is committed before dispatch; control transfers overwrite
    /// it during execution.
    pub fn step(&mut self) -> StepResult {
        let rip = self.regs.rip();
        let Some(&idx) = self.by_addr.get(&rip) else {
            return StepResult::Trap {
                error: "RIP at unmapped address".to_string(),
                inst: None,
            };
        };
        let inst = self.insts[idx].clone();
        let rip_next = self
            .insts
            .get(idx + 1)
            .and_then(|i| i.addr())
            .unwrap_or(rip);
        self.regs.set_rip(rip_next);
        match self.exec(&inst, rip_next) {
            Ok(()) => StepResult::Ok { inst },
            Err(error) => StepResult::Trap {
                error,
                inst: Some(inst),
            },
        }
    }

    /// Cooperative run loop: fixed-size step batches with the cancellation
    /// check observed at batch boundaries, a breakpoint check after every
    /// step and a hard per-session step cap.
    pub fn run(&mut self, config: &Config, mut cancel: impl FnMut() -> bool) -> RunOutcome {
        let mut steps = 0usize;
        loop {
            if cancel() {
                return RunOutcome {
                    reason: StopReason::Cancelled,
                    steps,
                };
            }
            for _ in 0..config.step_batch {
                match self.step() {
                    StepResult::Ok { .. } => steps += 1,
                    StepResult::Trap { error, .. } => {
                        return RunOutcome {
                            reason: StopReason::Trap(error),
                            steps,
                        };
                    }
                }
                let rip = self.regs.rip();
                if self.breakpoints.contains(&rip) {
                    return RunOutcome {
                        reason: StopReason::Breakpoint(rip),
                        steps,
                    };
                }
                if steps >= config.max_run_steps {
                    debug!("run session hit the step cap");
                    return RunOutcome {
                        reason: StopReason::StepCap,
                        steps,
                    };
                }
            }
            std::thread::yield_now();
        }
    }

    fn operands(inst: &Instruction) -> Vec<Operand> {
        if inst.operands.trim().is_empty() {
            return Vec::new();
        }
        inst.operands.split(',').map(parse_operand).collect()
    }

    // Operand width in bits: register width first, then an explicit memory
    // size keyword, then the machine word
    fn op_width(&self, ops: &[Operand]) -> u32 {
        for op in ops {
            if let Operand::Reg(name) = op {
                if let Some(r) = resolve_reg(name) {
                    return r.width;
                }
            }
        }
        for op in ops {
            if let Operand::Mem(m) = op {
                if let Some(w) = m.width {
                    return w;
                }
            }
        }
        self.bits
    }

    fn mem_addr(&self, mem: &MemRef) -> Result<u64, String> {
        eval_mem(mem, &self.regs).ok_or_else(|| "unresolvable memory operand".to_string())
    }

    fn read_operand(&self, op: &Operand, width: u32) -> Result<u64, String> {
        match op {
            Operand::Reg(name) => self
                .regs
                .get(name)
                .ok_or_else(|| format!("unknown register {name}")),
            Operand::Imm(value) => Ok(value & width_mask(width)),
            Operand::Mem(mem) => {
                let addr = self.mem_addr(mem)?;
                Ok(self.mem.read(addr, width / 8))
            }
            Operand::Unknown => Err("unsupported operand form".to_string()),
        }
    }

    fn write_operand(&mut self, op: &Operand, width: u32, value: u64) -> Result<(), String> {
        match op {
            Operand::Reg(name) => self
                .regs
                .set(name, value)
                .ok_or_else(|| format!("unknown register {name}")),
            Operand::Mem(mem) => {
                let addr = self.mem_addr(mem)?;
                self.mem.write(addr, value, width / 8);
                Ok(())
            }
            Operand::Imm(_) | Operand::Unknown => {
                Err("destination operand is not writable".to_string())
            }
        }
    }

    // Branch targets: a register is read, an immediate is taken as is and
    // a single-level memory operand is dereferenced at word width
    fn resolve_target(&self, op: &Operand) -> Result<u64, String> {
        match op {
            Operand::Reg(name) => self
                .regs
                .get(name)
                .ok_or_else(|| format!("unknown register {name}")),
            Operand::Imm(value) => Ok(*value),
            Operand::Mem(mem) => {
                let addr = self.mem_addr(mem)?;
                Ok(self.mem.read(addr, self.word_bytes()))
            }
            Operand::Unknown => Err("unresolvable branch target".to_string()),
        }
    }

    fn arith(&mut self, a: u64, b: u64, width: u32, sub: bool) -> u64 {
        let mask = width_mask(width);
        let raw = if sub {
            a as i128 - b as i128
        } else {
            a as i128 + b as i128
        };
        let result = (raw as u64) & mask;
        let top = 1u64 << (width - 1);
        let (sa, sb, sr) = (a & top != 0, b & top != 0, result & top != 0);
        self.flags.zf = result == 0;
        self.flags.sf = sr;
        self.flags.cf = raw > mask as i128 || raw < 0;
        self.flags.of = if sub {
            sa != sb && sr != sa
        } else {
            sa == sb && sr != sa
        };
        self.flags.pf = (result as u8).count_ones() % 2 == 0;
        self.flags.af = (a ^ b ^ result) & 0x10 != 0;
        result
    }

    fn logic_flags(&mut self, result: u64, width: u32) {
        let top = 1u64 << (width - 1);
        self.flags.cf = false;
        self.flags.of = false;
        self.flags.zf = result == 0;
        self.flags.sf = result & top != 0;
        self.flags.pf = (result as u8).count_ones() % 2 == 0;
    }

    fn sign_extend(value: u64, from: u32) -> u64 {
        let top = 1u64 << (from - 1);
        if value & top != 0 {
            value | !width_mask(from)
        } else {
            value
        }
    }

    fn exec(&mut self, inst: &Instruction, rip_next: u64) -> Result<(), String> {
        let mnemonic = inst.mnemonic.trim().to_lowercase();
        let ops = Self::operands(inst);
        let word = self.word_bytes();

        match mnemonic.as_str() {
            "nop" | "int3" | "endbr64" | "endbr32" | "pause" => Ok(()),

            "mov" | "movq" | "movl" => {
                let (dst, src) = two_ops(&ops, "mov")?;
                let width = self.op_width(&ops);
                let value = self.read_operand(src, width)?;
                self.write_operand(dst, width, value)
            }
            "movzx" => {
                let (dst, src) = two_ops(&ops, "movzx")?;
                let dst_width = self.op_width(std::slice::from_ref(dst));
                let src_width = match src {
                    Operand::Reg(name) => resolve_reg(name).map(|r| r.width).unwrap_or(8),
                    Operand::Mem(m) => m.width.unwrap_or(8),
                    _ => 8,
                };
                let value = self.read_operand(src, src_width)?;
                self.write_operand(dst, dst_width, value)
            }
            "movsx" | "movsxd" => {
                let (dst, src) = two_ops(&ops, "movsx")?;
                let dst_width = self.op_width(std::slice::from_ref(dst));
                let src_width = match src {
                    Operand::Reg(name) => resolve_reg(name).map(|r| r.width).unwrap_or(32),
                    Operand::Mem(m) => m.width.unwrap_or(32),
                    _ => 32,
                };
                let value = self.read_operand(src, src_width)?;
                let extended = Self::sign_extend(value, src_width) & width_mask(dst_width);
                self.write_operand(dst, dst_width, extended)
            }

            "push" => {
                let src = one_op(&ops, "push")?;
                let width = self.op_width(&ops);
                let value = self.read_operand(src, width)?;
                let rsp = self.regs.rsp().wrapping_sub(word as u64);
                self.regs.set_rsp(rsp);
                self.mem.write(rsp, value, word);
                Ok(())
            }
            "pop" => {
                let dst = one_op(&ops, "pop")?;
                let width = self.op_width(&ops);
                let rsp = self.regs.rsp();
                let value = self.mem.read(rsp, word);
                self.regs.set_rsp(rsp.wrapping_add(word as u64));
                self.write_operand(dst, width, value)
            }

            "add" | "sub" | "cmp" => {
                let (dst, src) = two_ops(&ops, &mnemonic)?;
                let width = self.op_width(&ops);
                let a = self.read_operand(dst, width)?;
                let b = self.read_operand(src, width)?;
                let result = self.arith(a, b, width, mnemonic != "add");
                if mnemonic == "cmp" {
                    Ok(())
                } else {
                    self.write_operand(dst, width, result)
                }
            }
            "xor" | "and" | "or" | "test" => {
                let (dst, src) = two_ops(&ops, &mnemonic)?;
                let width = self.op_width(&ops);
                let a = self.read_operand(dst, width)?;
                let b = self.read_operand(src, width)?;
                let result = match mnemonic.as_str() {
                    "xor" => a ^ b,
                    "or" => a | b,
                    _ => a & b,
                } & width_mask(width);
                self.logic_flags(result, width);
                if mnemonic == "test" {
                    Ok(())
                } else {
                    self.write_operand(dst, width, result)
                }
            }
            "not" => {
                let dst = one_op(&ops, "not")?;
                let width = self.op_width(&ops);
                let a = self.read_operand(dst, width)?;
                self.write_operand(dst, width, !a & width_mask(width))
            }
            "neg" => {
                let dst = one_op(&ops, "neg")?;
                let width = self.op_width(&ops);
                let a = self.read_operand(dst, width)?;
                let result = a.wrapping_neg() & width_mask(width);
                let top = 1u64 << (width - 1);
                self.flags.cf = a != 0;
                self.flags.of = a == top;
                self.flags.zf = result == 0;
                self.flags.sf = result & top != 0;
                self.flags.pf = (result as u8).count_ones() % 2 == 0;
                self.write_operand(dst, width, result)
            }
            "inc" | "dec" => {
                let dst = one_op(&ops, &mnemonic)?;
                let width = self.op_width(&ops);
                let a = self.read_operand(dst, width)?;
                let carry = self.flags.cf;
                let result = self.arith(a, 1, width, mnemonic == "dec");
                self.flags.cf = carry;
                self.write_operand(dst, width, result)
            }

            "lea" => {
                let (dst, src) = two_ops(&ops, "lea")?;
                let width = self.op_width(std::slice::from_ref(dst));
                let Operand::Mem(mem) = src else {
                    return Err("lea expects a memory source".to_string());
                };
                let addr = self.mem_addr(mem)?;
                self.write_operand(dst, width, addr)
            }

            "shl" | "sal" | "shr" | "sar" => {
                let dst = one_op(&ops, &mnemonic)?;
                let width = self.op_width(std::slice::from_ref(dst));
                let count = match ops.get(1) {
                    Some(op) => self.read_operand(op, 8)?,
                    None => 1,
                };
                let count = ((count & 0x3f) % width as u64) as u32;
                let a = self.read_operand(dst, width)?;
                if count == 0 {
                    return Ok(());
                }
                let mask = width_mask(width);
                let (result, last_out) = match mnemonic.as_str() {
                    "shr" => (a >> count, (a >> (count - 1)) & 1),
                    "sar" => {
                        let signed = Self::sign_extend(a, width);
                        (
                            ((signed as i64) >> count) as u64 & mask,
                            (a >> (count - 1)) & 1,
                        )
                    }
                    _ => ((a << count) & mask, (a >> (width - count)) & 1),
                };
                self.flags.cf = last_out != 0;
                self.flags.zf = result == 0;
                self.flags.sf = result & (1u64 << (width - 1)) != 0;
                self.flags.pf = (result as u8).count_ones() % 2 == 0;
                self.write_operand(dst, width, result)
            }

            "call" => {
                let target = self.resolve_target(one_op(&ops, "call")?)?;
                let rsp = self.regs.rsp().wrapping_sub(word as u64);
                self.regs.set_rsp(rsp);
                self.mem.write(rsp, rip_next, word);
                self.regs.set_rip(target);
                Ok(())
            }
            "ret" | "retn" | "retq" => {
                let rsp = self.regs.rsp();
                let target = self.mem.read(rsp, word);
                self.regs.set_rsp(rsp.wrapping_add(word as u64));
                self.regs.set_rip(target);
                Ok(())
            }
            "jmp" => {
                let target = self.resolve_target(one_op(&ops, "jmp")?)?;
                self.regs.set_rip(target);
                Ok(())
            }

            m if is_jcc(m) => {
                // never-taken members of the set simply fall through
                let taken = self
                    .flags
                    .check_jcc(m)
                    .ok_or_else(|| format!("unsupported condition {m}"))?;
                if taken {
                    let target = self.resolve_target(one_op(&ops, &mnemonic)?)?;
                    self.regs.set_rip(target);
                }
                Ok(())
            }

            other => Err(format!("unsupported mnemonic {other}")),
        }
    }
}
