//! Ground-truth single-instruction interpreter.
//!
//! Executes exactly one guest instruction, including its delay slot
//! when the instruction is a branch or jump. Used both as the
//! reference execution path when the JIT is disabled (`jit_enabled =
//! false` in `CoreConfig`) and as the parity oracle difftest compares
//! JIT-executed blocks against.
//!
//! Grounded in `mips64_exec_single_instruction`/`mips64_exec_bdslot`
//! and the individual `mips64_exec_*` handlers in `mips64_exec.c`:
//! same field extraction, same delay-slot-then-redirect control flow,
//! same `res==0 -> pc+=4` / `res==1 -> pc already set` convention
//! (named `StepOutcome` here instead of a bare int).

use crate::cp0::ExcCode;
use crate::error::{CoreError, CoreResult, GuestFaultKind};
use crate::exception::{deliver_exception, exec_eret, poll_irq};
use crate::ilt::{self, decode_fields, Fields, OpKind};
use crate::mips_cpu::{MipsCpu, GPR_RA, TIMER_IRQ_LINE};
use crate::mts::{merge_ldl, merge_ldr, merge_lwl, merge_lwr, MemOpKind};

/// Abstracts instruction fetch and data access so the interpreter does
/// not need to own an `Mts`/device map directly; `mips_cpu`'s embedded
/// `Mts` plus a device dispatcher implement this in the full CPU loop.
pub trait Bus {
    fn fetch(&mut self, pc: u64) -> CoreResult<u32>;
    fn load(&mut self, vaddr: u64, op: MemOpKind) -> Result<u64, GuestFaultKind>;
    fn store(&mut self, vaddr: u64, op: MemOpKind, val: u64) -> Result<(), GuestFaultKind>;
}

fn sign_extend16(v: i16) -> i64 {
    v as i64
}

/// Outcome of executing one instruction (mirrors the donor's
/// `return(0)`/`return(1)` convention from `mips64_exec_*`).
pub enum StepOutcome {
    /// Sequential flow: caller must advance PC by 4.
    Sequential,
    /// PC has already been redirected (branch/jump/exception taken).
    Redirected,
}

pub struct Interp;

impl Interp {
    /// Executes the instruction at `cpu.pc`, including delay slot
    /// fetch/exec for branch and jump instructions. Returns once PC
    /// has been fully updated for the next step.
    pub fn step(cpu: &mut MipsCpu, bus: &mut impl Bus) -> CoreResult<()> {
        cpu.reset_zero_register();
        cpu.fault_pending = 0;

        let drained = cpu.timer_irq_pending.swap(0, std::sync::atomic::Ordering::AcqRel);
        if cpu.cp0.tick(1 + drained) {
            cpu.raise_irq(TIMER_IRQ_LINE);
        }
        poll_irq(cpu);
        if cpu.fault_pending != 0 {
            return Ok(());
        }

        let insn = bus.fetch(cpu.pc).map_err(|e| match e {
            CoreError::GuestFault { pc, .. } => CoreError::GuestFault {
                pc,
                kind: GuestFaultKind::BusErrorInstr,
            },
            other => other,
        })?;

        cpu.stats.insns_interpreted += 1;

        match Self::exec_one(cpu, bus, insn, false)? {
            StepOutcome::Sequential => cpu.pc = cpu.pc.wrapping_add(4),
            StepOutcome::Redirected => {}
        }
        Ok(())
    }

    /// Runs the instruction in the delay slot of a taken or not-taken
    /// branch. A further branch/jump there is an architectural error
    /// (`InvalidDelaySlot`), matching spec's invariant.
    fn exec_delay_slot(cpu: &mut MipsCpu, bus: &mut impl Bus) -> CoreResult<()> {
        let pc = cpu.pc.wrapping_add(4);
        let insn = bus.fetch(pc).map_err(|e| match e {
            CoreError::GuestFault { pc, .. } => CoreError::GuestFault {
                pc,
                kind: GuestFaultKind::BusErrorInstr,
            },
            other => other,
        })?;
        let fields = decode_fields(insn);
        let entry = ilt::decode(insn).ok_or(CoreError::UnknownOpcode { pc, insn })?;
        if matches!(
            entry.kind,
            OpKind::Branch | OpKind::BranchZ | OpKind::BranchLikely | OpKind::Jump | OpKind::JumpReg
        ) {
            return Err(CoreError::InvalidDelaySlot { pc });
        }
        cpu.stats.insns_interpreted += 1;
        let saved_pc = cpu.pc;
        cpu.pc = pc;
        Self::exec_one(cpu, bus, insn, true)?;
        cpu.pc = saved_pc;
        let _ = fields;
        Ok(())
    }

    fn exec_one(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        insn: u32,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        let pc = cpu.pc;
        let entry = match ilt::decode(insn) {
            Some(e) => e,
            None => return Err(CoreError::UnknownOpcode { pc, insn }),
        };
        let f = decode_fields(insn);

        macro_rules! fault {
            ($kind:expr) => {{
                deliver_exception(cpu, $kind.to_exc_code(), in_delay_slot);
                return Ok(StepOutcome::Redirected);
            }};
        }

        match entry.name {
            // ---------------- ALU reg-reg ----------------
            "add" | "addu" => {
                let res = (cpu.gpr[f.rs as usize] as u32).wrapping_add(cpu.gpr[f.rt as usize] as u32);
                cpu.set_gpr(f.rd as usize, res as i32 as i64 as u64);
            }
            "daddu" => {
                let res = cpu.gpr[f.rs as usize].wrapping_add(cpu.gpr[f.rt as usize]);
                cpu.set_gpr(f.rd as usize, res);
            }
            "subu" => {
                let res = (cpu.gpr[f.rs as usize] as u32).wrapping_sub(cpu.gpr[f.rt as usize] as u32);
                cpu.set_gpr(f.rd as usize, res as i32 as i64 as u64);
            }
            "dsubu" => {
                let res = cpu.gpr[f.rs as usize].wrapping_sub(cpu.gpr[f.rt as usize]);
                cpu.set_gpr(f.rd as usize, res);
            }
            "and" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rs as usize] & cpu.gpr[f.rt as usize]),
            "or" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rs as usize] | cpu.gpr[f.rt as usize]),
            "xor" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rs as usize] ^ cpu.gpr[f.rt as usize]),
            "nor" => cpu.set_gpr(f.rd as usize, !(cpu.gpr[f.rs as usize] | cpu.gpr[f.rt as usize])),
            "slt" => {
                let res = (cpu.gpr[f.rs as usize] as i64) < (cpu.gpr[f.rt as usize] as i64);
                cpu.set_gpr(f.rd as usize, res as u64);
            }
            "sltu" => {
                let res = cpu.gpr[f.rs as usize] < cpu.gpr[f.rt as usize];
                cpu.set_gpr(f.rd as usize, res as u64);
            }
            "move" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rs as usize]),
            "mfhi" => cpu.set_gpr(f.rd as usize, cpu.hi),
            "mflo" => cpu.set_gpr(f.rd as usize, cpu.lo),
            "mthi" => cpu.hi = cpu.gpr[f.rs as usize],
            "mtlo" => cpu.lo = cpu.gpr[f.rs as usize],

            // ---------------- ALU imm ----------------
            "addi" | "addiu" => {
                let val = sign_extend16(f.imm16) as u32;
                let res = (cpu.gpr[f.rs as usize] as u32).wrapping_add(val);
                cpu.set_gpr(f.rt as usize, res as i32 as i64 as u64);
            }
            "daddiu" => {
                let val = sign_extend16(f.imm16) as u64;
                cpu.set_gpr(f.rt as usize, cpu.gpr[f.rs as usize].wrapping_add(val));
            }
            "andi" => cpu.set_gpr(f.rt as usize, cpu.gpr[f.rs as usize] & (f.imm16 as u16 as u64)),
            "ori" => cpu.set_gpr(f.rt as usize, cpu.gpr[f.rs as usize] | (f.imm16 as u16 as u64)),
            "xori" => cpu.set_gpr(f.rt as usize, cpu.gpr[f.rs as usize] ^ (f.imm16 as u16 as u64)),
            "slti" => {
                let res = (cpu.gpr[f.rs as usize] as i64) < (sign_extend16(f.imm16));
                cpu.set_gpr(f.rt as usize, res as u64);
            }
            "sltiu" => {
                let res = cpu.gpr[f.rs as usize] < (sign_extend16(f.imm16) as u64);
                cpu.set_gpr(f.rt as usize, res as u64);
            }
            "lui" => cpu.set_gpr(f.rt as usize, ((sign_extend16(f.imm16)) << 16) as u64),
            "li" => cpu.set_gpr(f.rt as usize, sign_extend16(f.imm16) as u64),

            // ---------------- Shifts ----------------
            "sll" => cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as u32) << f.sa) as i32 as i64 as u64),
            "srl" => cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as u32) >> f.sa) as i32 as i64 as u64),
            "sra" => cpu.set_gpr(f.rd as usize, (((cpu.gpr[f.rt as usize] as u32) as i32) >> f.sa) as i64 as u64),
            "sllv" => {
                let sh = cpu.gpr[f.rs as usize] & 0x1f;
                cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as u32) << sh) as i32 as i64 as u64);
            }
            "srlv" => {
                let sh = cpu.gpr[f.rs as usize] & 0x1f;
                cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as u32) >> sh) as i32 as i64 as u64);
            }
            "srav" => {
                let sh = cpu.gpr[f.rs as usize] & 0x1f;
                cpu.set_gpr(f.rd as usize, (((cpu.gpr[f.rt as usize] as u32) as i32) >> sh) as i64 as u64);
            }
            "dsll" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] << f.sa),
            "dsll32" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] << (32 + f.sa)),
            "dsllv" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] << (cpu.gpr[f.rs as usize] & 0x3f)),
            "dsrl" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] >> f.sa),
            "dsrl32" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] >> (32 + f.sa)),
            "dsrlv" => cpu.set_gpr(f.rd as usize, cpu.gpr[f.rt as usize] >> (cpu.gpr[f.rs as usize] & 0x3f)),
            "dsra" => cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as i64) >> f.sa) as u64),
            "dsra32" => cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as i64) >> (32 + f.sa)) as u64),
            "dsrav" => {
                let sh = cpu.gpr[f.rs as usize] & 0x3f;
                cpu.set_gpr(f.rd as usize, ((cpu.gpr[f.rt as usize] as i64) >> sh) as u64);
            }

            // ---------------- Mul/div ----------------
            "mult" => {
                let res = (cpu.gpr[f.rs as usize] as i32 as i64) * (cpu.gpr[f.rt as usize] as i32 as i64);
                cpu.lo = (res as i32) as i64 as u64;
                cpu.hi = ((res >> 32) as i32) as i64 as u64;
            }
            "multu" => {
                let res = (cpu.gpr[f.rs as usize] as u32 as u64) * (cpu.gpr[f.rt as usize] as u32 as u64);
                cpu.lo = (res as u32 as i32) as i64 as u64;
                cpu.hi = ((res >> 32) as u32 as i32) as i64 as u64;
            }
            "div" => {
                let a = cpu.gpr[f.rs as usize] as i32;
                let b = cpu.gpr[f.rt as usize] as i32;
                if b != 0 {
                    cpu.lo = (a / b) as i64 as u64;
                    cpu.hi = (a % b) as i64 as u64;
                }
            }
            "divu" => {
                let a = cpu.gpr[f.rs as usize] as u32;
                let b = cpu.gpr[f.rt as usize] as u32;
                if b != 0 {
                    cpu.lo = (a / b) as i32 as i64 as u64;
                    cpu.hi = (a % b) as i32 as i64 as u64;
                }
            }

            // ---------------- Branches ----------------
            "b" | "beq" | "bal" | "beqz" | "beql" | "bgez" | "bgezal" | "bgezall" | "bgezl"
            | "bgtz" | "bgtzl" | "blez" | "blezl" | "bltz" | "bltzal" | "bltzall" | "bltzl"
            | "bne" | "bnel" => {
                return Self::exec_branch(cpu, bus, entry.name, &f, in_delay_slot);
            }

            // ---------------- Jumps ----------------
            "j" | "jal" => {
                let new_pc = (cpu.pc & !0x0FFF_FFFF) | ((f.target26 as u64) << 2);
                if entry.name == "jal" {
                    cpu.set_gpr(GPR_RA, cpu.pc.wrapping_add(8));
                }
                Self::exec_delay_slot(cpu, bus)?;
                cpu.pc = new_pc;
                return Ok(StepOutcome::Redirected);
            }
            "jr" | "jalr" => {
                let new_pc = cpu.gpr[f.rs as usize];
                if entry.name == "jalr" {
                    cpu.set_gpr(f.rd as usize, cpu.pc.wrapping_add(8));
                }
                Self::exec_delay_slot(cpu, bus)?;
                cpu.pc = new_pc;
                return Ok(StepOutcome::Redirected);
            }

            // ---------------- Loads/stores ----------------
            "lb" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lb, in_delay_slot),
            "lbu" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lbu, in_delay_slot),
            "lh" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lh, in_delay_slot),
            "lhu" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lhu, in_delay_slot),
            "lw" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lw, in_delay_slot),
            "lwu" => return Self::exec_load(cpu, bus, &f, MemOpKind::Lwu, in_delay_slot),
            "ld" => return Self::exec_load(cpu, bus, &f, MemOpKind::Ld, in_delay_slot),
            "ll" => return Self::exec_load(cpu, bus, &f, MemOpKind::Ll, in_delay_slot),
            "sb" => return Self::exec_store(cpu, bus, &f, MemOpKind::Sb, in_delay_slot),
            "sh" => return Self::exec_store(cpu, bus, &f, MemOpKind::Sh, in_delay_slot),
            "sw" => return Self::exec_store(cpu, bus, &f, MemOpKind::Sw, in_delay_slot),
            "sd" => return Self::exec_store(cpu, bus, &f, MemOpKind::Sd, in_delay_slot),
            "sc" => return Self::exec_store_conditional(cpu, bus, &f, in_delay_slot),

            "lwl" | "lwr" | "ldl" | "ldr" => {
                return Self::exec_unaligned_load(cpu, bus, &f, entry.name, in_delay_slot)
            }
            "swl" | "swr" | "sdl" | "sdr" => {
                return Self::exec_unaligned_store(cpu, bus, &f, entry.name, in_delay_slot)
            }

            "cache" | "pref" | "prefi" | "sync" | "nop" => {}

            // ---------------- CP0 / TLB ----------------
            "mfc0" => cpu.set_gpr(f.rt as usize, cpu.cp0.mfc0(f.rd as usize)),
            "mtc0" => {
                let val = cpu.gpr[f.rt as usize];
                let mut log_irq = || {};
                cpu.cp0.mtc0(f.rd as usize, val, &mut log_irq);
            }
            "dmfc0" => cpu.set_gpr(f.rt as usize, cpu.cp0.dmfc0(f.rd as usize)),
            "dmtc0" => {
                let val = cpu.gpr[f.rt as usize];
                let mut log_irq = || {};
                cpu.cp0.dmtc0(f.rd as usize, val, &mut log_irq);
            }
            "tlbp" => cpu.cp0.tlbp(),
            "tlbr" => cpu.cp0.tlbr(),
            "tlbwi" => {
                if let Some(idx) = cpu.cp0.tlbwi() {
                    for m in cpu.cp0.tlb_mappings(idx) {
                        cpu.mts.invalidate_page(m.vaddr);
                    }
                }
            }

            // ---------------- Traps ----------------
            "break" => fault!(GuestFaultKind::Breakpoint),
            "syscall" => fault!(GuestFaultKind::Syscall),
            "eret" => {
                exec_eret(cpu);
                return Ok(StepOutcome::Redirected);
            }

            _ => return Err(CoreError::UnknownOpcode { pc, insn }),
        }

        Ok(StepOutcome::Sequential)
    }

    fn exec_branch(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        name: &str,
        f: &Fields,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        if in_delay_slot {
            return Err(CoreError::InvalidDelaySlot { pc: cpu.pc });
        }
        let offset = sign_extend16(f.imm16) << 2;
        let new_pc = cpu.pc.wrapping_add(4).wrapping_add(offset as u64);
        let rs = cpu.gpr[f.rs as usize] as i64;
        let rt = cpu.gpr[f.rt as usize] as i64;

        let taken = match name {
            "b" | "bal" => true,
            "beq" | "beql" => rs == rt,
            "bne" | "bnel" => rs != rt,
            "beqz" => rs == 0,
            "bgez" | "bgezal" | "bgezall" => rs >= 0,
            "bgezl" => rs >= 0,
            "bgtz" | "bgtzl" => rs > 0,
            "blez" | "blezl" => rs <= 0,
            "bltz" | "bltzal" | "bltzall" => rs < 0,
            "bltzl" => rs < 0,
            _ => unreachable!(),
        };

        let links = matches!(
            name,
            "bal" | "bgezal" | "bgezall" | "bltzal" | "bltzall"
        );
        if links {
            cpu.set_gpr(GPR_RA, cpu.pc.wrapping_add(8));
        }

        let likely = matches!(
            name,
            "beql" | "bnel" | "bgezl" | "bgezall" | "bgtzl" | "blezl" | "bltzl" | "bltzall"
        );

        if likely {
            // "likely" branches only execute the delay slot when taken.
            if taken {
                Self::exec_delay_slot(cpu, bus)?;
                cpu.pc = new_pc;
            } else {
                cpu.pc = cpu.pc.wrapping_add(8);
            }
        } else {
            Self::exec_delay_slot(cpu, bus)?;
            cpu.pc = if taken { new_pc } else { cpu.pc.wrapping_add(8) };
        }
        Ok(StepOutcome::Redirected)
    }

    fn exec_load(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        f: &Fields,
        op: MemOpKind,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        let vaddr = cpu.gpr[f.rs as usize].wrapping_add(sign_extend16(f.imm16) as u64);
        if op.clears_ll_bit() {
            cpu.ll_bit = 0;
        } else {
            cpu.ll_bit = 1;
        }
        match bus.load(vaddr, op) {
            Ok(val) => {
                cpu.set_gpr(f.rt as usize, val);
                Ok(StepOutcome::Sequential)
            }
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                Ok(StepOutcome::Redirected)
            }
        }
    }

    fn exec_store(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        f: &Fields,
        op: MemOpKind,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        let vaddr = cpu.gpr[f.rs as usize].wrapping_add(sign_extend16(f.imm16) as u64);
        cpu.ll_bit = 0;
        let val = cpu.gpr[f.rt as usize];
        match bus.store(vaddr, op, val) {
            Ok(()) => {
                crate::jit_helpers::note_write(cpu, vaddr);
                Ok(StepOutcome::Sequential)
            }
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                Ok(StepOutcome::Redirected)
            }
        }
    }

    fn exec_store_conditional(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        f: &Fields,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        let vaddr = cpu.gpr[f.rs as usize].wrapping_add(sign_extend16(f.imm16) as u64);
        if cpu.ll_bit == 0 {
            cpu.set_gpr(f.rt as usize, 0);
            return Ok(StepOutcome::Sequential);
        }
        let val = cpu.gpr[f.rt as usize];
        match bus.store(vaddr, MemOpKind::Sc, val) {
            Ok(()) => {
                crate::jit_helpers::note_write(cpu, vaddr);
                cpu.set_gpr(f.rt as usize, 1);
                Ok(StepOutcome::Sequential)
            }
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                Ok(StepOutcome::Redirected)
            }
        }
    }

    fn exec_unaligned_load(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        f: &Fields,
        name: &str,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        let vaddr = cpu.gpr[f.rs as usize].wrapping_add(sign_extend16(f.imm16) as u64);
        let is_double = matches!(name, "ldl" | "ldr");
        let aligned = if is_double { vaddr & !7 } else { vaddr & !3 };
        let op = if is_double { MemOpKind::Ld } else { MemOpKind::Lw };
        cpu.ll_bit = 0;
        let fetched = match bus.load(aligned, op) {
            Ok(v) => v,
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                return Ok(StepOutcome::Redirected);
            }
        };
        let reg = cpu.gpr[f.rt as usize];
        let merged = match name {
            "lwl" => merge_lwl(reg, vaddr, fetched as u32),
            "lwr" => merge_lwr(reg, vaddr, fetched as u32),
            "ldl" => merge_ldl(reg, vaddr, fetched),
            "ldr" => merge_ldr(reg, vaddr, fetched),
            _ => unreachable!(),
        };
        cpu.set_gpr(f.rt as usize, merged);
        Ok(StepOutcome::Sequential)
    }

    fn exec_unaligned_store(
        cpu: &mut MipsCpu,
        bus: &mut impl Bus,
        f: &Fields,
        name: &str,
        in_delay_slot: bool,
    ) -> CoreResult<StepOutcome> {
        // SWL/SWR/SDL/SDR: read-modify-write the aligned word/dword that
        // overlaps vaddr, replacing only the bytes the instruction owns.
        let vaddr = cpu.gpr[f.rs as usize].wrapping_add(sign_extend16(f.imm16) as u64);
        let is_double = matches!(name, "sdl" | "sdr");
        let aligned = if is_double { vaddr & !7 } else { vaddr & !3 };
        let load_op = if is_double { MemOpKind::Ld } else { MemOpKind::Lw };
        let store_op = if is_double { MemOpKind::Sd } else { MemOpKind::Sw };
        cpu.ll_bit = 0;
        let current = match bus.load(aligned, load_op) {
            Ok(v) => v,
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                return Ok(StepOutcome::Redirected);
            }
        };
        let reg = cpu.gpr[f.rt as usize];
        let merged = match name {
            // SWL/SWR write-side merge is the left/right-inverse of the
            // load-side merge: the stored word keeps the bytes the load
            // merge would have discarded from `current`, not `reg`.
            "swl" => merge_lwr(current, vaddr ^ 3, reg as u32) & 0xFFFF_FFFF,
            "swr" => merge_lwl(current, vaddr ^ 3, reg as u32) & 0xFFFF_FFFF,
            "sdl" => merge_ldr(current, vaddr ^ 7, reg),
            "sdr" => merge_ldl(current, vaddr ^ 7, reg),
            _ => unreachable!(),
        };
        match bus.store(aligned, store_op, merged) {
            Ok(()) => {
                crate::jit_helpers::note_write(cpu, aligned);
                Ok(StepOutcome::Sequential)
            }
            Err(kind) => {
                deliver_exception(cpu, kind.to_exc_code(), in_delay_slot);
                Ok(StepOutcome::Redirected)
            }
        }
    }
}

impl GuestFaultKind {
    pub(crate) fn to_exc_code(self) -> ExcCode {
        match self {
            GuestFaultKind::TlbLoad => ExcCode::TlbLoad,
            GuestFaultKind::TlbStore => ExcCode::TlbSave,
            GuestFaultKind::TlbModified => ExcCode::TlbMod,
            GuestFaultKind::AddressErrorLoad => ExcCode::AddrLoad,
            GuestFaultKind::AddressErrorStore => ExcCode::AddrSave,
            GuestFaultKind::BusErrorInstr => ExcCode::BusInstr,
            GuestFaultKind::BusErrorData => ExcCode::BusData,
            GuestFaultKind::Syscall => ExcCode::Syscall,
            GuestFaultKind::Breakpoint => ExcCode::Breakpoint,
            GuestFaultKind::ReservedInstruction => ExcCode::ReservedInstr,
            GuestFaultKind::CoprocessorUnusable => ExcCode::CpUnusable,
            GuestFaultKind::IntegerOverflow => ExcCode::Overflow,
            GuestFaultKind::Trap => ExcCode::Trap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FlatBus {
        mem: HashMap<u64, u8>,
    }

    impl FlatBus {
        fn new() -> Self {
            Self { mem: HashMap::new() }
        }
        fn put32(&mut self, addr: u64, val: u32) {
            for i in 0..4 {
                self.mem.insert(addr + i, (val >> ((3 - i) * 8)) as u8);
            }
        }
    }

    impl Bus for FlatBus {
        fn fetch(&mut self, pc: u64) -> CoreResult<u32> {
            let mut v = 0u32;
            for i in 0..4 {
                v = (v << 8) | *self.mem.get(&(pc + i)).unwrap_or(&0) as u32;
            }
            Ok(v)
        }
        fn load(&mut self, vaddr: u64, op: MemOpKind) -> Result<u64, GuestFaultKind> {
            let n = if op.size() == 0 { 4 } else { op.size() as u64 };
            let mut v = 0u64;
            for i in 0..n {
                v = (v << 8) | *self.mem.get(&(vaddr + i)).unwrap_or(&0) as u64;
            }
            Ok(v)
        }
        fn store(&mut self, vaddr: u64, op: MemOpKind, val: u64) -> Result<(), GuestFaultKind> {
            let n = op.size() as u64;
            for i in 0..n {
                let shift = (n - 1 - i) * 8;
                self.mem.insert(vaddr + i, (val >> shift) as u8);
            }
            Ok(())
        }
    }

    #[test]
    fn addiu_advances_pc_and_writes_register() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut bus = FlatBus::new();
        bus.put32(0, 0x2401_0005); // addiu $1, $0, 5
        cpu.pc = 0;
        Interp::step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.gpr[1], 5);
        assert_eq!(cpu.pc, 4);
    }

    #[test]
    fn branch_executes_delay_slot_before_redirecting() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut bus = FlatBus::new();
        bus.put32(0, 0x1000_0002); // b +2 (skip to pc+4+8)
        bus.put32(4, 0x2401_0007); // addiu $1, $0, 7  (delay slot)
        cpu.pc = 0;
        Interp::step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.gpr[1], 7, "delay slot must execute");
        assert_eq!(cpu.pc, 4 + 8);
    }

    #[test]
    fn beqz_not_taken_falls_through_after_delay_slot() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut bus = FlatBus::new();
        cpu.gpr[1] = 1;
        bus.put32(0, 0x1020_0002); // beqz $1, +2
        bus.put32(4, 0x0000_0000); // nop
        cpu.pc = 0;
        Interp::step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.pc, 8);
    }

    #[test]
    fn branch_in_delay_slot_is_rejected() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut bus = FlatBus::new();
        bus.put32(0, 0x1000_0001); // b +1
        bus.put32(4, 0x1000_0001); // b +1 (illegal in delay slot)
        cpu.pc = 0;
        let err = Interp::step(&mut cpu, &mut bus).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDelaySlot { .. }));
    }

    #[test]
    fn sc_fails_without_reservation() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut bus = FlatBus::new();
        cpu.gpr[2] = 0x1234;
        bus.put32(0, 0xe041_0000); // sc $1, 0($2)
        cpu.pc = 0;
        Interp::step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.gpr[1], 0, "SC without a prior LL must fail");
    }
}
