//! MIPS64 frontend — translates guest machine code into TCG IR.
//!
//! A `DisasContext` with globals bound over `core::mips_cpu` offsets,
//! driven by the generic `translator_loop`. A MIPS branch or jump's delay slot
//! is part of the same architectural instruction step (`interp.rs`
//! treats branch+delay-slot as a single `exec_one` call), so
//! `translate_insn` fetches and emits the delay slot itself before
//! reporting `DisasJumpType::NoReturn` — the generic loop never needs
//! to know MIPS has delay slots at all.
//!
//! Per-mnemonic IR emission lives in `trans`; the dispatch here only
//! decides branch/jump vs. everything else, since those are the only
//! kinds that consume two instructions per step.

mod trans;

use crate::{DisasContextBase, DisasJumpType, TranslatorOps};
use tcg_core::ilt::{decode as ilt_decode, decode_fields};
use tcg_core::mips_cpu::offsets::{
    gpr_offset, FAULT_PENDING_OFFSET, HI_OFFSET, LL_BIT_OFFSET, LO_OFFSET, PC_OFFSET,
};
use tcg_core::mips_cpu::NUM_GPRS;
use tcg_core::{Context, TempIdx, Type};

/// Why translation of a TB was aborted. Mirrors the two host-level
/// error variants `interp.rs` can raise while executing a step
/// (`CoreError::UnknownOpcode`/`InvalidDelaySlot`) — at JIT time these
/// are translation failures, not guest exceptions, since they mean the
/// guest image itself is malformed at this PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    UnknownOpcode { pc: u64, insn: u32 },
    InvalidDelaySlot { pc: u64 },
}

/// MIPS64 disassembly context.
pub struct MipsDisasContext {
    pub base: DisasContextBase,
    /// IR temp for the env pointer (fixed to a host register).
    pub env: TempIdx,
    /// IR temps for guest GPRs 0-31 (globals). `gpr[0]` is never
    /// written (`write_gpr` special-cases it) but is still a real
    /// global so it can be read like any other register.
    pub gpr: [TempIdx; NUM_GPRS],
    pub hi: TempIdx,
    pub lo: TempIdx,
    pub pc: TempIdx,
    pub ll_bit: TempIdx,
    pub fault_pending: TempIdx,
    /// Host mapping of the guest physical page this TB was fetched
    /// from; `fetch_insn` indexes it by `pc - base.pc_first`. A TB
    /// never crosses a physical page boundary (the TCB store keys
    /// blocks by physical page, per the donor's page-hash design).
    pub guest_base: *const u8,
    /// Set when decode fails or a delay slot is itself a branch/jump;
    /// checked by `translate_tb` after the loop returns.
    pub fail: Option<TranslateError>,
}

impl MipsDisasContext {
    pub fn new(pc: u64, guest_base: *const u8) -> Self {
        Self {
            base: DisasContextBase {
                pc_first: pc,
                pc_next: pc,
                is_jmp: DisasJumpType::Next,
                num_insns: 0,
                max_insns: 512,
            },
            env: TempIdx(0),
            gpr: [TempIdx(0); NUM_GPRS],
            hi: TempIdx(0),
            lo: TempIdx(0),
            pc: TempIdx(0),
            ll_bit: TempIdx(0),
            fault_pending: TempIdx(0),
            guest_base,
            fail: None,
        }
    }

    /// Fetches the big-endian 32-bit instruction word at guest address
    /// `pc`. MIPS64 instructions are always big-endian regardless of
    /// host byte order, same convention `interp::Bus::fetch`'s test
    /// harness (`FlatBus::fetch`) assembles by hand.
    ///
    /// # Safety
    /// `guest_base + (pc - base.pc_first)` must address 4 readable
    /// host bytes.
    unsafe fn fetch_insn(&self, pc: u64) -> u32 {
        let off = (pc - self.base.pc_first) as usize;
        let ptr = self.guest_base.add(off);
        u32::from_be_bytes([*ptr, *ptr.add(1), *ptr.add(2), *ptr.add(3)])
    }
}

/// Reads a GPR as a fresh snapshot temp, never the bare global.
/// Branch conditions and `jalr`/`jr` targets are evaluated before the
/// delay slot runs, but the delay slot is emitted (in program order)
/// before the branch/jump actually redirects `pc`; if a later op
/// referenced the global directly it would observe the delay slot's
/// write instead of the pre-delay-slot value. Snapshotting on every
/// read sidesteps the hazard everywhere instead of only at the two
/// call sites that are obviously affected.
pub(crate) fn read_gpr(ctx: &MipsDisasContext, ir: &mut Context, reg: u32) -> TempIdx {
    if reg == 0 {
        return ir.new_const(Type::I64, 0);
    }
    let snap = ir.new_temp(Type::I64);
    ir.gen_mov(Type::I64, snap, ctx.gpr[reg as usize]);
    snap
}

pub(crate) fn write_gpr(ctx: &MipsDisasContext, ir: &mut Context, reg: u32, val: TempIdx) {
    if reg == 0 {
        return;
    }
    ir.gen_mov(Type::I64, ctx.gpr[reg as usize], val);
}

/// Emits a check of `fault_pending` and exits the TB back to the
/// dispatch loop when a just-called helper delivered an exception.
/// `fault_pending` is a plain global here (not reloaded via `gen_ld`):
/// the backend treats `Call` as clobbering every global, the same
/// convention that lets `ctx.pc`/`ctx.gpr` be read directly as op
/// operands anywhere else in this frontend.
pub(crate) fn check_fault_and_exit(ctx: &MipsDisasContext, ir: &mut Context) {
    let zero = ir.new_const(Type::I32, 0);
    let cont = ir.new_label();
    ir.gen_brcond(Type::I32, ctx.fault_pending, zero, tcg_core::Cond::Eq, cont);
    ir.gen_exit_tb(0);
    ir.gen_set_label(cont);
}

/// Translates the delay slot instruction at `branch_pc + 4` in place.
/// Returns `false` (with `ctx.fail` set) if that instruction cannot be
/// decoded or is itself a branch/jump — `interp::exec_delay_slot`
/// rejects the latter as `InvalidDelaySlot`.
pub(crate) fn translate_delay_slot(ctx: &mut MipsDisasContext, ir: &mut Context, branch_pc: u64) -> bool {
    let ds_pc = branch_pc.wrapping_add(4);
    let insn = unsafe { ctx.fetch_insn(ds_pc) };
    let entry = match ilt_decode(insn) {
        Some(e) => e,
        None => {
            ctx.fail = Some(TranslateError::UnknownOpcode { pc: ds_pc, insn });
            return false;
        }
    };
    use tcg_core::ilt::OpKind;
    if matches!(
        entry.kind,
        OpKind::Branch | OpKind::BranchZ | OpKind::BranchLikely | OpKind::Jump | OpKind::JumpReg
    ) {
        ctx.fail = Some(TranslateError::InvalidDelaySlot { pc: ds_pc });
        return false;
    }
    ir.gen_insn_start(ds_pc);
    ctx.base.num_insns += 1;
    let f = decode_fields(insn);
    trans::dispatch_non_branch(ctx, ir, entry, &f, true);
    true
}

pub struct MipsTranslator;

impl TranslatorOps for MipsTranslator {
    type DisasContext = MipsDisasContext;

    fn init_disas_context(ctx: &mut MipsDisasContext, ir: &mut Context) {
        ctx.env = ir.new_fixed(Type::I64, 5, "env");
        for i in 0..NUM_GPRS {
            ctx.gpr[i] = ir.new_global(Type::I64, ctx.env, gpr_offset(i), "gpr");
        }
        ctx.hi = ir.new_global(Type::I64, ctx.env, HI_OFFSET, "hi");
        ctx.lo = ir.new_global(Type::I64, ctx.env, LO_OFFSET, "lo");
        ctx.pc = ir.new_global(Type::I64, ctx.env, PC_OFFSET, "pc");
        ctx.ll_bit = ir.new_global(Type::I32, ctx.env, LL_BIT_OFFSET, "ll_bit");
        ctx.fault_pending = ir.new_global(Type::I32, ctx.env, FAULT_PENDING_OFFSET, "fault_pending");
    }

    fn tb_start(_ctx: &mut MipsDisasContext, _ir: &mut Context) {}

    fn insn_start(ctx: &mut MipsDisasContext, ir: &mut Context) {
        ir.gen_insn_start(ctx.base.pc_next);
        ctx.base.num_insns += 1;

        // Every non-delay-slot instruction boundary advances the virtual
        // count and polls for a pending IRQ, mirroring the interpreter's
        // per-`step` `cp0.tick`/`poll_irq` pair. Delay slots are emitted
        // by `translate_delay_slot`, which never calls `insn_start`, so
        // they never get a poll of their own.
        let one = ir.new_const(Type::I64, 1);
        let tick_dst = ir.new_temp(Type::I64);
        ir.gen_call(tick_dst, tcg_core::jit_helpers::jit_helper_timer_tick as u64, &[ctx.env, one]);
        ir.gen_discard(Type::I64, tick_dst);

        let poll_dst = ir.new_temp(Type::I64);
        ir.gen_call(poll_dst, tcg_core::jit_helpers::jit_helper_irq_poll as u64, &[ctx.env]);
        ir.gen_discard(Type::I64, poll_dst);
        check_fault_and_exit(ctx, ir);
    }

    fn translate_insn(ctx: &mut MipsDisasContext, ir: &mut Context) {
        let pc = ctx.base.pc_next;
        let insn = unsafe { ctx.fetch_insn(pc) };
        let entry = match ilt_decode(insn) {
            Some(e) => e,
            None => {
                ctx.fail = Some(TranslateError::UnknownOpcode { pc, insn });
                ctx.base.is_jmp = DisasJumpType::NoReturn;
                return;
            }
        };
        let f = decode_fields(insn);

        use tcg_core::ilt::OpKind;
        match entry.kind {
            OpKind::Branch | OpKind::BranchZ | OpKind::BranchLikely => {
                trans::translate_branch(ctx, ir, entry, &f, pc);
            }
            OpKind::Jump => trans::translate_jump(ctx, ir, entry, &f, pc),
            OpKind::JumpReg => trans::translate_jump_reg(ctx, ir, entry, &f, pc),
            _ => {
                trans::dispatch_non_branch(ctx, ir, entry, &f, false);
                ctx.base.pc_next = pc.wrapping_add(4);
            }
        }
    }

    fn tb_stop(ctx: &mut MipsDisasContext, ir: &mut Context) {
        match ctx.base.is_jmp {
            DisasJumpType::NoReturn => {}
            DisasJumpType::Next | DisasJumpType::TooMany => {
                let pc_const = ir.new_const(Type::I64, ctx.base.pc_next);
                ir.gen_mov(Type::I64, ctx.pc, pc_const);
                ir.gen_exit_tb(0);
            }
        }
    }

    fn base(ctx: &MipsDisasContext) -> &DisasContextBase {
        &ctx.base
    }

    fn base_mut(ctx: &mut MipsDisasContext) -> &mut DisasContextBase {
        &mut ctx.base
    }
}

/// Translates one TB starting at `pc`, fetching from `guest_base`
/// (host mapping of the guest physical page `pc` resolves into).
/// Returns the built IR context, or the reason translation failed.
pub fn translate_tb(pc: u64, guest_base: *const u8) -> Result<(MipsDisasContext, Context), TranslateError> {
    let mut ctx = MipsDisasContext::new(pc, guest_base);
    let mut ir = Context::new();
    crate::translator_loop::<MipsTranslator>(&mut ctx, &mut ir);
    match ctx.fail {
        Some(e) => Err(e),
        None => Ok((ctx, ir)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(words: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn straight_line_block_exits_with_updated_pc() {
        // addiu $1, $0, 5 ; addiu $2, $0, 7 ; j 0 ; nop (delay slot)
        // Terminated by a jump so the loop can't walk past the buffer.
        let code = assemble(&[0x2401_0005, 0x2402_0007, 0x0800_0000, 0x0000_0000]);
        let (ctx, ir) = translate_tb(0, code.as_ptr()).unwrap();
        assert_eq!(ctx.base.num_insns, 4);
        assert_eq!(ctx.base.is_jmp, DisasJumpType::NoReturn);
        assert!(ir.num_ops() > 0);
    }

    #[test]
    fn branch_consumes_its_delay_slot_in_one_step() {
        // b +2 ; addiu $1, $0, 7 (delay slot) ; addiu $2,$0,1 (never reached: is_jmp ends TB)
        let code = assemble(&[0x1000_0002, 0x2401_0007, 0x2402_0001]);
        let (ctx, _ir) = translate_tb(0, code.as_ptr()).unwrap();
        assert_eq!(ctx.base.num_insns, 2, "branch + delay slot = 2 instructions");
        assert_eq!(ctx.base.is_jmp, DisasJumpType::NoReturn);
    }

    #[test]
    fn branch_in_delay_slot_is_rejected_at_translate_time() {
        // b +1 ; b +1 (illegal delay slot)
        let code = assemble(&[0x1000_0001, 0x1000_0001]);
        let err = translate_tb(0, code.as_ptr()).unwrap_err();
        assert!(matches!(err, TranslateError::InvalidDelaySlot { pc: 4 }));
    }

    #[test]
    fn unknown_opcode_fails_translation() {
        let code = assemble(&[0xffff_ffff]);
        let err = translate_tb(0, code.as_ptr()).unwrap_err();
        assert!(matches!(err, TranslateError::UnknownOpcode { pc: 0, .. }));
    }
}
