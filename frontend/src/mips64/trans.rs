//! Per-mnemonic IR emission. Dispatch mirrors `interp::Interp::exec_one`'s
//! match-by-name exactly (same groupings, same order within a group) so
//! the JIT and interpreter stay semantically identical — the difftest
//! harness diffs their outputs against the same instruction stream.

use super::{check_fault_and_exit, read_gpr, write_gpr, MipsDisasContext};
use tcg_core::ilt::{Fields, IltEntry};
use tcg_core::mips_cpu::GPR_RA;
use tcg_core::{Cond, Context, TempIdx, Type};

fn trunc32(ir: &mut Context, v: TempIdx) -> TempIdx {
    let t = ir.new_temp(Type::I32);
    ir.gen_extrl_i64_i32(t, v);
    t
}

fn sext32(ir: &mut Context, v: TempIdx) -> TempIdx {
    let t = ir.new_temp(Type::I64);
    ir.gen_ext_i32_i64(t, v);
    t
}

fn sign_extend16(v: i16) -> i64 {
    v as i64
}

/// Encodes a helper call whose return value is discarded.
fn call_void(ir: &mut Context, helper: u64, args: &[TempIdx]) {
    let dst = ir.new_temp(Type::I64);
    ir.gen_call(dst, helper, args);
    ir.gen_discard(Type::I64, dst);
}

/// Tag values mirror `jit_helpers::mem_op_from_u64`.
const OP_LB: u64 = 0;
const OP_LBU: u64 = 1;
const OP_LH: u64 = 2;
const OP_LHU: u64 = 3;
const OP_LW: u64 = 4;
const OP_LWU: u64 = 5;
const OP_LD: u64 = 6;
const OP_SB: u64 = 7;
const OP_SH: u64 = 8;
const OP_SW: u64 = 9;
const OP_SD: u64 = 10;
const OP_LL: u64 = 19;

/// Handles every instruction kind except `Branch`/`BranchZ`/
/// `BranchLikely`/`Jump`/`JumpReg` — those consume the delay slot
/// themselves and are dispatched directly from `translate_insn`.
pub(super) fn dispatch_non_branch(
    ctx: &mut MipsDisasContext,
    ir: &mut Context,
    entry: &IltEntry,
    f: &Fields,
    in_delay_slot: bool,
) {
    match entry.name {
        // ---------------- ALU reg-reg ----------------
        "add" | "addu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let a32 = trunc32(ir, a);
            let b32 = trunc32(ir, b);
            let r32 = ir.new_temp(Type::I32);
            ir.gen_add(Type::I32, r32, a32, b32);
            let r64 = sext32(ir, r32);
            write_gpr(ctx, ir, f.rd, r64);
        }
        "daddu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let r = ir.new_temp(Type::I64);
            ir.gen_add(Type::I64, r, a, b);
            write_gpr(ctx, ir, f.rd, r);
        }
        "subu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let a32 = trunc32(ir, a);
            let b32 = trunc32(ir, b);
            let r32 = ir.new_temp(Type::I32);
            ir.gen_sub(Type::I32, r32, a32, b32);
            let r64 = sext32(ir, r32);
            write_gpr(ctx, ir, f.rd, r64);
        }
        "dsubu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let r = ir.new_temp(Type::I64);
            ir.gen_sub(Type::I64, r, a, b);
            write_gpr(ctx, ir, f.rd, r);
        }
        "and" => bin64(ctx, ir, f, |ir, d, a, b| {
            ir.gen_and(Type::I64, d, a, b);
        }),
        "or" => bin64(ctx, ir, f, |ir, d, a, b| {
            ir.gen_or(Type::I64, d, a, b);
        }),
        "xor" => bin64(ctx, ir, f, |ir, d, a, b| {
            ir.gen_xor(Type::I64, d, a, b);
        }),
        "nor" => bin64(ctx, ir, f, |ir, d, a, b| {
            ir.gen_nor(Type::I64, d, a, b);
        }),
        "slt" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let d = ir.new_temp(Type::I64);
            ir.gen_setcond(Type::I64, d, a, b, Cond::Lt);
            write_gpr(ctx, ir, f.rd, d);
        }
        "sltu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let b = read_gpr(ctx, ir, f.rt);
            let d = ir.new_temp(Type::I64);
            ir.gen_setcond(Type::I64, d, a, b, Cond::Ltu);
            write_gpr(ctx, ir, f.rd, d);
        }
        "move" => {
            let v = read_gpr(ctx, ir, f.rs);
            write_gpr(ctx, ir, f.rd, v);
        }
        "mfhi" => {
            let v = read_gpr_hi(ctx, ir);
            write_gpr(ctx, ir, f.rd, v);
        }
        "mflo" => {
            let v = read_gpr_lo(ctx, ir);
            write_gpr(ctx, ir, f.rd, v);
        }
        "mthi" => {
            let v = read_gpr(ctx, ir, f.rs);
            ir.gen_mov(Type::I64, ctx.hi, v).void();
        }
        "mtlo" => {
            let v = read_gpr(ctx, ir, f.rs);
            ir.gen_mov(Type::I64, ctx.lo, v).void();
        }

        // ---------------- ALU imm ----------------
        "addi" | "addiu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let a32 = trunc32(ir, a);
            let imm32 = ir.new_const(Type::I32, (sign_extend16(f.imm16) as i32 as u32) as u64);
            let r32 = ir.new_temp(Type::I32);
            ir.gen_add(Type::I32, r32, a32, imm32);
            let r64 = sext32(ir, r32);
            write_gpr(ctx, ir, f.rt, r64);
        }
        "daddiu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let imm = ir.new_const(Type::I64, sign_extend16(f.imm16) as u64);
            let r = ir.new_temp(Type::I64);
            ir.gen_add(Type::I64, r, a, imm);
            write_gpr(ctx, ir, f.rt, r);
        }
        "andi" => imm_bitwise(ctx, ir, f, f.imm16 as u16 as u64, |ir, d, a, b| {
            ir.gen_and(Type::I64, d, a, b);
        }),
        "ori" => imm_bitwise(ctx, ir, f, f.imm16 as u16 as u64, |ir, d, a, b| {
            ir.gen_or(Type::I64, d, a, b);
        }),
        "xori" => imm_bitwise(ctx, ir, f, f.imm16 as u16 as u64, |ir, d, a, b| {
            ir.gen_xor(Type::I64, d, a, b);
        }),
        "slti" => {
            let a = read_gpr(ctx, ir, f.rs);
            let imm = ir.new_const(Type::I64, sign_extend16(f.imm16) as u64);
            let d = ir.new_temp(Type::I64);
            ir.gen_setcond(Type::I64, d, a, imm, Cond::Lt);
            write_gpr(ctx, ir, f.rt, d);
        }
        "sltiu" => {
            let a = read_gpr(ctx, ir, f.rs);
            let imm = ir.new_const(Type::I64, sign_extend16(f.imm16) as u64);
            let d = ir.new_temp(Type::I64);
            ir.gen_setcond(Type::I64, d, a, imm, Cond::Ltu);
            write_gpr(ctx, ir, f.rt, d);
        }
        "lui" => {
            let imm = ir.new_const(Type::I64, ((sign_extend16(f.imm16)) << 16) as u64);
            write_gpr(ctx, ir, f.rt, imm);
        }
        "li" => {
            let imm = ir.new_const(Type::I64, sign_extend16(f.imm16) as u64);
            write_gpr(ctx, ir, f.rt, imm);
        }

        // ---------------- Shifts ----------------
        "sll" => shift32_imm(ctx, ir, f, Opc::Shl),
        "srl" => shift32_imm(ctx, ir, f, Opc::Shr),
        "sra" => shift32_imm(ctx, ir, f, Opc::Sar),
        "sllv" => shift32_var(ctx, ir, f, Opc::Shl),
        "srlv" => shift32_var(ctx, ir, f, Opc::Shr),
        "srav" => shift32_var(ctx, ir, f, Opc::Sar),
        "dsll" => shift64_imm(ctx, ir, f, Opc::Shl, 0),
        "dsll32" => shift64_imm(ctx, ir, f, Opc::Shl, 32),
        "dsrl" => shift64_imm(ctx, ir, f, Opc::Shr, 0),
        "dsrl32" => shift64_imm(ctx, ir, f, Opc::Shr, 32),
        "dsra" => shift64_imm(ctx, ir, f, Opc::Sar, 0),
        "dsra32" => shift64_imm(ctx, ir, f, Opc::Sar, 32),
        "dsllv" => shift64_var(ctx, ir, f, Opc::Shl),
        "dsrlv" => shift64_var(ctx, ir, f, Opc::Shr),
        "dsrav" => shift64_var(ctx, ir, f, Opc::Sar),

        // ---------------- Mul/div ----------------
        "mult" => muldiv_mul(ctx, ir, f, true),
        "multu" => muldiv_mul(ctx, ir, f, false),
        "div" => muldiv_div(ctx, ir, f, true),
        "divu" => muldiv_div(ctx, ir, f, false),

        // ---------------- Loads/stores ----------------
        "lb" => load(ctx, ir, f, OP_LB),
        "lbu" => load(ctx, ir, f, OP_LBU),
        "lh" => load(ctx, ir, f, OP_LH),
        "lhu" => load(ctx, ir, f, OP_LHU),
        "lw" => load(ctx, ir, f, OP_LW),
        "lwu" => load(ctx, ir, f, OP_LWU),
        "ld" => load(ctx, ir, f, OP_LD),
        "ll" => load(ctx, ir, f, OP_LL),
        "sb" => store(ctx, ir, f, OP_SB),
        "sh" => store(ctx, ir, f, OP_SH),
        "sw" => store(ctx, ir, f, OP_SW),
        "sd" => store(ctx, ir, f, OP_SD),
        "sc" => store_conditional(ctx, ir, f),

        "lwl" => unaligned_load(ctx, ir, f, 0),
        "lwr" => unaligned_load(ctx, ir, f, 1),
        "ldl" => unaligned_load(ctx, ir, f, 2),
        "ldr" => unaligned_load(ctx, ir, f, 3),
        "swl" => unaligned_store(ctx, ir, f, 0),
        "swr" => unaligned_store(ctx, ir, f, 1),
        "sdl" => unaligned_store(ctx, ir, f, 2),
        "sdr" => unaligned_store(ctx, ir, f, 3),

        "cache" | "pref" | "prefi" | "sync" | "nop" => {}

        // ---------------- CP0 / TLB ----------------
        "mfc0" => {
            let reg = ir.new_const(Type::I64, f.rd as u64);
            let dst = ir.new_temp(Type::I64);
            ir.gen_call(dst, tcg_core::jit_helpers::jit_helper_mfc0 as u64, &[ctx.env, reg]);
            write_gpr(ctx, ir, f.rt, dst);
        }
        "mtc0" => {
            let reg = ir.new_const(Type::I64, f.rd as u64);
            let val = read_gpr(ctx, ir, f.rt);
            call_void(ir, tcg_core::jit_helpers::jit_helper_mtc0 as u64, &[ctx.env, reg, val]);
        }
        "dmfc0" => {
            let reg = ir.new_const(Type::I64, f.rd as u64);
            let dst = ir.new_temp(Type::I64);
            ir.gen_call(dst, tcg_core::jit_helpers::jit_helper_dmfc0 as u64, &[ctx.env, reg]);
            write_gpr(ctx, ir, f.rt, dst);
        }
        "dmtc0" => {
            let reg = ir.new_const(Type::I64, f.rd as u64);
            let val = read_gpr(ctx, ir, f.rt);
            call_void(ir, tcg_core::jit_helpers::jit_helper_dmtc0 as u64, &[ctx.env, reg, val]);
        }
        "tlbp" => call_void(ir, tcg_core::jit_helpers::jit_helper_tlbp as u64, &[ctx.env]),
        "tlbr" => call_void(ir, tcg_core::jit_helpers::jit_helper_tlbr as u64, &[ctx.env]),
        "tlbwi" => call_void(ir, tcg_core::jit_helpers::jit_helper_tlbwi as u64, &[ctx.env]),

        // ---------------- Traps ----------------
        "break" => {
            let bd = ir.new_const(Type::I64, in_delay_slot as u64);
            call_void(ir, tcg_core::jit_helpers::jit_helper_break as u64, &[ctx.env, bd]);
            ir.gen_exit_tb(0);
            ctx.base.is_jmp = crate::DisasJumpType::NoReturn;
        }
        "syscall" => {
            let bd = ir.new_const(Type::I64, in_delay_slot as u64);
            call_void(ir, tcg_core::jit_helpers::jit_helper_syscall as u64, &[ctx.env, bd]);
            ir.gen_exit_tb(0);
            ctx.base.is_jmp = crate::DisasJumpType::NoReturn;
        }
        "eret" => {
            call_void(ir, tcg_core::jit_helpers::jit_helper_eret as u64, &[ctx.env]);
            ir.gen_exit_tb(0);
            ctx.base.is_jmp = crate::DisasJumpType::NoReturn;
        }

        _ => unreachable!("ilt entry {} has no frontend handler", entry.name),
    }
}

enum Opc {
    Shl,
    Shr,
    Sar,
}

fn emit_shift(ir: &mut Context, ty: Type, op: Opc, d: TempIdx, a: TempIdx, b: TempIdx) {
    match op {
        Opc::Shl => ir.gen_shl(ty, d, a, b).void(),
        Opc::Shr => ir.gen_shr(ty, d, a, b).void(),
        Opc::Sar => ir.gen_sar(ty, d, a, b).void(),
    }
}

fn bin64(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op: impl FnOnce(&mut Context, TempIdx, TempIdx, TempIdx)) {
    let a = read_gpr(ctx, ir, f.rs);
    let b = read_gpr(ctx, ir, f.rt);
    let d = ir.new_temp(Type::I64);
    op(ir, d, a, b);
    write_gpr(ctx, ir, f.rd, d);
}

fn imm_bitwise(
    ctx: &mut MipsDisasContext,
    ir: &mut Context,
    f: &Fields,
    imm: u64,
    op: impl FnOnce(&mut Context, TempIdx, TempIdx, TempIdx),
) {
    let a = read_gpr(ctx, ir, f.rs);
    let imm_t = ir.new_const(Type::I64, imm);
    let d = ir.new_temp(Type::I64);
    op(ir, d, a, imm_t);
    write_gpr(ctx, ir, f.rt, d);
}

fn shift32_imm(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op: Opc) {
    let t = read_gpr(ctx, ir, f.rt);
    let t32 = trunc32(ir, t);
    let sa = ir.new_const(Type::I32, f.sa as u64);
    let r32 = ir.new_temp(Type::I32);
    emit_shift(ir, Type::I32, op, r32, t32, sa);
    let r64 = sext32(ir, r32);
    write_gpr(ctx, ir, f.rd, r64);
}

fn shift32_var(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op: Opc) {
    let rs = read_gpr(ctx, ir, f.rs);
    let rs32 = trunc32(ir, rs);
    let mask = ir.new_const(Type::I32, 0x1f);
    let sh = ir.new_temp(Type::I32);
    ir.gen_and(Type::I32, sh, rs32, mask);
    let t = read_gpr(ctx, ir, f.rt);
    let t32 = trunc32(ir, t);
    let r32 = ir.new_temp(Type::I32);
    emit_shift(ir, Type::I32, op, r32, t32, sh);
    let r64 = sext32(ir, r32);
    write_gpr(ctx, ir, f.rd, r64);
}

fn shift64_imm(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op: Opc, extra: u32) {
    let t = read_gpr(ctx, ir, f.rt);
    let sa = ir.new_const(Type::I64, (f.sa + extra) as u64);
    let r = ir.new_temp(Type::I64);
    emit_shift(ir, Type::I64, op, r, t, sa);
    write_gpr(ctx, ir, f.rd, r);
}

fn shift64_var(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op: Opc) {
    let rs = read_gpr(ctx, ir, f.rs);
    let mask = ir.new_const(Type::I64, 0x3f);
    let sh = ir.new_temp(Type::I64);
    ir.gen_and(Type::I64, sh, rs, mask);
    let t = read_gpr(ctx, ir, f.rt);
    let r = ir.new_temp(Type::I64);
    emit_shift(ir, Type::I64, op, r, t, sh);
    write_gpr(ctx, ir, f.rd, r);
}

fn muldiv_mul(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, signed: bool) {
    let a = read_gpr(ctx, ir, f.rs);
    let b = read_gpr(ctx, ir, f.rt);
    let a32 = trunc32(ir, a);
    let b32 = trunc32(ir, b);
    let lo32 = ir.new_temp(Type::I32);
    let hi32 = ir.new_temp(Type::I32);
    if signed {
        ir.gen_muls2(Type::I32, lo32, hi32, a32, b32);
    } else {
        ir.gen_mulu2(Type::I32, lo32, hi32, a32, b32);
    }
    // Both halves of the product are independently sign-extended when
    // written to lo/hi, for mult *and* multu alike (`mips64_exec.c`'s
    // MULT/MULTU store `(int32_t)res`/`(int32_t)(res>>32)`).
    let lo64 = sext32(ir, lo32);
    let hi64 = sext32(ir, hi32);
    ir.gen_mov(Type::I64, ctx.lo, lo64).void();
    ir.gen_mov(Type::I64, ctx.hi, hi64).void();
}

fn muldiv_div(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, signed: bool) {
    let a = read_gpr(ctx, ir, f.rs);
    let b = read_gpr(ctx, ir, f.rt);
    let a32 = trunc32(ir, a);
    let b32 = trunc32(ir, b);
    let zero = ir.new_const(Type::I32, 0);
    let skip = ir.new_label();
    // Division by zero leaves hi/lo unchanged (architecturally
    // UNPREDICTABLE; this is the donor's chosen behavior, not a trap).
    ir.gen_brcond(Type::I32, b32, zero, Cond::Eq, skip);
    let q32 = ir.new_temp(Type::I32);
    let r32 = ir.new_temp(Type::I32);
    if signed {
        ir.gen_divs(Type::I32, q32, a32, b32);
        ir.gen_rems(Type::I32, r32, a32, b32);
    } else {
        ir.gen_divu(Type::I32, q32, a32, b32);
        ir.gen_remu(Type::I32, r32, a32, b32);
    }
    let q64 = sext32(ir, q32);
    let r64 = sext32(ir, r32);
    ir.gen_mov(Type::I64, ctx.lo, q64).void();
    ir.gen_mov(Type::I64, ctx.hi, r64).void();
    ir.gen_set_label(skip);
}

fn read_gpr_hi(ctx: &MipsDisasContext, ir: &mut Context) -> TempIdx {
    let t = ir.new_temp(Type::I64);
    ir.gen_mov(Type::I64, t, ctx.hi);
    t
}

fn read_gpr_lo(ctx: &MipsDisasContext, ir: &mut Context) -> TempIdx {
    let t = ir.new_temp(Type::I64);
    ir.gen_mov(Type::I64, t, ctx.lo);
    t
}

fn addr(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields) -> TempIdx {
    let base = read_gpr(ctx, ir, f.rs);
    let imm = ir.new_const(Type::I64, sign_extend16(f.imm16) as u64);
    let v = ir.new_temp(Type::I64);
    ir.gen_add(Type::I64, v, base, imm);
    v
}

fn load(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op_tag: u64) {
    let vaddr = addr(ctx, ir, f);
    let op = ir.new_const(Type::I64, op_tag);
    let dst = ir.new_temp(Type::I64);
    ir.gen_call(dst, tcg_core::jit_helpers::jit_helper_load as u64, &[ctx.env, vaddr, op]);
    check_fault_and_exit(ctx, ir);
    write_gpr(ctx, ir, f.rt, dst);
}

fn store(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, op_tag: u64) {
    let vaddr = addr(ctx, ir, f);
    let op = ir.new_const(Type::I64, op_tag);
    let val = read_gpr(ctx, ir, f.rt);
    call_void(ir, tcg_core::jit_helpers::jit_helper_store as u64, &[ctx.env, vaddr, op, val]);
    check_fault_and_exit(ctx, ir);
}

fn store_conditional(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields) {
    let vaddr = addr(ctx, ir, f);
    let val = read_gpr(ctx, ir, f.rt);
    let dst = ir.new_temp(Type::I64);
    ir.gen_call(dst, tcg_core::jit_helpers::jit_helper_store_conditional as u64, &[ctx.env, vaddr, val]);
    check_fault_and_exit(ctx, ir);
    write_gpr(ctx, ir, f.rt, dst);
}

fn unaligned_load(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, tag: u64) {
    let vaddr = addr(ctx, ir, f);
    let tag_t = ir.new_const(Type::I64, tag);
    let reg_val = read_gpr(ctx, ir, f.rt);
    let dst = ir.new_temp(Type::I64);
    ir.gen_call(
        dst,
        tcg_core::jit_helpers::jit_helper_unaligned_load as u64,
        &[ctx.env, vaddr, tag_t, reg_val],
    );
    check_fault_and_exit(ctx, ir);
    write_gpr(ctx, ir, f.rt, dst);
}

fn unaligned_store(ctx: &mut MipsDisasContext, ir: &mut Context, f: &Fields, tag: u64) {
    let vaddr = addr(ctx, ir, f);
    let tag_t = ir.new_const(Type::I64, tag);
    let reg_val = read_gpr(ctx, ir, f.rt);
    call_void(
        ir,
        tcg_core::jit_helpers::jit_helper_unaligned_store as u64,
        &[ctx.env, vaddr, tag_t, reg_val],
    );
    check_fault_and_exit(ctx, ir);
}

/// `b`/`beq`/`bal`/`beqz`/.../`bnel` — consumes the delay slot then
/// redirects `pc` to one of two compile-time-constant targets, except
/// `likely` forms which skip the delay slot entirely when not taken.
pub(super) fn translate_branch(ctx: &mut MipsDisasContext, ir: &mut Context, entry: &IltEntry, f: &Fields, branch_pc: u64) {
    ctx.base.is_jmp = crate::DisasJumpType::NoReturn;

    let offset = (sign_extend16(f.imm16) << 2) as u64;
    let new_pc = branch_pc.wrapping_add(4).wrapping_add(offset);
    let fallthrough_pc = branch_pc.wrapping_add(8);

    let links = matches!(entry.name, "bal" | "bgezal" | "bgezall" | "bltzal" | "bltzall");
    if links {
        let link = ir.new_const(Type::I64, fallthrough_pc);
        write_gpr(ctx, ir, GPR_RA as u32, link);
    }

    let likely = matches!(
        entry.name,
        "beql" | "bnel" | "bgezl" | "bgezall" | "bgtzl" | "blezl" | "bltzl" | "bltzall"
    );

    let cond = match entry.name {
        "b" | "bal" => None,
        "beq" | "beql" => Some((Cond::Eq, read_gpr(ctx, ir, f.rs), read_gpr(ctx, ir, f.rt))),
        "bne" | "bnel" => Some((Cond::Ne, read_gpr(ctx, ir, f.rs), read_gpr(ctx, ir, f.rt))),
        "beqz" => Some((Cond::Eq, read_gpr(ctx, ir, f.rs), ir.new_const(Type::I64, 0))),
        "bgez" | "bgezal" | "bgezall" | "bgezl" => {
            Some((Cond::Ge, read_gpr(ctx, ir, f.rs), ir.new_const(Type::I64, 0)))
        }
        "bgtz" | "bgtzl" => Some((Cond::Gt, read_gpr(ctx, ir, f.rs), ir.new_const(Type::I64, 0))),
        "blez" | "blezl" => Some((Cond::Le, read_gpr(ctx, ir, f.rs), ir.new_const(Type::I64, 0))),
        "bltz" | "bltzal" | "bltzall" | "bltzl" => {
            Some((Cond::Lt, read_gpr(ctx, ir, f.rs), ir.new_const(Type::I64, 0)))
        }
        _ => unreachable!(),
    };

    if likely {
        let (c, a, b) = cond.expect("likely branches always carry a condition");
        let taken = ir.new_label();
        ir.gen_brcond(Type::I64, a, b, c, taken);
        let not_taken_pc = ir.new_const(Type::I64, fallthrough_pc);
        ir.gen_mov(Type::I64, ctx.pc, not_taken_pc);
        ir.gen_exit_tb(0);
        ir.gen_set_label(taken);
        if !super::translate_delay_slot(ctx, ir, branch_pc) {
            return;
        }
        let taken_pc = ir.new_const(Type::I64, new_pc);
        ir.gen_mov(Type::I64, ctx.pc, taken_pc);
        ir.gen_exit_tb(0);
        return;
    }

    if !super::translate_delay_slot(ctx, ir, branch_pc) {
        return;
    }
    match cond {
        None => {
            let pc_const = ir.new_const(Type::I64, new_pc);
            ir.gen_mov(Type::I64, ctx.pc, pc_const);
        }
        Some((c, a, b)) => {
            let taken = ir.new_label();
            let end = ir.new_label();
            ir.gen_brcond(Type::I64, a, b, c, taken);
            let fall_pc = ir.new_const(Type::I64, fallthrough_pc);
            ir.gen_mov(Type::I64, ctx.pc, fall_pc);
            ir.gen_br(end);
            ir.gen_set_label(taken);
            let taken_pc = ir.new_const(Type::I64, new_pc);
            ir.gen_mov(Type::I64, ctx.pc, taken_pc);
            ir.gen_set_label(end);
        }
    }
    ir.gen_exit_tb(0);
}

/// `j`/`jal` — target is a compile-time constant (the jump's own pc
/// combined with the 26-bit field), so no runtime compare is needed.
pub(super) fn translate_jump(ctx: &mut MipsDisasContext, ir: &mut Context, entry: &IltEntry, f: &Fields, branch_pc: u64) {
    ctx.base.is_jmp = crate::DisasJumpType::NoReturn;
    let new_pc = (branch_pc & !0x0FFF_FFFF) | ((f.target26 as u64) << 2);
    if entry.name == "jal" {
        let link = ir.new_const(Type::I64, branch_pc.wrapping_add(8));
        write_gpr(ctx, ir, GPR_RA as u32, link);
    }
    if !super::translate_delay_slot(ctx, ir, branch_pc) {
        return;
    }
    let pc_const = ir.new_const(Type::I64, new_pc);
    ir.gen_mov(Type::I64, ctx.pc, pc_const);
    ir.gen_exit_tb(0);
}

/// `jr`/`jalr` — target is a runtime register value, captured before
/// the delay slot runs (the delay slot may itself overwrite `rs`).
pub(super) fn translate_jump_reg(ctx: &mut MipsDisasContext, ir: &mut Context, entry: &IltEntry, f: &Fields, branch_pc: u64) {
    ctx.base.is_jmp = crate::DisasJumpType::NoReturn;
    let target = read_gpr(ctx, ir, f.rs);
    if entry.name == "jalr" {
        let link = ir.new_const(Type::I64, branch_pc.wrapping_add(8));
        write_gpr(ctx, ir, f.rd, link);
    }
    if !super::translate_delay_slot(ctx, ir, branch_pc) {
        return;
    }
    ir.gen_mov(Type::I64, ctx.pc, target);
    ir.gen_exit_tb(0);
}

/// Discards a `gen_*` return value without importing an extension
/// trait per call site.
trait Void {
    fn void(self);
}
impl Void for TempIdx {
    fn void(self) {}
}
