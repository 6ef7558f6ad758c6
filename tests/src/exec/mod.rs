//! Integration tests for `tcg_exec`'s TB lookup/translate/execute
//! pipeline, driven through the real MIPS64 frontend and x86-64 backend.
//!
//! Every MIPS TB exits through the chainable `gen_exit_tb(0)` slot —
//! unlike a RISC-V `ecall`/`ebreak`, nothing in this frontend ever
//! produces a distinguished nonzero TB exit, since MIPS exceptions are
//! delivered by redirecting `pc` in-guest (`exception::deliver_exception`)
//! rather than returning to the host. `cpu_exec_loop` therefore never
//! returns on its own for a normal MIPS program; most tests below drive
//! the same lookup/translate/execute steps it uses one TB at a time, so
//! each test controls exactly how many blocks run before inspecting CPU
//! state. `cpu_exec_loop_fills_code_arena_*` drives the real dispatch
//! loop instead, bounded deterministically by `ExitReason::BufferFull`
//! from a deliberately small code arena.

use tcg_backend::translate::translate;
use tcg_backend::X86_64CodeGen;
use tcg_core::context::Context;
use tcg_core::mips_cpu::{MipsCpu, GPR_RA, NUM_GPRS};
use tcg_core::tb::TranslationBlock;
use tcg_core::TempIdx;
use tcg_exec::exec_loop::{cpu_exec_loop, ExitReason};
use tcg_exec::{ExecEnv, GuestCpu};
use tcg_frontend::mips64::{MipsDisasContext, MipsTranslator};
use tcg_frontend::{DisasJumpType, TranslatorOps};

// ---------------- MIPS64 instruction encoders ----------------
//
// Field layout and opcode/funct values match `tcg_core::ilt`/
// `decode_fields` exactly, so a mis-encoded test instruction fails the
// same way a malformed guest image would (translation error), not by
// silently decoding as something else.

fn r_type(funct: u32, rs: u32, rt: u32, rd: u32, sa: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
}

fn i_type(opcode: u32, rs: u32, rt: u32, imm: i16) -> u32 {
    (opcode << 26) | (rs << 21) | (rt << 16) | (imm as u16 as u32)
}

fn j_type(opcode: u32, target: u64) -> u32 {
    (opcode << 26) | (((target >> 2) & 0x03ff_ffff) as u32)
}

fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm)
}
fn lui(rt: u32, imm: i16) -> u32 {
    i_type(0x0f, 0, rt, imm)
}
fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(0x21, rs, rt, rd, 0)
}
fn daddu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(0x2d, rs, rt, rd, 0)
}
fn subu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(0x23, rs, rt, rd, 0)
}
fn slt(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(0x2a, rs, rt, rd, 0)
}

/// Word offset is relative to the delay slot's address (`branch_pc + 4`),
/// matching `trans::translate_branch`'s `new_pc` computation.
fn branch_offset(branch_pc: u64, target: u64) -> i16 {
    ((target.wrapping_sub(branch_pc.wrapping_add(4))) as i64 / 4) as i16
}
fn beq(rs: u32, rt: u32, branch_pc: u64, target: u64) -> u32 {
    i_type(0x04, rs, rt, branch_offset(branch_pc, target))
}

fn j(target: u64) -> u32 {
    j_type(0x02, target)
}
fn jal(target: u64) -> u32 {
    j_type(0x03, target)
}
fn jr(rs: u32) -> u32 {
    r_type(0x08, rs, 0, 0, 0)
}

const NOP: u32 = 0x0000_0000;

/// Encodes `words` into a guest code image, big-endian, zero-padded to
/// `min_len` bytes so a straight-line TB decodes padding as `nop`
/// instead of reading past the buffer.
fn image(words: &[(u64, u32)], min_len: usize) -> Vec<u8> {
    let max_addr = words.iter().map(|&(a, _)| a as usize + 4).max().unwrap_or(0);
    let mut bytes = vec![0u8; min_len.max(max_addr)];
    for &(addr, w) in words {
        bytes[addr as usize..addr as usize + 4].copy_from_slice(&w.to_be_bytes());
    }
    bytes
}

// ---------------- Test CPU ----------------

/// `GuestCpu` wrapping `MipsCpu` over a flat guest-code buffer addressed
/// directly by absolute PC, the same simplification
/// `frontend::mips64::tests::assemble`/`translate_tb` use to exercise
/// the frontend without a real MTS-backed address space.
struct TestCpu {
    cpu: MipsCpu,
    code: Vec<u8>,
}

impl TestCpu {
    fn new(code: Vec<u8>) -> Self {
        Self { cpu: MipsCpu::new(0, 0, 0), code }
    }
}

/// Mirrors `mips-run`'s `bind_globals`: binds globals by running the
/// real `init_disas_context` the first time this `Context` is used, or
/// reconstructs the same `TempIdx`s it would have assigned on every
/// later TB sharing that context (re-registering globals on a non-empty
/// `Context` trips its own invariant assertion).
fn bind_globals(ir: &mut Context, pc: u64, guest_base: *const u8, max_insns: u32) -> MipsDisasContext {
    let mut d = MipsDisasContext::new(pc, guest_base);
    d.base.max_insns = max_insns;
    if ir.nb_globals() == 0 {
        MipsTranslator::init_disas_context(&mut d, ir);
    } else {
        d.env = TempIdx(0);
        for i in 0..NUM_GPRS {
            d.gpr[i] = TempIdx(1 + i as u32);
        }
        let base = 1 + NUM_GPRS as u32;
        d.hi = TempIdx(base);
        d.lo = TempIdx(base + 1);
        d.pc = TempIdx(base + 2);
        d.ll_bit = TempIdx(base + 3);
        d.fault_pending = TempIdx(base + 4);
    }
    d
}

impl GuestCpu for TestCpu {
    fn get_pc(&self) -> u64 {
        self.cpu.pc
    }

    fn get_flags(&self) -> u32 {
        0
    }

    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32 {
        let guest_base = unsafe { self.code.as_ptr().add(pc as usize) };
        let mut d = bind_globals(ir, pc, guest_base, max_insns);
        MipsTranslator::tb_start(&mut d, ir);
        loop {
            MipsTranslator::insn_start(&mut d, ir);
            MipsTranslator::translate_insn(&mut d, ir);
            if d.base.is_jmp != DisasJumpType::Next {
                break;
            }
            if d.base.num_insns >= d.base.max_insns {
                d.base.is_jmp = DisasJumpType::TooMany;
                break;
            }
        }
        MipsTranslator::tb_stop(&mut d, ir);
        assert!(d.fail.is_none(), "translation failed: {:?}", d.fail);
        d.base.num_insns * 4
    }

    fn env_ptr(&mut self) -> *mut u8 {
        &mut self.cpu as *mut MipsCpu as *mut u8
    }
}

/// Looks up or translates the TB at `cpu.get_pc()` and runs it once —
/// `exec_loop::cpu_exec_loop`'s per-iteration body, minus its outer
/// loop and TB-chaining cache (neither is needed to drive one guest
/// step at a time from a test).
fn step_tb(env: &mut ExecEnv<X86_64CodeGen>, cpu: &mut TestCpu) -> usize {
    let pc = cpu.get_pc();
    let flags = cpu.get_flags();
    let tb_idx = match env.tb_store.lookup(pc, flags) {
        Some(idx) => idx,
        None => {
            let tb_idx = env.tb_store.alloc(pc, flags, 0);
            env.ir_ctx.reset();
            let size = cpu.gen_code(&mut env.ir_ctx, pc, TranslationBlock::max_insns(0));
            env.tb_store.get_mut(tb_idx).size = size;
            env.backend.clear_goto_tb_offsets();
            env.code_buf.set_writable().expect("set_writable failed");
            let host_offset = translate(&mut env.ir_ctx, &env.backend, &mut env.code_buf);
            env.code_buf.set_executable().expect("set_executable failed");
            env.tb_store.get_mut(tb_idx).host_offset = host_offset;
            env.tb_store.publish(tb_idx);
            tb_idx
        }
    };
    let tb = env.tb_store.get(tb_idx);
    let tb_ptr = env.code_buf.ptr_at(tb.host_offset);
    let env_ptr = cpu.env_ptr();
    unsafe {
        let prologue_fn: unsafe extern "C" fn(*mut u8, *const u8) -> usize =
            core::mem::transmute(env.code_buf.base_ptr());
        prologue_fn(env_ptr, tb_ptr)
    }
}

fn new_env() -> ExecEnv<X86_64CodeGen> {
    ExecEnv::new(X86_64CodeGen::new())
}

// ---------------- Tests ----------------

#[test]
fn straight_line_block_updates_registers_and_advances_pc() {
    let code = image(
        &[
            (0x00, addiu(1, 0, 5)),
            (0x04, addiu(2, 0, 7)),
            (0x08, addu(3, 1, 2)),
        ],
        4096,
    );
    let mut cpu = TestCpu::new(code);
    let mut env = new_env();

    step_tb(&mut env, &mut cpu);

    assert_eq!(cpu.cpu.gpr[1], 5);
    assert_eq!(cpu.cpu.gpr[2], 7);
    assert_eq!(cpu.cpu.gpr[3], 12);
    // 512-instruction TB (3 real + 509 nop padding) falls through to pc + 2048.
    assert_eq!(cpu.cpu.pc, 0x800);
    assert_eq!(env.tb_store.len(), 1);
}

#[test]
fn alu_ops_match_32_bit_sign_extended_semantics() {
    let code = image(
        &[
            (0x00, lui(1, -1)),     // $1 = 0xffff_ffff_ffff_0000
            (0x04, addiu(1, 1, 1)), // $1 = 0xffff_ffff_ffff_0001 (32-bit add, sign-extended)
            (0x08, subu(2, 0, 1)),  // $2 = -$1 truncated to 32 bits, sign-extended
            (0x0c, daddu(3, 1, 1)), // $3 = full 64-bit add, no truncation
            (0x10, slt(4, 0, 1)),   // $1 is negative as a 64-bit value -> 0 < $1 is false
        ],
        4096,
    );
    let mut cpu = TestCpu::new(code);
    let mut env = new_env();

    step_tb(&mut env, &mut cpu);

    assert_eq!(cpu.cpu.gpr[1] as u32, 0xffff_0001);
    assert_eq!(cpu.cpu.gpr[1] as i64 >> 32, -1);
    assert_eq!(cpu.cpu.gpr[2] as u32, (-(0xffff_0001i64)) as u32);
    assert_eq!(cpu.cpu.gpr[3], cpu.cpu.gpr[1].wrapping_add(cpu.cpu.gpr[1]));
    assert_eq!(cpu.cpu.gpr[4], 0);
}

#[test]
fn branch_taken_redirects_pc_after_its_delay_slot() {
    let code = image(
        &[
            (0x00, addiu(1, 0, 0)),
            (0x04, beq(0, 0, 0x04, 0x100)), // always taken ($0 == $0)
            (0x08, addiu(2, 0, 99)),        // delay slot: always executes
            (0x100, addiu(3, 0, 42)),
        ],
        4096,
    );
    let mut cpu = TestCpu::new(code);
    let mut env = new_env();

    step_tb(&mut env, &mut cpu); // runs addiu, beq, delay slot; exits at the branch target
    assert_eq!(cpu.cpu.gpr[1], 0);
    assert_eq!(cpu.cpu.gpr[2], 99);
    assert_eq!(cpu.cpu.pc, 0x100);
    assert_eq!(cpu.cpu.gpr[3], 0, "target block hasn't run yet");

    step_tb(&mut env, &mut cpu); // runs the target block
    assert_eq!(cpu.cpu.gpr[3], 42);
    assert_eq!(env.tb_store.len(), 2, "branch target is a distinct TB from the fallthrough path");
}

#[test]
fn jal_links_return_address_and_jr_honors_it() {
    let code = image(
        &[
            (0x00, jal(0x40)),
            (0x04, addiu(4, 0, 11)), // jal's delay slot
            (0x08, addiu(5, 0, 22)), // landed on by jr $ra below
            (0x40, addiu(6, 0, 33)),
            (0x44, jr(31)),
            (0x48, addiu(7, 0, 44)), // jr's delay slot
        ],
        4096,
    );
    let mut cpu = TestCpu::new(code);
    let mut env = new_env();

    step_tb(&mut env, &mut cpu); // jal + delay slot
    assert_eq!(cpu.cpu.gpr[GPR_RA], 0x08, "jal links branch_pc + 8");
    assert_eq!(cpu.cpu.gpr[4], 11);
    assert_eq!(cpu.cpu.pc, 0x40);

    step_tb(&mut env, &mut cpu); // callee body + jr + delay slot
    assert_eq!(cpu.cpu.gpr[6], 33);
    assert_eq!(cpu.cpu.gpr[7], 44);
    assert_eq!(cpu.cpu.pc, 0x08, "jr reads $ra captured before its delay slot ran");

    step_tb(&mut env, &mut cpu); // back at the call site
    assert_eq!(cpu.cpu.gpr[5], 22);
}

#[test]
fn unconditional_jump_chains_into_a_fresh_tb_each_time() {
    let code = image(
        &[
            (0x00, addiu(1, 0, 1)),
            (0x04, j(0x200)),
            (0x08, NOP), // j's delay slot
            (0x200, addiu(1, 1, 1)),
            (0x204, j(0x400)),
            (0x208, NOP),
            (0x400, addiu(1, 1, 1)),
        ],
        4096,
    );
    let mut cpu = TestCpu::new(code);
    let mut env = new_env();

    step_tb(&mut env, &mut cpu);
    assert_eq!(cpu.cpu.pc, 0x200);
    step_tb(&mut env, &mut cpu);
    assert_eq!(cpu.cpu.pc, 0x400);
    step_tb(&mut env, &mut cpu);
    assert_eq!(cpu.cpu.gpr[1], 3);
    assert_eq!(env.tb_store.len(), 3, "each jump target is a separate cached TB");
}

#[test]
fn cpu_exec_loop_fills_code_arena_on_an_ever_advancing_nop_stream() {
    // An all-zero guest image decodes as an endless run of `nop`s. Every
    // TB hits the 512-instruction cap (`TooMany`) and falls through to a
    // PC it has never seen before, so the dispatch loop can never reuse
    // a cached TB — it must keep translating, which keeps consuming the
    // code arena until `ExitReason::BufferFull` is unavoidable. This is
    // the one test that drives the real `cpu_exec_loop`, since MIPS has
    // no guest instruction that produces any other kind of exit.
    let code = vec![0u8; 1024 * 1024];
    let mut cpu = TestCpu::new(code);
    let mut env = ExecEnv::with_capacity(X86_64CodeGen::new(), Some(256 * 1024));

    let reason = unsafe { cpu_exec_loop(&mut env, &mut cpu) };

    assert_eq!(reason, ExitReason::BufferFull);
    assert!(env.tb_store.len() > 1, "the arena should hold more than one TB before filling");
    assert!(cpu.get_pc() > 0, "pc should have advanced past the first TB");
}
