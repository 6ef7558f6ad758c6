use crate::{ExecEnv, GuestCpu, MIN_CODE_BUF_REMAINING};
use tcg_backend::translate::translate;
use tcg_backend::HostCodeGen;
use tcg_core::tb::{TranslationBlock, TB_EXIT_NOCHAIN};

/// Reason the execution loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// TB returned a non-zero exit value.
    Exit(usize),
    /// Code buffer is full; caller should flush and retry.
    BufferFull,
}

/// Main CPU execution loop.
///
/// Repeatedly looks up or translates TBs and executes them
/// until a TB returns a non-zero exit value or the code buffer
/// is exhausted.
///
/// # Safety
/// The caller must ensure `cpu.env_ptr()` points to a valid
/// CPU state struct matching the globals in `env.ir_ctx`.
pub unsafe fn cpu_exec_loop<B, C>(env: &mut ExecEnv<B>, cpu: &mut C) -> ExitReason
where
    B: HostCodeGen,
    C: GuestCpu,
{
    let mut next_tb_hint: Option<usize> = None;

    loop {
        env.stats.loop_iters += 1;

        if let Some(phys_pc) = cpu.take_smc_hit() {
            invalidate_phys_page(env, phys_pc);
            next_tb_hint = None;
        }

        let tb_idx = match next_tb_hint.take() {
            Some(idx) => {
                env.stats.hint_used += 1;
                idx
            }
            None => {
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();
                if cpu.idle_pc() == Some(pc) {
                    env.stats.idle_sleeps += 1;
                    std::thread::sleep(std::time::Duration::from_micros(500));
                }
                match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                }
            }
        };
        env.tb_store.get_mut(tb_idx).acc_count += 1;

        let exit_val = cpu_tb_exec(env, cpu, tb_idx);
        match exit_val as u64 {
            slot @ 0..=1 => {
                // Direct, chainable branch — QEMU's tb_add_jump.
                let slot = slot as usize;
                env.stats.chain_exit[slot] += 1;
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();
                if let Some(dst) = env.tb_store.get(tb_idx).jmp_target[slot] {
                    let tb = env.tb_store.get(dst);
                    if !tb.invalid && tb.pc == pc && tb.flags == flags {
                        env.stats.chain_already += 1;
                        next_tb_hint = Some(dst);
                        continue;
                    }
                }
                let dst = match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                };
                env.tb_store.link_jump(tb_idx, slot, dst);
                env.stats.chain_patched += 1;
                next_tb_hint = Some(dst);
            }
            v if v == TB_EXIT_NOCHAIN => {
                // Indirect jump (JALR etc.) — single-entry cache per TB,
                // not a patchable goto_tb slot.
                env.stats.nochain_exit += 1;
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();
                if let Some(dst) = env.tb_store.get(tb_idx).exit_target {
                    let tb = env.tb_store.get(dst);
                    if !tb.invalid && tb.pc == pc && tb.flags == flags {
                        next_tb_hint = Some(dst);
                        continue;
                    }
                }
                let dst = match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                };
                env.tb_store.link_exit(tb_idx, dst);
                next_tb_hint = Some(dst);
            }
            _ => {
                env.stats.real_exit += 1;
                return ExitReason::Exit(exit_val);
            }
        }
    }
}

/// Runs the next flush strategy (partial or full, alternating) and
/// resets the code buffer too when a full flush ran. Call this after
/// `cpu_exec_loop` returns `ExitReason::BufferFull`, then retry.
///
/// The reset-jump callback only touches `env.code_buf`/`env.backend`
/// (disjoint fields from `env.tb_store`), so it can run while
/// `flush_alternating` holds `&mut env.tb_store`.
pub fn flush_and_retry<B: HostCodeGen>(env: &mut ExecEnv<B>) {
    let code_buf = &mut env.code_buf;
    let backend = &mut env.backend;
    let mut patch = |insn_offset: u32, reset_offset: u32| {
        code_buf.set_writable().expect("set_writable failed");
        backend.patch_jump(code_buf, insn_offset as usize, reset_offset as usize);
        code_buf.set_executable().expect("set_executable failed");
    };
    let ran_full = env.tb_store.flush_alternating(patch);
    if ran_full {
        env.reset_code_buf();
    }
}

/// Find a TB for the given (pc, flags), translating if needed.
///
/// Returns `None` if the code buffer is too full to translate.
fn tb_find<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, pc: u64, flags: u32) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu,
{
    // Fast path: jump cache
    if let Some(idx) = env.jump_cache.lookup(pc) {
        let tb = env.tb_store.get(idx);
        if !tb.invalid && tb.pc == pc && tb.flags == flags {
            env.stats.jc_hit += 1;
            return Some(idx);
        }
    }

    // Slow path: hash table
    if let Some(idx) = env.tb_store.lookup(pc, flags) {
        env.jump_cache.insert(pc, idx);
        env.stats.ht_hit += 1;
        return Some(idx);
    }

    // Miss: translate a new TB
    env.stats.translate += 1;
    tb_gen_code(env, cpu, pc, flags)
}

/// Translate guest code at `pc` into a new TB.
///
/// Returns `None` if the code buffer has insufficient space.
fn tb_gen_code<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, pc: u64, flags: u32) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu,
{
    if env.code_buf.remaining() < MIN_CODE_BUF_REMAINING {
        return None;
    }

    let tb_idx = env.tb_store.alloc(pc, flags, 0);

    // Generate IR
    env.ir_ctx.reset();
    let guest_size = cpu.gen_code(&mut env.ir_ctx, pc, TranslationBlock::max_insns(0));
    env.tb_store.get_mut(tb_idx).size = guest_size;
    // Page-align so every TB generated from the same guest page hashes
    // into the same physical-invalidation bucket (see `GuestCpu::mark_code_page`).
    env.tb_store.get_mut(tb_idx).phys_pc = pc & !tcg_core::mts::MTS_PAGE_MASK;

    // Clear goto_tb tracking
    env.backend.clear_goto_tb_offsets();

    // Generate host code
    env.code_buf.set_writable().expect("set_writable failed");
    let host_offset = translate(&mut env.ir_ctx, &env.backend, &mut env.code_buf);
    let host_size = env.code_buf.offset() - host_offset;
    env.code_buf.set_executable().expect("set_executable failed");

    let tb = env.tb_store.get_mut(tb_idx);
    tb.host_offset = host_offset;
    tb.host_size = host_size;

    // Record goto_tb offsets for future TB chaining
    let offsets = env.backend.goto_tb_offsets();
    for (i, &(jmp, reset)) in offsets.iter().enumerate().take(2) {
        tb.set_jmp_insn_offset(i, jmp as u32);
        tb.set_jmp_reset_offset(i, reset as u32);
    }

    env.tb_store.publish(tb_idx);
    env.jump_cache.insert(pc, tb_idx);
    cpu.mark_code_page(env.tb_store.get(tb_idx).phys_pc);

    Some(tb_idx)
}

/// Invalidates every TB hanging off `phys_pc`'s physical-page bucket,
/// patching any surviving TB's `goto_tb` back to its non-chained reset
/// point first. Called by the dispatch loop when `GuestCpu::take_smc_hit`
/// reports a store into a live code page.
pub fn invalidate_phys_page<B: HostCodeGen>(env: &mut ExecEnv<B>, phys_pc: u64) {
    let code_buf = &mut env.code_buf;
    let backend = &mut env.backend;
    let patch = |insn_offset: u32, reset_offset: u32| {
        code_buf.set_writable().expect("set_writable failed");
        backend.patch_jump(code_buf, insn_offset as usize, reset_offset as usize);
        code_buf.set_executable().expect("set_executable failed");
    };
    env.tb_store.invalidate_phys_page(phys_pc, patch);
    env.jump_cache.invalidate();
}

/// Execute a single TB and return the exit value.
///
/// # Safety
/// Called from the unsafe `cpu_exec_loop`.
unsafe fn cpu_tb_exec<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, tb_idx: usize) -> usize
where
    B: HostCodeGen,
    C: GuestCpu,
{
    let tb = env.tb_store.get(tb_idx);
    let tb_ptr = env.code_buf.ptr_at(tb.host_offset);
    let env_ptr = cpu.env_ptr();

    // Prologue signature:
    //   fn(env: *mut u8, tb_ptr: *const u8) -> usize
    let prologue_fn: unsafe extern "C" fn(*mut u8, *const u8) -> usize =
        core::mem::transmute(env.code_buf.base_ptr());
    prologue_fn(env_ptr, tb_ptr)
}
