//! TCG Execution Engine — TB cache and CPU execution loop.
//!
//! Provides the execution loop that drives the
//! lookup → translate → execute cycle, with TB caching via
//! a global hash table and a per-CPU jump cache.
//!
//! Single-owner: the CPU thread that drives `cpu_exec_loop` is the sole
//! owner of `ExecEnv`. No internal locking — matches the concurrency
//! model of the core CPU state (only `irq_pending`/`irq_cause` are
//! atomic; everything else is exclusively touched by that one thread).
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`,
//! `~/qemu/accel/tcg/translate-all.c`.

pub mod exec_loop;
pub mod tb_store;

pub use exec_loop::{cpu_exec_loop, ExitReason};
pub use tb_store::TbStore;

use std::fmt;

use tcg_backend::code_buffer::CodeBuffer;
use tcg_backend::HostCodeGen;
use tcg_core::tb::JumpCache;
use tcg_core::Context;

/// Execution statistics for profiling the TB lookup/chain
/// pipeline.
#[derive(Default)]
pub struct ExecStats {
    pub loop_iters: u64,
    // TB lookup
    pub jc_hit: u64,
    pub ht_hit: u64,
    pub translate: u64,
    // Exit types
    pub chain_exit: [u64; 2],
    pub nochain_exit: u64,
    pub real_exit: u64,
    // Chaining
    pub chain_patched: u64,
    pub chain_already: u64,
    // Hint
    pub hint_used: u64,
    // Idle throttling
    pub idle_sleeps: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_lookup = self.jc_hit + self.ht_hit + self.translate;
        writeln!(f, "=== TCG Execution Stats ===")?;
        writeln!(f, "loop iters:    {}", self.loop_iters)?;
        writeln!(f, "--- TB lookup ---")?;
        writeln!(
            f,
            "  jc hit:      {} ({:.1}%)",
            self.jc_hit,
            pct(self.jc_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  ht hit:      {} ({:.1}%)",
            self.ht_hit,
            pct(self.ht_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  translate:   {} ({:.1}%)",
            self.translate,
            pct(self.translate, total_lookup)
        )?;
        writeln!(f, "--- Exit types ---")?;
        writeln!(f, "  chain[0]:    {}", self.chain_exit[0])?;
        writeln!(f, "  chain[1]:    {}", self.chain_exit[1])?;
        writeln!(f, "  nochain:     {}", self.nochain_exit)?;
        writeln!(f, "  real exit:   {}", self.real_exit)?;
        writeln!(f, "--- Chaining ---")?;
        writeln!(f, "  patched:     {}", self.chain_patched)?;
        writeln!(f, "  already:     {}", self.chain_already)?;
        writeln!(f, "--- Hint ---")?;
        writeln!(f, "  hint used:   {}", self.hint_used)?;
        writeln!(f, "--- Idle ---")?;
        writeln!(f, "  sleeps:      {}", self.idle_sleeps)?;
        Ok(())
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64 * 100.0
    }
}

/// Trait for guest CPU state used by the execution loop.
pub trait GuestCpu {
    fn get_pc(&self) -> u64;
    fn get_flags(&self) -> u32;
    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32;
    fn env_ptr(&mut self) -> *mut u8;

    /// Records that a TB now exists for the guest page containing
    /// `phys_pc`, so a later store into that page can be noticed.
    /// Architectures without self-modifying-code tracking can ignore this.
    fn mark_code_page(&mut self, _phys_pc: u64) {}

    /// Drains the "a store just hit a code page" flag, if any. The
    /// returned value is whatever `phys_pc` a later store/invalidate
    /// call should use to look up the affected TBs.
    fn take_smc_hit(&mut self) -> Option<u64> {
        None
    }

    /// Guest PC of the platform idle loop, if configured. When the
    /// dispatch loop is about to enter a TB starting there, it throttles
    /// with a short sleep instead of spinning a host core at 100% for a
    /// guest that has nothing to do. Architectures without an idle PC
    /// (or that haven't been told one) just never throttle.
    fn idle_pc(&self) -> Option<u64> {
        None
    }
}

/// Minimum remaining bytes in code buffer before refusing
/// to translate a new TB.
const MIN_CODE_BUF_REMAINING: usize = 4096;

/// Owns everything the execution loop touches: the TB store, the
/// JIT code buffer, the host backend, the shared IR scratch context,
/// and the per-CPU jump cache. One `ExecEnv` per CPU thread.
pub struct ExecEnv<B: HostCodeGen> {
    pub tb_store: TbStore,
    pub code_buf: CodeBuffer,
    pub backend: B,
    pub code_gen_start: usize,
    /// Scratch IR context, reused across translations.
    pub ir_ctx: Context,
    pub jump_cache: JumpCache,
    pub stats: ExecStats,
}

impl<B: HostCodeGen> ExecEnv<B> {
    /// Builds an `ExecEnv` with the default 16 MiB code arena.
    pub fn new(backend: B) -> Self {
        Self::with_capacity(backend, None)
    }

    /// Builds an `ExecEnv` with a code arena of `code_buf_size` bytes,
    /// or the default 16 MiB when `None` (e.g. `CoreConfig::exec_arena_size`
    /// on a memory-constrained target, or a small fixed size to force
    /// `ExitReason::BufferFull` quickly in a test).
    pub fn with_capacity(mut backend: B, code_buf_size: Option<usize>) -> Self {
        let mut code_buf = match code_buf_size {
            Some(size) => CodeBuffer::new(size).expect("mmap failed"),
            None => CodeBuffer::with_default_size().expect("mmap failed"),
        };
        backend.emit_prologue(&mut code_buf);
        backend.emit_epilogue(&mut code_buf);
        let code_gen_start = code_buf.offset();

        let mut ir_ctx = Context::new();
        backend.init_context(&mut ir_ctx);

        Self {
            tb_store: TbStore::new(),
            code_buf,
            backend,
            code_gen_start,
            ir_ctx,
            jump_cache: JumpCache::new(),
            stats: ExecStats::default(),
        }
    }

    /// Resets the TB store and code buffer back to just past the
    /// prologue/epilogue, reclaiming every byte of emitted TB code.
    /// Called after `TbStore::full_flush`.
    pub fn reset_code_buf(&mut self) {
        self.code_buf.set_offset(self.code_gen_start);
        self.jump_cache.invalidate();
    }
}
