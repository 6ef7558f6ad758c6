//! MIPS64 CPU architectural state.
//!
//! Mirrors `cpu_mips_t` in `mips64.h`: 32 GPRs, `hi`/`lo`, `pc`, the
//! `ll_bit` reservation flag, the embedded CP0 register file, and the
//! per-CPU MTS cache. `#[repr(C)]` so JIT-generated code can address
//! `gpr[i]`/`pc`/etc. at fixed byte offsets from the env pointer.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::cp0::{Cp0, CAUSE_IMASK, CAUSE_ISHIFT};
use crate::error::CoreError;
use crate::mts::Mts;

/// Number of general-purpose registers.
pub const NUM_GPRS: usize = 32;

pub const GPR_ZERO: usize = 0;
pub const GPR_RA: usize = 31;
pub const GPR_SP: usize = 29;

/// Highest legal IRQ line number (Cause.IP[0..7], 8 lines total).
pub const MAX_IRQ_LINE: u32 = 7;
/// Line the timer subsystem raises on a Count/Compare match, matching
/// `mips64_exec_inc_cp0_cnt`'s `mips64_set_irq(cpu, 7)`. Platforms are
/// free to also use this line for a device, same as the donor core.
pub const TIMER_IRQ_LINE: u32 = 7;

/// Mirrors `cpu_state_t` (`MIPS_CPU_RUNNING`/`HALTED`/`SUSPENDED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Running,
    Halted,
    Suspended,
}

/// Observability counters, exposed via `cpu_step`/`cpu_run` callers and
/// logged on flush/translation-failure events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecStats {
    pub insns_interpreted: u64,
    pub insns_jitted: u64,
    pub translations: u64,
    pub tb_cache_hits: u64,
    pub tb_cache_misses: u64,
    pub tb_flushes: u64,
}

impl std::fmt::Display for ExecStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insns(interp={} jit={}) tb(gen={} hit={} miss={} flush={})",
            self.insns_interpreted,
            self.insns_jitted,
            self.translations,
            self.tb_cache_hits,
            self.tb_cache_misses,
            self.tb_flushes
        )
    }
}

/// MIPS64 CPU architectural state plus emulator-local bookkeeping.
#[repr(C)]
pub struct MipsCpu {
    pub gpr: [u64; NUM_GPRS],
    pub hi: u64,
    pub lo: u64,
    pub pc: u64,
    /// LL/SC reservation flag, cleared by any memory op other than LL/LLD.
    pub ll_bit: u32,
    /// Set by `exception::deliver_exception` (interpreter or JIT
    /// helper call); JIT-generated code checks this word after a
    /// helper call and `gen_exit_tb`s back to the dispatch loop when
    /// it is non-zero. Cleared by the dispatch loop before the next
    /// block entry.
    pub fault_pending: u32,

    pub cp0: Cp0,
    pub mts: Mts,

    /// Flat host-side backing for guest physical memory, identity
    /// mapped (`paddr` indexes directly into this buffer). Device
    /// models are out of scope (see spec Non-goals); every physical
    /// address the TLB resolves to is assumed RAM/ROM.
    pub ram_base: *mut u8,
    pub ram_size: u64,

    /// Set by an atomic read-modify-write from the interrupt controller
    /// thread/callback; polled once per dispatch iteration (spec section 5).
    pub irq_pending: AtomicU32,
    /// Latched per-line IRQ bitmap, already shifted into Cause.IP[8:15]
    /// position (see `raise_irq`/`lower_irq`), merged into Cause by
    /// `exception::poll_irq` on every dispatch iteration / JIT IRQ poll.
    pub irq_cause: AtomicU32,

    /// Incremented by the timer thread (`timer::spawn`) between dispatch
    /// iterations; drained into `Cp0::tick` so a guest blocked in a long
    /// host-side wait still accumulates virtual-count ticks.
    pub timer_irq_pending: AtomicU32,
    /// Bumped when the timer thread outruns consumption by more than the
    /// configured threshold (diagnostic only, mirrors `cpu->timer_drift`).
    pub timer_drift: AtomicU32,

    pub id: u32,
    pub state: CpuState,
    pub stats: ExecStats,
    pub last_error: Option<CoreError>,

    /// Guest pages that currently have a live TB generated from them,
    /// keyed the same way `TranslationBlock::phys_pc` is (virtual page
    /// of the TB's first instruction — see jit_helpers' `note_write`).
    /// Populated by the exec loop after publishing a TB, consulted on
    /// every store so self-modifying code invalidates the stale TB
    /// instead of running it.
    pub code_pages: std::collections::HashSet<u64>,
    /// Set by a store helper when it writes into a page listed in
    /// `code_pages`; the exec loop drains this each iteration and
    /// invalidates the corresponding TBs.
    pub smc_hit: Option<u64>,
}

// Field offsets (bytes) from the start of MipsCpu, for JIT global temps.
pub mod offsets {
    use super::*;

    pub const fn gpr_offset(i: usize) -> i64 {
        (i * 8) as i64
    }

    pub const HI_OFFSET: i64 = (NUM_GPRS * 8) as i64;
    pub const LO_OFFSET: i64 = HI_OFFSET + 8;
    pub const PC_OFFSET: i64 = LO_OFFSET + 8;
    pub const LL_BIT_OFFSET: i64 = PC_OFFSET + 8;
    pub const FAULT_PENDING_OFFSET: i64 = LL_BIT_OFFSET + 4;
}

impl MipsCpu {
    pub fn new(id: u32, prid: u64, config: u64) -> Self {
        Self {
            gpr: [0u64; NUM_GPRS],
            hi: 0,
            lo: 0,
            pc: 0,
            ll_bit: 0,
            fault_pending: 0,
            cp0: Cp0::new(prid, config),
            mts: Mts::new(32),
            ram_base: std::ptr::null_mut(),
            ram_size: 0,
            irq_pending: AtomicU32::new(0),
            irq_cause: AtomicU32::new(0),
            timer_irq_pending: AtomicU32::new(0),
            timer_drift: AtomicU32::new(0),
            id,
            state: CpuState::Halted,
            stats: ExecStats::default(),
            last_error: None,
            code_pages: std::collections::HashSet::new(),
            smc_hit: None,
        }
    }

    /// Binds the flat host-side RAM buffer this CPU's physical
    /// addresses resolve into. Must be called before any guest code
    /// that performs a load/store runs.
    pub fn bind_ram(&mut self, base: *mut u8, size: u64) {
        self.ram_base = base;
        self.ram_size = size;
    }

    /// Enforces the invariant that `gpr[0]` always reads as zero,
    /// mirroring `mips64_exec_run_cpu`'s per-iteration
    /// `cpu->gpr[0] = 0;` reset.
    #[inline]
    pub fn reset_zero_register(&mut self) {
        self.gpr[GPR_ZERO] = 0;
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: usize, val: u64) {
        if reg != GPR_ZERO {
            self.gpr[reg] = val;
        }
    }

    /// Raises IRQ `line` (0..=7), mirroring `mips64_set_irq`: ORs the
    /// line's Cause.IP bit into the latched shadow and marks an IRQ
    /// pending so the dispatch loop's cheap `has_pending_irq` check
    /// picks it up without touching CP0 directly from another thread.
    #[inline]
    pub fn raise_irq(&self, line: u32) {
        debug_assert!(line <= MAX_IRQ_LINE, "MIPS64 has 8 IRQ lines (0..=7)");
        let bit = (1u32 << (line + CAUSE_ISHIFT)) & (CAUSE_IMASK as u32);
        self.irq_cause.fetch_or(bit, Ordering::AcqRel);
        self.irq_pending.store(1, Ordering::Release);
    }

    /// Lowers IRQ `line`, mirroring `mips64_clear_irq`: only clears the
    /// cheap pending flag once every line has been lowered.
    #[inline]
    pub fn lower_irq(&self, line: u32) {
        debug_assert!(line <= MAX_IRQ_LINE, "MIPS64 has 8 IRQ lines (0..=7)");
        let bit = (1u32 << (line + CAUSE_ISHIFT)) & (CAUSE_IMASK as u32);
        let remaining = self.irq_cause.fetch_and(!bit, Ordering::AcqRel) & !bit;
        if remaining == 0 {
            self.irq_pending.store(0, Ordering::Release);
        }
    }

    /// The latched per-line bitmap, already positioned for Cause.IP.
    #[inline]
    pub fn pending_irq_lines(&self) -> u32 {
        self.irq_cause.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_pending_irq(&self) -> bool {
        self.irq_pending.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_register_cannot_be_written() {
        let mut cpu = MipsCpu::new(0, 0x0640_0000, 0);
        cpu.set_gpr(GPR_ZERO, 0xdead_beef);
        assert_eq!(cpu.gpr[GPR_ZERO], 0);
        cpu.gpr[GPR_ZERO] = 1; // direct poke, simulating JIT code bug
        cpu.reset_zero_register();
        assert_eq!(cpu.gpr[GPR_ZERO], 0);
    }

    #[test]
    fn irq_flag_round_trips_through_atomics() {
        let cpu = MipsCpu::new(0, 0, 0);
        assert!(!cpu.has_pending_irq());
        cpu.raise_irq(2);
        assert!(cpu.has_pending_irq());
        assert_eq!(cpu.pending_irq_lines(), 1 << (2 + CAUSE_ISHIFT));
        cpu.lower_irq(2);
        assert!(!cpu.has_pending_irq());
        assert_eq!(cpu.pending_irq_lines(), 0);
    }

    #[test]
    fn irq_pending_stays_set_until_every_line_lowered() {
        let cpu = MipsCpu::new(0, 0, 0);
        cpu.raise_irq(1);
        cpu.raise_irq(3);
        cpu.lower_irq(1);
        assert!(cpu.has_pending_irq(), "line 3 is still raised");
        cpu.lower_irq(3);
        assert!(!cpu.has_pending_irq());
    }
}
