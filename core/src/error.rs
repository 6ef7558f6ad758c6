//! Error taxonomy for the core crate.

use thiserror::Error;

/// Errors surfaced by CPU control operations and the dispatch loop.
///
/// `GuestFault` never escapes `cpu_step`/`cpu_run`: it is folded into
/// CPU-internal exception delivery (see `mips_cpu::MipsCpu::take_exception`).
/// It appears here only so MTS and CP0 code has a uniform error type to
/// return before the dispatch loop decides whether to deliver it as a
/// guest exception or (for host-side faults) propagate it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("guest fault at pc={pc:#x}: {kind}")]
    GuestFault { pc: u64, kind: GuestFaultKind },

    #[error("unknown opcode {insn:#010x} at pc={pc:#x}")]
    UnknownOpcode { pc: u64, insn: u32 },

    #[error("translation failed at pc={pc:#x}: {reason}")]
    TranslationFailure { pc: u64, reason: String },

    #[error("invalid delay slot at pc={pc:#x}")]
    InvalidDelaySlot { pc: u64 },
}

/// Sub-kind of a guest-visible fault, matching the CP0 Cause.ExcCode
/// values a real MIPS64 core would report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestFaultKind {
    TlbLoad,
    TlbStore,
    TlbModified,
    AddressErrorLoad,
    AddressErrorStore,
    BusErrorInstr,
    BusErrorData,
    Syscall,
    Breakpoint,
    ReservedInstruction,
    CoprocessorUnusable,
    IntegerOverflow,
    Trap,
}

impl std::fmt::Display for GuestFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GuestFaultKind::TlbLoad => "TLB refill (load)",
            GuestFaultKind::TlbStore => "TLB refill (store)",
            GuestFaultKind::TlbModified => "TLB modified",
            GuestFaultKind::AddressErrorLoad => "address error (load)",
            GuestFaultKind::AddressErrorStore => "address error (store)",
            GuestFaultKind::BusErrorInstr => "bus error (instruction fetch)",
            GuestFaultKind::BusErrorData => "bus error (data)",
            GuestFaultKind::Syscall => "syscall",
            GuestFaultKind::Breakpoint => "breakpoint",
            GuestFaultKind::ReservedInstruction => "reserved instruction",
            GuestFaultKind::CoprocessorUnusable => "coprocessor unusable",
            GuestFaultKind::IntegerOverflow => "integer overflow",
            GuestFaultKind::Trap => "trap",
        };
        f.write_str(s)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
