//! CP0 (System Coprocessor) register file and software TLB.
//!
//! Register indices, masks and the Count/Compare virtual-counter
//! arithmetic mirror the reference MIPS64 core's `cp0.c`/`mips64.h`.
//! CP0 is never JIT-compiled: DMFC0/DMTC0/MFC0/MTC0/TLB* are always
//! dispatched to these plain functions from the interpreter or from a
//! `gen_call` helper invocation emitted by the frontend, matching the
//! reference implementation's own choice not to inline CP0 into
//! generated code.

use crate::error::{CoreError, CoreResult, GuestFaultKind};

// -- Register indices --

pub const CP0_INDEX: usize = 0;
pub const CP0_RANDOM: usize = 1;
pub const CP0_TLB_LO0: usize = 2;
pub const CP0_TLB_LO1: usize = 3;
pub const CP0_CONTEXT: usize = 4;
pub const CP0_PAGEMASK: usize = 5;
pub const CP0_WIRED: usize = 6;
pub const CP0_BADVADDR: usize = 8;
pub const CP0_COUNT: usize = 9;
pub const CP0_TLB_HI: usize = 10;
pub const CP0_COMPARE: usize = 11;
pub const CP0_STATUS: usize = 12;
pub const CP0_CAUSE: usize = 13;
pub const CP0_EPC: usize = 14;
pub const CP0_PRID: usize = 15;
pub const CP0_CONFIG: usize = 16;
pub const CP0_LLADDR: usize = 17;
pub const CP0_WATCHLO: usize = 18;
pub const CP0_WATCHHI: usize = 19;
pub const CP0_XCONTEXT: usize = 20;
pub const CP0_ECC: usize = 26;
pub const CP0_CACHERR: usize = 27;
pub const CP0_TAGLO: usize = 28;
pub const CP0_TAGHI: usize = 29;
pub const CP0_ERR_EPC: usize = 30;

pub const CP0_REG_COUNT: usize = 32;

// -- Status register fields --

pub const STATUS_CU0: u64 = 0x1000_0000;
pub const STATUS_BEV: u64 = 0x0040_0000;
pub const STATUS_KSU_SHIFT: u32 = 3;
pub const STATUS_KSU_MASK: u64 = 0x03;
pub const STATUS_KSU_KERNEL: u64 = 0x00;
pub const STATUS_ERL: u64 = 0x0000_0004;
pub const STATUS_EXL: u64 = 0x0000_0002;
pub const STATUS_IE: u64 = 0x0000_0001;
pub const STATUS_IMASK: u64 = 0x0000_FF00;

// -- Cause register fields --

pub const CAUSE_BD_SLOT: u64 = 0x8000_0000;
pub const CAUSE_EXC_MASK: u64 = 0x0000_007C;
pub const CAUSE_EXC_SHIFT: u32 = 2;
pub const CAUSE_IMASK: u64 = 0x0000_FF00;
pub const CAUSE_ISHIFT: u32 = 8;
pub const CAUSE_IBIT7: u64 = 0x0000_8000;

/// ExcCode values written into Cause[6:2], matching `MIPS_CP0_CAUSE_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcCode {
    Interrupt = 0,
    TlbMod = 1,
    TlbLoad = 2,
    TlbSave = 3,
    AddrLoad = 4,
    AddrSave = 5,
    BusInstr = 6,
    BusData = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstr = 10,
    CpUnusable = 11,
    Overflow = 12,
    Trap = 13,
    FloatingPoint = 15,
    Watch = 23,
}

impl ExcCode {
    pub fn to_guest_fault_kind(self) -> GuestFaultKind {
        match self {
            ExcCode::TlbLoad => GuestFaultKind::TlbLoad,
            ExcCode::TlbSave => GuestFaultKind::TlbStore,
            ExcCode::TlbMod => GuestFaultKind::TlbModified,
            ExcCode::AddrLoad => GuestFaultKind::AddressErrorLoad,
            ExcCode::AddrSave => GuestFaultKind::AddressErrorStore,
            ExcCode::BusInstr => GuestFaultKind::BusErrorInstr,
            ExcCode::BusData => GuestFaultKind::BusErrorData,
            ExcCode::Syscall => GuestFaultKind::Syscall,
            ExcCode::Breakpoint => GuestFaultKind::Breakpoint,
            ExcCode::ReservedInstr => GuestFaultKind::ReservedInstruction,
            ExcCode::CpUnusable => GuestFaultKind::CoprocessorUnusable,
            ExcCode::Overflow => GuestFaultKind::IntegerOverflow,
            ExcCode::Trap => GuestFaultKind::Trap,
            _ => GuestFaultKind::Trap,
        }
    }
}

// -- TLB masks --

pub const TLB_PAGE_MASK: u64 = 0x01ff_e000;
pub const TLB_VPN2_MASK: u64 = 0xffff_ffff_ffff_e000;
pub const TLB_PFN_MASK: u64 = 0x3fff_fc00;
pub const TLB_ASID_MASK: u64 = 0x0000_00ff;
pub const TLB_G_MASK: u64 = 0x0000_1000;
pub const TLB_V_MASK: u64 = 0x2;
pub const TLB_D_MASK: u64 = 0x4;

pub const CP0_LO_G_MASK: u64 = 0x0000_0001;
pub const CP0_HI_SAFE_MASK: u64 = 0xffff_e0ff;
pub const CP0_LO_SAFE_MASK: u64 = 0x7fff_ffff;

pub const TLB_ENTRIES: usize = 64;
pub const TLB_IDX_MASK: u64 = 0x3f;

/// Compute the page size, in bytes, for a given PageMask value.
///
/// `(mask + 0x2000) >> 1`, verbatim from the reference `get_page_size`.
pub const fn page_size(mask: u64) -> u64 {
    (mask + 0x2000) >> 1
}

/// A single software TLB entry, matching `tlb_entry_t`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlbEntry {
    pub mask: u64,
    pub hi: u64,
    pub lo0: u64,
    pub lo1: u64,
}

/// Outcome of mapping a TLB entry's valid halves into the MTS.
#[derive(Debug, Clone, Copy)]
pub struct TlbMapping {
    pub vaddr: u64,
    pub paddr: u64,
    pub page_size: u64,
}

/// CP0 register file plus the 64-entry software TLB.
#[derive(Debug, Clone)]
pub struct Cp0 {
    pub reg: [u64; CP0_REG_COUNT],
    pub tlb: [TlbEntry; TLB_ENTRIES],
    /// Address bus mask applied to TLB physical addresses (platform-specific,
    /// e.g. 0x1FFF_FFFF for a 512MB decode window).
    pub addr_bus_mask: u64,
    /// Cycles-per-Count-tick clock divisor (config-driven).
    pub clock_divisor: u32,
    /// Virtual Count register, incremented by the scheduler every
    /// `clock_divisor` guest instructions.
    pub virt_cnt_reg: u32,
    /// Virtual Compare delta, recomputed whenever Count or Compare changes.
    pub virt_cmp_reg: u32,
}

impl Cp0 {
    pub fn new(prid: u64, config: u64) -> Self {
        let mut reg = [0u64; CP0_REG_COUNT];
        reg[CP0_PRID] = prid;
        reg[CP0_CONFIG] = config;
        reg[CP0_STATUS] = STATUS_BEV | STATUS_ERL;
        Self {
            reg,
            tlb: [TlbEntry::default(); TLB_ENTRIES],
            addr_bus_mask: 0xFFFF_FFFF,
            clock_divisor: crate::config::DEFAULT_CLOCK_DIVISOR,
            virt_cnt_reg: 0,
            virt_cmp_reg: 0,
        }
    }

    /// Read a CP0 register (the 64-bit "DMFC0" view).
    pub fn get_reg(&self, cp0_reg: usize) -> u64 {
        match cp0_reg {
            CP0_COUNT => {
                let delta = self.virt_cmp_reg.wrapping_sub(self.virt_cnt_reg);
                self.reg[CP0_COMPARE]
                    .wrapping_sub((self.clock_divisor as u64) * delta as u64)
            }
            CP0_COMPARE => {
                let delta = self.virt_cmp_reg.wrapping_sub(self.virt_cnt_reg);
                self.reg[CP0_COUNT]
                    .wrapping_add((self.clock_divisor as u64) * delta as u64)
            }
            _ => self.reg.get(cp0_reg).copied().unwrap_or(0),
        }
    }

    /// Write a CP0 register. `irq_hook` is invoked whenever Status or
    /// Cause changes so the caller can re-evaluate pending interrupts
    /// (mirrors `mips64_update_irq_flag`).
    pub fn set_reg(
        &mut self,
        cp0_reg: usize,
        val: u64,
        mut irq_hook: impl FnMut(),
    ) {
        match cp0_reg {
            CP0_STATUS | CP0_CAUSE => {
                self.reg[cp0_reg] = val;
                irq_hook();
            }
            CP0_PAGEMASK => {
                self.reg[cp0_reg] = val & TLB_PAGE_MASK;
            }
            CP0_TLB_HI => {
                self.reg[cp0_reg] = val & CP0_HI_SAFE_MASK;
            }
            CP0_TLB_LO0 | CP0_TLB_LO1 => {
                self.reg[cp0_reg] = val & CP0_LO_SAFE_MASK;
            }
            CP0_RANDOM | CP0_PRID | CP0_CONFIG => {
                // read-only
            }
            CP0_WIRED => {
                self.reg[cp0_reg] = val & TLB_IDX_MASK;
            }
            CP0_COMPARE => {
                self.reg[CP0_CAUSE] &= !CAUSE_IBIT7;
                irq_hook();
                self.reg[cp0_reg] = val;
                let delta = (val as u32).wrapping_sub(self.reg[CP0_COUNT] as u32);
                self.virt_cnt_reg = 0;
                self.virt_cmp_reg = delta / self.clock_divisor;
            }
            CP0_COUNT => {
                self.reg[cp0_reg] = val;
                let delta = (self.reg[CP0_COMPARE] as u32).wrapping_sub(val as u32);
                self.virt_cnt_reg = 0;
                self.virt_cmp_reg = delta / self.clock_divisor;
            }
            _ => {
                self.reg[cp0_reg] = val;
            }
        }
    }

    /// DMFC0: 64-bit read into a GPR.
    pub fn dmfc0(&self, cp0_reg: usize) -> u64 {
        self.get_reg(cp0_reg)
    }

    /// DMTC0: 64-bit write from a GPR.
    pub fn dmtc0(&mut self, cp0_reg: usize, val: u64, irq_hook: impl FnMut()) {
        self.set_reg(cp0_reg, val, irq_hook);
    }

    /// MFC0: sign-extended 32-bit read.
    pub fn mfc0(&self, cp0_reg: usize) -> u64 {
        (self.get_reg(cp0_reg) as i32) as i64 as u64
    }

    /// MTC0: 32-bit write (upper bits of `val` discarded).
    pub fn mtc0(&mut self, cp0_reg: usize, val: u64, irq_hook: impl FnMut()) {
        self.set_reg(cp0_reg, val & 0xFFFF_FFFF, irq_hook);
    }

    /// Compute the physical mappings a TLB entry should install in the
    /// MTS (one per valid half), applying `addr_bus_mask`.
    pub fn tlb_mappings(&self, index: usize) -> Vec<TlbMapping> {
        let entry = &self.tlb[index];
        let size = page_size(entry.mask);
        let v0 = entry.hi & TLB_VPN2_MASK;
        let v1 = v0 + size;

        let mut out = Vec::with_capacity(2);
        if entry.lo0 & TLB_V_MASK != 0 {
            let p0 = (entry.lo0 & TLB_PFN_MASK) << 6;
            out.push(TlbMapping {
                vaddr: v0,
                paddr: p0 & self.addr_bus_mask,
                page_size: size,
            });
        }
        if entry.lo1 & TLB_V_MASK != 0 {
            let p1 = (entry.lo1 & TLB_PFN_MASK) << 6;
            out.push(TlbMapping {
                vaddr: v1,
                paddr: p1 & self.addr_bus_mask,
                page_size: size,
            });
        }
        out
    }

    /// Resolve `vaddr` against every TLB entry (current ASID taken from
    /// the low byte of EntryHi, matching `tlbp`'s own ASID test), used by
    /// the MTS slow path on a cache miss. Entries are unordered here
    /// (unlike real silicon, which stops at the first/lowest-index
    /// match); with non-overlapping OS-managed mappings this makes no
    /// observable difference and keeps the miss path a single scan.
    pub fn translate(&self, vaddr: u64, writing: bool) -> Result<TlbMapping, GuestFaultKind> {
        let asid = self.reg[CP0_TLB_HI] & TLB_ASID_MASK;
        for entry in self.tlb.iter() {
            let size = page_size(entry.mask);
            let vpn2 = entry.hi & TLB_VPN2_MASK;
            let matches_asid = (entry.hi & TLB_G_MASK != 0) || (entry.hi & TLB_ASID_MASK) == asid;
            if !matches_asid {
                continue;
            }
            let v0 = vpn2;
            let half_size = size;
            if vaddr < v0 || vaddr >= v0 + 2 * half_size {
                continue;
            }
            let lo = if vaddr < v0 + half_size {
                entry.lo0
            } else {
                entry.lo1
            };
            if lo & TLB_V_MASK == 0 {
                return Err(if writing {
                    GuestFaultKind::TlbStore
                } else {
                    GuestFaultKind::TlbLoad
                });
            }
            if writing && lo & TLB_D_MASK == 0 {
                return Err(GuestFaultKind::TlbModified);
            }
            let page_base = if vaddr < v0 + half_size { v0 } else { v0 + half_size };
            let pfn_base = (lo & TLB_PFN_MASK) << 6;
            let paddr = (pfn_base + (vaddr - page_base)) & self.addr_bus_mask;
            return Ok(TlbMapping {
                vaddr: page_base,
                paddr,
                page_size: half_size,
            });
        }
        Err(if writing {
            GuestFaultKind::TlbStore
        } else {
            GuestFaultKind::TlbLoad
        })
    }

    /// TLBP: probe for a TLB entry matching the current EntryHi.
    pub fn tlbp(&mut self) {
        let hi = self.reg[CP0_TLB_HI];
        let asid = hi & TLB_ASID_MASK;
        let vpn2 = hi & TLB_VPN2_MASK;

        self.reg[CP0_INDEX] = 0xFFFF_FFFF_8000_0000;
        for (i, entry) in self.tlb.iter().enumerate() {
            let matches_vpn = (entry.hi & TLB_VPN2_MASK) == vpn2;
            let matches_asid =
                (entry.hi & TLB_G_MASK != 0) || (entry.hi & TLB_ASID_MASK) == asid;
            if matches_vpn && matches_asid {
                self.reg[CP0_INDEX] = i as u64;
            }
        }
    }

    /// TLBR: read the indexed TLB entry back into Hi/Lo0/Lo1/PageMask.
    pub fn tlbr(&mut self) {
        let index = self.reg[CP0_INDEX] as usize;
        if index >= TLB_ENTRIES {
            return;
        }
        let entry = self.tlb[index];
        self.reg[CP0_PAGEMASK] = entry.mask;
        self.reg[CP0_TLB_HI] = entry.hi;
        self.reg[CP0_TLB_LO0] = entry.lo0;
        self.reg[CP0_TLB_LO1] = entry.lo1;

        if entry.hi & TLB_G_MASK != 0 {
            self.reg[CP0_TLB_LO0] |= CP0_LO_G_MASK;
            self.reg[CP0_TLB_LO1] |= CP0_LO_G_MASK;
            self.reg[CP0_TLB_HI] &= !TLB_G_MASK;
        }
    }

    /// TLBWI: write the indexed TLB entry from Hi/Lo0/Lo1/PageMask.
    /// Returns the entry index so the caller can remap it into the MTS.
    pub fn tlbwi(&mut self) -> Option<usize> {
        let index = self.reg[CP0_INDEX] as usize;
        if index >= TLB_ENTRIES {
            return None;
        }

        let mask = self.reg[CP0_PAGEMASK] & TLB_PAGE_MASK;
        let mut hi = (self.reg[CP0_TLB_HI] & !mask) & CP0_HI_SAFE_MASK;
        let mut lo0 = self.reg[CP0_TLB_LO0];
        let mut lo1 = self.reg[CP0_TLB_LO1];

        if (lo0 & lo1) & CP0_LO_G_MASK != 0 {
            hi |= TLB_G_MASK;
        }
        lo0 &= !CP0_LO_G_MASK;
        lo1 &= !CP0_LO_G_MASK;

        self.tlb[index] = TlbEntry { mask, hi, lo0, lo1 };
        Some(index)
    }

    /// Gates interrupt delivery: IE must be set, EXL and ERL both clear,
    /// and at least one unmasked line (Status.IM & Cause.IP) pending.
    /// Mirrors `mips64_update_irq_flag_fast`'s `sreg_mask`/`imask` check.
    pub fn irq_ready(&self) -> bool {
        let status = self.reg[CP0_STATUS];
        if status & (STATUS_EXL | STATUS_ERL) != 0 || status & STATUS_IE == 0 {
            return false;
        }
        (status & STATUS_IMASK) & (self.reg[CP0_CAUSE] & CAUSE_IMASK) != 0
    }

    /// Merges the latched interrupt-line bitmap (already shifted into
    /// Cause.IP[8:15] position, e.g. by `MipsCpu::pending_irq_lines`)
    /// into Cause, replacing the previous IP bits wholesale. Mirrors
    /// `mips64_update_irq_flag_fast`'s `cause = (Cause & ~IMASK) | irq_cause`.
    pub fn merge_irq_cause(&mut self, lines: u32, irq_hook: impl FnMut()) {
        let cause = (self.reg[CP0_CAUSE] & !CAUSE_IMASK) | (lines as u64 & CAUSE_IMASK);
        self.set_reg(CP0_CAUSE, cause, irq_hook);
    }

    /// Advances the virtual Count register by `n` ticks and reports
    /// whether Count now matches Compare, i.e. the timer IRQ line
    /// should be raised. Mirrors `mips64_exec_inc_cp0_cnt`; the narrowed
    /// equality (rather than `>=`) against `virt_cmp_reg` is intentional.
    pub fn tick(&mut self, n: u32) -> bool {
        self.virt_cnt_reg = self.virt_cnt_reg.wrapping_add(n);
        if self.virt_cnt_reg == self.virt_cmp_reg {
            self.reg[CP0_COUNT] = self.reg[CP0_COMPARE] & 0xFFFF_FFFF;
            true
        } else {
            false
        }
    }

    /// Current execution mode derived from Status.KSU/EXL/ERL, used to
    /// reject privileged CP0 operations from user mode.
    pub fn require_kernel_mode(&self) -> CoreResult<()> {
        let status = self.reg[CP0_STATUS];
        if status & (STATUS_EXL | STATUS_ERL) != 0 {
            return Ok(());
        }
        let ksu = (status >> STATUS_KSU_SHIFT) & STATUS_KSU_MASK;
        if ksu != STATUS_KSU_KERNEL {
            return Err(CoreError::GuestFault {
                pc: self.reg[CP0_EPC],
                kind: GuestFaultKind::ReservedInstruction,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_matches_reference_formula() {
        assert_eq!(page_size(0), 0x1000);
        assert_eq!(page_size(0x1e000), 0x10000);
    }

    #[test]
    fn count_compare_track_each_other() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.clock_divisor = 4;
        cp0.set_reg(CP0_COUNT, 1000, || {});
        cp0.set_reg(CP0_COMPARE, 1000 + 400, || {});
        assert_eq!(cp0.get_reg(CP0_COMPARE), 1000 + 400);
    }

    #[test]
    fn tlbwi_sets_global_bit_from_lo_halves() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.reg[CP0_INDEX] = 3;
        cp0.reg[CP0_TLB_LO0] = CP0_LO_G_MASK | TLB_V_MASK;
        cp0.reg[CP0_TLB_LO1] = CP0_LO_G_MASK | TLB_V_MASK;
        cp0.reg[CP0_TLB_HI] = 0x1234_5000;
        let idx = cp0.tlbwi().unwrap();
        assert_eq!(idx, 3);
        assert_ne!(cp0.tlb[3].hi & TLB_G_MASK, 0);
        assert_eq!(cp0.tlb[3].lo0 & CP0_LO_G_MASK, 0);
    }

    #[test]
    fn tlbr_reports_g_bit_in_both_lo_halves() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.reg[CP0_INDEX] = 5;
        cp0.tlb[5].hi = TLB_G_MASK | 0xABCD_E000;
        cp0.tlbr();
        assert_ne!(cp0.reg[CP0_TLB_LO0] & CP0_LO_G_MASK, 0);
        assert_ne!(cp0.reg[CP0_TLB_LO1] & CP0_LO_G_MASK, 0);
        assert_eq!(cp0.reg[CP0_TLB_HI] & TLB_G_MASK, 0);
    }

    #[test]
    fn tlbp_finds_global_entry_regardless_of_asid() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.tlb[7].hi = TLB_G_MASK | 0x4000_0000_2000;
        cp0.reg[CP0_TLB_HI] = 0x4000_0000_2000 | 0x55; // different asid
        cp0.tlbp();
        assert_eq!(cp0.reg[CP0_INDEX], 7);
    }

    #[test]
    fn irq_ready_requires_ie_set_and_exl_erl_clear() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.reg[CP0_STATUS] = STATUS_IE | (1 << CAUSE_ISHIFT);
        cp0.reg[CP0_CAUSE] = 1 << CAUSE_ISHIFT;
        assert!(cp0.irq_ready());

        cp0.reg[CP0_STATUS] |= STATUS_EXL;
        assert!(!cp0.irq_ready(), "EXL must block delivery");

        cp0.reg[CP0_STATUS] &= !STATUS_EXL;
        cp0.reg[CP0_STATUS] &= !STATUS_IE;
        assert!(!cp0.irq_ready(), "IE clear must block delivery");
    }

    #[test]
    fn irq_ready_requires_unmasked_line() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.reg[CP0_STATUS] = STATUS_IE | (1 << CAUSE_ISHIFT);
        cp0.reg[CP0_CAUSE] = 1 << (CAUSE_ISHIFT + 1); // a different, unmasked line
        assert!(!cp0.irq_ready());
    }

    #[test]
    fn merge_irq_cause_replaces_ip_bits_without_touching_exc_code() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.reg[CP0_CAUSE] = (ExcCode::Syscall as u64) << CAUSE_EXC_SHIFT;
        cp0.merge_irq_cause(1 << (2 + CAUSE_ISHIFT), || {});
        assert_eq!(cp0.reg[CP0_CAUSE] & CAUSE_IMASK, 1 << (2 + CAUSE_ISHIFT));
        assert_eq!(
            (cp0.reg[CP0_CAUSE] & CAUSE_EXC_MASK) >> CAUSE_EXC_SHIFT,
            ExcCode::Syscall as u64
        );
    }

    #[test]
    fn tick_fires_once_on_exact_match_then_stays_quiet() {
        let mut cp0 = Cp0::new(0, 0);
        cp0.virt_cmp_reg = 3;
        assert!(!cp0.tick(1));
        assert!(!cp0.tick(1));
        assert!(cp0.tick(1), "count == compare must fire");
        assert!(!cp0.tick(1), "count has moved past compare");
    }
}
