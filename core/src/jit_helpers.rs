//! `extern "C"` slow-path helpers called from JIT-generated code via
//! `ir_builder::gen_call`'s raw function-pointer mechanism.
//!
//! The JIT fast path inlines the MTS L1/L2 lookup directly with
//! `gen_ld`/`gen_brcond` (spec 4.4); these helpers are what a cache
//! miss, a CP0 access, or a trap falls back to. Every helper takes the
//! CPU's `env` pointer as its first argument (the same convention
//! `gen_call` pads unused argument slots for) and returns a `u64` the
//! generated code stores into the call's destination temp. A helper
//! that raises a guest exception sets `cpu.fault_pending`; the caller
//! is responsible for checking it with `gen_brcond` and exiting the TB.

use crate::cp0::ExcCode;
use crate::exception::{deliver_exception, exec_eret, poll_irq};
use crate::mips_cpu::{MipsCpu, TIMER_IRQ_LINE};
use crate::mts::{
    merge_ldl, merge_ldr, merge_lwl, merge_lwr, MemOpKind, MtsBacking,
};

unsafe fn host_ptr(cpu: &MipsCpu, paddr: u64) -> *mut u8 {
    cpu.ram_base.add(paddr as usize)
}

/// Resolves `vaddr` to a host pointer, filling the MTS on a miss via
/// `Cp0::translate`. Pure lookup: never delivers an exception itself,
/// so callers can distinguish "fault, but I still need to decide
/// `in_delay_slot`" (the interpreter's `Bus` impl) from "fault, always
/// delivered with delay_slot=false" (the JIT helpers below).
pub(crate) unsafe fn resolve(cpu: &mut MipsCpu, vaddr: u64, writing: bool) -> Result<*mut u8, crate::error::GuestFaultKind> {
    use crate::error::GuestFaultKind;
    let vpage = vaddr & !crate::mts::MTS_PAGE_MASK;
    if let Some(entry) = cpu.mts.lookup(vaddr) {
        return match entry.backing {
            MtsBacking::Ram { host_base, writable } => {
                if writing && !writable {
                    return Err(GuestFaultKind::TlbModified);
                }
                Ok(host_base.add((vaddr & crate::mts::MTS_PAGE_MASK) as usize))
            }
            MtsBacking::Device { .. } => Err(GuestFaultKind::BusErrorData),
        };
    }

    match cpu.cp0.translate(vaddr, writing) {
        Ok(mapping) => {
            // `translate` resolves `vaddr` itself, not its containing TLB
            // page; back out this 4 KiB granule's physical base so the
            // cached host_base lines up with `vaddr & MTS_PAGE_MASK` on
            // every subsequent hit in the page, independent of the TLB's
            // (possibly larger) page size.
            let page_paddr = mapping.paddr - (vaddr & crate::mts::MTS_PAGE_MASK);
            if page_paddr >= cpu.ram_size {
                return Err(GuestFaultKind::BusErrorData);
            }
            let host_base = host_ptr(cpu, page_paddr);
            cpu.mts.insert(
                vpage,
                MtsBacking::Ram {
                    host_base,
                    writable: true,
                },
            );
            Ok(host_base.add((vaddr & crate::mts::MTS_PAGE_MASK) as usize))
        }
        Err(kind) => Err(kind),
    }
}

/// Resolves `vaddr` and delivers any fault as a non-delay-slot
/// exception, the convention every JIT helper below needs since the
/// generated code only checks `fault_pending` after the call returns.
unsafe fn resolve_or_fault(cpu: &mut MipsCpu, vaddr: u64, writing: bool) -> Option<*mut u8> {
    match resolve(cpu, vaddr, writing) {
        Ok(ptr) => Some(ptr),
        Err(kind) => {
            deliver_exception(cpu, kind.to_exc_code(), false);
            None
        }
    }
}

/// Resolves the host pointer for `vaddr` for the interpreter's
/// production `Bus` impl (see `bus::MipsBus`), leaving exception
/// delivery to the caller (which knows the in-delay-slot context).
pub fn mem_resolve(cpu: &mut MipsCpu, vaddr: u64, writing: bool) -> Result<*mut u8, crate::error::GuestFaultKind> {
    unsafe { resolve(cpu, vaddr, writing) }
}

/// Resolves the host pointer for an instruction fetch at `pc`. Used by
/// both `MipsBus::fetch` and the JIT frontend to find the page a TB's
/// `fetch_insn` should index into (see `frontend::mips64::translate_tb`).
pub fn mem_resolve_fetch(cpu: &mut MipsCpu, pc: u64) -> Result<*const u8, crate::error::GuestFaultKind> {
    unsafe { resolve(cpu, pc, false).map(|p| p as *const u8) }
}

pub(crate) unsafe fn read_be(ptr: *const u8, size: usize) -> u64 {
    let mut v = 0u64;
    for i in 0..size {
        v = (v << 8) | *ptr.add(i) as u64;
    }
    v
}

pub(crate) unsafe fn write_be(ptr: *mut u8, size: usize, val: u64) {
    for i in 0..size {
        let shift = (size - 1 - i) * 8;
        *ptr.add(i) = (val >> shift) as u8;
    }
}

pub(crate) fn sign_extend(val: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    (((val << shift) as i64) >> shift) as u64
}

/// Sign/zero-extends a raw big-endian load value the way `Lb`/`Lh`/`Lw`/
/// `Ll` require; other ops pass the raw bytes through unchanged.
pub(crate) fn extend_for_load(op: MemOpKind, raw: u64) -> u64 {
    match op {
        MemOpKind::Lb => sign_extend(raw, 8),
        MemOpKind::Lh => sign_extend(raw, 16),
        MemOpKind::Lw | MemOpKind::Ll => sign_extend(raw, 32),
        _ => raw,
    }
}

/// `env: *mut MipsCpu, vaddr: u64, op: u64 (MemOpKind as u32) -> loaded value`
#[no_mangle]
pub extern "C" fn jit_helper_load(env: *mut MipsCpu, vaddr: u64, op: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let op = mem_op_from_u64(op);
    if op.clears_ll_bit() {
        cpu.ll_bit = 0;
    } else {
        cpu.ll_bit = 1;
    }
    let Some(ptr) = (unsafe { resolve_or_fault(cpu, vaddr, false) }) else {
        return 0;
    };
    let raw = unsafe { read_be(ptr, op.size().max(1) as usize) };
    match op {
        MemOpKind::Lb => sign_extend(raw, 8),
        MemOpKind::Lh => sign_extend(raw, 16),
        MemOpKind::Lw | MemOpKind::Ll => sign_extend(raw, 32),
        _ => raw,
    }
}

/// Flags `vaddr`'s page as hit if a TB was ever generated from it, so
/// the dispatch loop can invalidate the stale translation before it
/// runs again. Cheap (hash-set lookup) on the common case of a write
/// to a data page with no live code.
pub(crate) fn note_write(cpu: &mut MipsCpu, vaddr: u64) {
    let vpage = vaddr & !crate::mts::MTS_PAGE_MASK;
    if cpu.code_pages.contains(&vpage) {
        cpu.smc_hit = Some(vpage);
    }
}

/// `env: *mut MipsCpu, vaddr: u64, op: u64, val: u64 -> 0`
#[no_mangle]
pub extern "C" fn jit_helper_store(env: *mut MipsCpu, vaddr: u64, op: u64, val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let op = mem_op_from_u64(op);
    cpu.ll_bit = 0;
    let Some(ptr) = (unsafe { resolve_or_fault(cpu, vaddr, true) }) else {
        return 0;
    };
    unsafe { write_be(ptr, op.size() as usize, val) };
    note_write(cpu, vaddr);
    0
}

/// `env, vaddr, val -> 1 on success, 0 on failure (no prior LL)`
#[no_mangle]
pub extern "C" fn jit_helper_store_conditional(env: *mut MipsCpu, vaddr: u64, val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    if cpu.ll_bit == 0 {
        return 0;
    }
    let Some(ptr) = (unsafe { resolve_or_fault(cpu, vaddr, true) }) else {
        return 0;
    };
    unsafe { write_be(ptr, 4, val) };
    note_write(cpu, vaddr);
    1
}

/// `env, vaddr, name_tag (lwl=0/lwr=1/ldl=2/ldr=3), reg_val -> merged value`
#[no_mangle]
pub extern "C" fn jit_helper_unaligned_load(env: *mut MipsCpu, vaddr: u64, tag: u64, reg_val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let is_double = tag >= 2;
    let aligned = if is_double { vaddr & !7 } else { vaddr & !3 };
    cpu.ll_bit = 0;
    let Some(ptr) = (unsafe { resolve_or_fault(cpu, aligned, false) }) else {
        return 0;
    };
    let fetched = unsafe { read_be(ptr, if is_double { 8 } else { 4 }) };
    match tag {
        0 => merge_lwl(reg_val, vaddr, fetched as u32),
        1 => merge_lwr(reg_val, vaddr, fetched as u32),
        2 => merge_ldl(reg_val, vaddr, fetched),
        3 => merge_ldr(reg_val, vaddr, fetched),
        _ => unreachable!(),
    }
}

/// `env, vaddr, tag (swl=0/swr=1/sdl=2/sdr=3), reg_val -> 0`
#[no_mangle]
pub extern "C" fn jit_helper_unaligned_store(env: *mut MipsCpu, vaddr: u64, tag: u64, reg_val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let is_double = tag >= 2;
    let aligned = if is_double { vaddr & !7 } else { vaddr & !3 };
    cpu.ll_bit = 0;
    let Some(ptr) = (unsafe { resolve_or_fault(cpu, aligned, true) }) else {
        return 0;
    };
    let current = unsafe { read_be(ptr, if is_double { 8 } else { 4 }) };
    let merged = match tag {
        0 => merge_lwr(current, vaddr ^ 3, reg_val as u32) & 0xFFFF_FFFF,
        1 => merge_lwl(current, vaddr ^ 3, reg_val as u32) & 0xFFFF_FFFF,
        2 => merge_ldr(current, vaddr ^ 7, reg_val),
        3 => merge_ldl(current, vaddr ^ 7, reg_val),
        _ => unreachable!(),
    };
    unsafe { write_be(ptr, if is_double { 8 } else { 4 }, merged) };
    note_write(cpu, aligned);
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_mfc0(env: *mut MipsCpu, reg: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    cpu.cp0.mfc0(reg as usize)
}

#[no_mangle]
pub extern "C" fn jit_helper_mtc0(env: *mut MipsCpu, reg: u64, val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let mut irq_hook = || {};
    cpu.cp0.mtc0(reg as usize, val, &mut irq_hook);
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_dmfc0(env: *mut MipsCpu, reg: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    cpu.cp0.dmfc0(reg as usize)
}

#[no_mangle]
pub extern "C" fn jit_helper_dmtc0(env: *mut MipsCpu, reg: u64, val: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let mut irq_hook = || {};
    cpu.cp0.dmtc0(reg as usize, val, &mut irq_hook);
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_tlbp(env: *mut MipsCpu) -> u64 {
    let cpu = unsafe { &mut *env };
    cpu.cp0.tlbp();
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_tlbr(env: *mut MipsCpu) -> u64 {
    let cpu = unsafe { &mut *env };
    cpu.cp0.tlbr();
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_tlbwi(env: *mut MipsCpu) -> u64 {
    let cpu = unsafe { &mut *env };
    if let Some(idx) = cpu.cp0.tlbwi() {
        for m in cpu.cp0.tlb_mappings(idx) {
            cpu.mts.invalidate_page(m.vaddr);
        }
    }
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_break(env: *mut MipsCpu, in_delay_slot: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    deliver_exception(cpu, ExcCode::Breakpoint, in_delay_slot != 0);
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_syscall(env: *mut MipsCpu, in_delay_slot: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    deliver_exception(cpu, ExcCode::Syscall, in_delay_slot != 0);
    0
}

#[no_mangle]
pub extern "C" fn jit_helper_eret(env: *mut MipsCpu) -> u64 {
    let cpu = unsafe { &mut *env };
    exec_eret(cpu);
    0
}

/// Advances the virtual Count register by `n` ticks (plus whatever the
/// timer thread accumulated since the last poll) and raises the timer
/// IRQ line on a Count/Compare match. `env: *mut MipsCpu, n: u64 -> 0`.
#[no_mangle]
pub extern "C" fn jit_helper_timer_tick(env: *mut MipsCpu, n: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    let drained = cpu.timer_irq_pending.swap(0, std::sync::atomic::Ordering::AcqRel);
    if cpu.cp0.tick(n as u32 + drained) {
        cpu.raise_irq(TIMER_IRQ_LINE);
    }
    0
}

/// Re-evaluates pending IRQ state and delivers one if the gate now
/// holds; sets `cpu.fault_pending` the same way any other exception
/// delivery does. `env: *mut MipsCpu -> 0`.
#[no_mangle]
pub extern "C" fn jit_helper_irq_poll(env: *mut MipsCpu) -> u64 {
    let cpu = unsafe { &mut *env };
    poll_irq(cpu);
    0
}

/// Tag values mirror `MIPS_MEMOP_*`'s declaration order in `mips64.h`
/// (LDC1/SDC1 omitted — floating-point load/store is out of scope).
fn mem_op_from_u64(tag: u64) -> MemOpKind {
    match tag {
        0 => MemOpKind::Lb,
        1 => MemOpKind::Lbu,
        2 => MemOpKind::Lh,
        3 => MemOpKind::Lhu,
        4 => MemOpKind::Lw,
        5 => MemOpKind::Lwu,
        6 => MemOpKind::Ld,
        7 => MemOpKind::Sb,
        8 => MemOpKind::Sh,
        9 => MemOpKind::Sw,
        10 => MemOpKind::Sd,
        19 => MemOpKind::Ll,
        20 => MemOpKind::Sc,
        _ => MemOpKind::Ld,
    }
}

/// Tag values mirror `GuestFaultKind`'s declaration order; used to pass a
/// fault kind across the `extern "C"` boundary in `jit_helper_raise_fault`,
/// the same way `mem_op_from_u64` passes a `MemOpKind`.
fn fault_kind_from_tag(tag: u64) -> crate::error::GuestFaultKind {
    use crate::error::GuestFaultKind;
    match tag {
        0 => GuestFaultKind::TlbLoad,
        1 => GuestFaultKind::TlbStore,
        2 => GuestFaultKind::TlbModified,
        3 => GuestFaultKind::AddressErrorLoad,
        4 => GuestFaultKind::AddressErrorStore,
        5 => GuestFaultKind::BusErrorInstr,
        6 => GuestFaultKind::BusErrorData,
        7 => GuestFaultKind::Syscall,
        8 => GuestFaultKind::Breakpoint,
        10 => GuestFaultKind::CoprocessorUnusable,
        11 => GuestFaultKind::IntegerOverflow,
        12 => GuestFaultKind::Trap,
        _ => GuestFaultKind::ReservedInstruction,
    }
}

/// Reverse of `fault_kind_from_tag`, for callers (the MIPS JIT frontend's
/// fault-TB generator) that build the tag to pass into generated code.
pub fn fault_kind_tag(kind: crate::error::GuestFaultKind) -> u64 {
    use crate::error::GuestFaultKind;
    match kind {
        GuestFaultKind::TlbLoad => 0,
        GuestFaultKind::TlbStore => 1,
        GuestFaultKind::TlbModified => 2,
        GuestFaultKind::AddressErrorLoad => 3,
        GuestFaultKind::AddressErrorStore => 4,
        GuestFaultKind::BusErrorInstr => 5,
        GuestFaultKind::BusErrorData => 6,
        GuestFaultKind::Syscall => 7,
        GuestFaultKind::Breakpoint => 8,
        GuestFaultKind::ReservedInstruction => 9,
        GuestFaultKind::CoprocessorUnusable => 10,
        GuestFaultKind::IntegerOverflow => 11,
        GuestFaultKind::Trap => 12,
    }
}

/// Raises the fault encoded by `tag` (see `fault_kind_tag`) as a
/// non-delay-slot exception. Used by the fault TB a failed translation
/// generates in place of real guest code: the TB's only job is to call
/// this once and exit, so `in_delay_slot` is always `false` here, unlike
/// `jit_helper_break`/`jit_helper_syscall`/`jit_helper_eret` which forward
/// the delay-slot state of the trapping instruction itself.
#[no_mangle]
pub extern "C" fn jit_helper_raise_fault(env: *mut MipsCpu, tag: u64) -> u64 {
    let cpu = unsafe { &mut *env };
    deliver_exception(cpu, fault_kind_from_tag(tag).to_exc_code(), false);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp0::CP0_STATUS;

    fn cpu_with_ram(size: usize) -> (MipsCpu, Vec<u8>) {
        let mut ram = vec![0u8; size];
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.bind_ram(ram.as_mut_ptr(), size as u64);
        // Identity-map an entry directly into the MTS so these tests
        // exercise the helper read/write path without a full TLB setup.
        cpu.mts.insert(
            0,
            MtsBacking::Ram {
                host_base: ram.as_mut_ptr(),
                writable: true,
            },
        );
        (cpu, ram)
    }

    #[test]
    fn store_then_load_round_trips_a_word() {
        let (mut cpu, _ram) = cpu_with_ram(4096);
        let env: *mut MipsCpu = &mut cpu;
        jit_helper_store(env, 0x10, 9, 0xdead_beef); // op tag 9 = Sw
        let v = jit_helper_load(env, 0x10, 4);
        assert_eq!(v as u32, 0xdead_beef);
    }

    #[test]
    fn mtc0_mfc0_round_trip_through_helpers() {
        let (mut cpu, _ram) = cpu_with_ram(4096);
        let env: *mut MipsCpu = &mut cpu;
        jit_helper_mtc0(env, CP0_STATUS as u64, 0x1234_5678);
        let got = jit_helper_mfc0(env, CP0_STATUS as u64);
        assert_eq!(got as u32, 0x1234_5678);
    }

    #[test]
    fn eret_helper_restores_pc_from_epc() {
        let (mut cpu, _ram) = cpu_with_ram(4096);
        cpu.cp0.set_reg(crate::cp0::CP0_STATUS, 0, || {});
        cpu.cp0.set_reg(crate::cp0::CP0_EPC, 0x80010000, || {});
        cpu.ll_bit = 1;
        let env: *mut MipsCpu = &mut cpu;
        jit_helper_eret(env);
        assert_eq!(cpu.pc, 0x80010000);
        assert_eq!(cpu.ll_bit, 0);
    }

    #[test]
    fn timer_tick_helper_raises_timer_irq_on_match() {
        let (mut cpu, _ram) = cpu_with_ram(4096);
        cpu.cp0.virt_cmp_reg = 2;
        let env: *mut MipsCpu = &mut cpu;
        jit_helper_timer_tick(env, 1);
        assert!(!cpu.has_pending_irq());
        jit_helper_timer_tick(env, 1);
        assert!(cpu.has_pending_irq(), "count reached compare, timer IRQ line must raise");
    }
}
