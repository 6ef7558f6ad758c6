//! Guest exception delivery, shared between the interpreter and the
//! JIT memory/CP0 helpers so both execution paths redirect into the
//! same exception vector with identical Cause/EPC semantics.
//!
//! Grounded in `mips64_trigger_exception`/`mips64_exec_eret`/
//! `mips64_update_irq_flag_fast` (`mips64.c`).

use crate::cp0::{
    ExcCode, CAUSE_BD_SLOT, CAUSE_EXC_MASK, CAUSE_EXC_SHIFT, CP0_CAUSE, CP0_EPC, CP0_ERR_EPC,
    CP0_STATUS, STATUS_BEV, STATUS_ERL, STATUS_EXL,
};
use crate::mips_cpu::MipsCpu;

/// Architectural exception-vector offset for everything but a TLB
/// refill (`vector = 0x180` in the donor, unconditionally — the
/// refill/general distinction below is this core's own addition).
const GENERAL_VECTOR: u64 = 0x180;
/// Offset used for a TLB refill (no matching entry at all) taken
/// outside of an already-nested exception.
const TLB_REFILL_VECTOR: u64 = 0x000;
const BOOTSTRAP_BASE: u64 = 0xFFFF_FFFF_BFC0_0200;
const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Delivers a guest exception: sets EPC (only if EXL was clear), sets
/// Cause's ExcCode/BD bits while preserving Cause.IP, sets Status.EXL,
/// and redirects PC to the bootstrap or kernel vector (by Status.BEV)
/// plus the architectural offset — the TLB-refill offset for a fresh
/// TlbLoad/TlbSave, the general offset for everything else (including
/// TlbMod, which is never refill-eligible).
pub fn deliver_exception(cpu: &mut MipsCpu, code: ExcCode, in_delay_slot: bool) {
    let status = cpu.cp0.get_reg(CP0_STATUS);
    let exl_was_clear = status & STATUS_EXL == 0;
    let mut irq_hook = || {};

    if exl_was_clear {
        let epc = if in_delay_slot { cpu.pc.wrapping_sub(4) } else { cpu.pc };
        cpu.cp0.set_reg(CP0_EPC, epc, &mut irq_hook);
    }

    let cause = (cpu.cp0.get_reg(CP0_CAUSE) & !(CAUSE_EXC_MASK | CAUSE_BD_SLOT))
        | ((code as u64) << CAUSE_EXC_SHIFT)
        | if in_delay_slot { CAUSE_BD_SLOT } else { 0 };
    cpu.cp0.set_reg(CP0_CAUSE, cause, &mut irq_hook);

    let new_status = status | STATUS_EXL;
    cpu.cp0.set_reg(CP0_STATUS, new_status, &mut irq_hook);

    let refill = exl_was_clear && matches!(code, ExcCode::TlbLoad | ExcCode::TlbSave);
    let offset = if refill { TLB_REFILL_VECTOR } else { GENERAL_VECTOR };
    let base = if new_status & STATUS_BEV != 0 { BOOTSTRAP_BASE } else { KERNEL_BASE };
    cpu.pc = base + offset;
    cpu.fault_pending = 1;

    tracing::debug!(
        cpu = cpu.id,
        ?code,
        epc = cpu.cp0.get_reg(CP0_EPC),
        in_delay_slot,
        refill,
        pc = cpu.pc,
        "delivering guest exception"
    );
}

/// Executes ERET: restores PC from EPC, or from ErrorEPC and clears
/// ERL instead of EXL when ERL was set; clears the LL/SC reservation;
/// re-evaluates pending IRQ state. Mirrors `mips64_exec_eret` exactly,
/// using the 64-bit register view so a double-width EPC survives.
pub fn exec_eret(cpu: &mut MipsCpu) {
    let status = cpu.cp0.get_reg(CP0_STATUS);
    let mut irq_hook = || {};
    if status & STATUS_ERL != 0 {
        cpu.cp0.set_reg(CP0_STATUS, status & !STATUS_ERL, &mut irq_hook);
        cpu.pc = cpu.cp0.get_reg(CP0_ERR_EPC);
    } else {
        cpu.cp0.set_reg(CP0_STATUS, status & !STATUS_EXL, &mut irq_hook);
        cpu.pc = cpu.cp0.get_reg(CP0_EPC);
    }
    cpu.ll_bit = 0;
    poll_irq(cpu);
}

/// Recomputes Cause.IP from the latched external/timer lines and, if
/// the architectural gate (`Cp0::irq_ready`) now holds, delivers the
/// interrupt exception. Called once per dispatch iteration by the
/// interpreter and once per non-delay-slot instruction by the JIT's
/// IRQ-poll helper.
pub fn poll_irq(cpu: &mut MipsCpu) {
    if !cpu.has_pending_irq() {
        return;
    }
    let lines = cpu.pending_irq_lines();
    let mut irq_hook = || {};
    cpu.cp0.merge_irq_cause(lines, &mut irq_hook);
    if cpu.cp0.irq_ready() {
        deliver_exception(cpu, ExcCode::Interrupt, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp0::{CAUSE_IMASK, CAUSE_ISHIFT, STATUS_IE, STATUS_IMASK};

    #[test]
    fn delivery_sets_bd_bit_and_exl_when_in_delay_slot() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.pc = 0x1000;
        deliver_exception(&mut cpu, ExcCode::Syscall, true);
        assert_eq!(cpu.cp0.mfc0(CP0_EPC), 0x0FFC);
        assert_eq!(cpu.cp0.mfc0(CP0_CAUSE) & 0x8000_0000, 0x8000_0000);
        assert_ne!(cpu.cp0.get_reg(CP0_STATUS) & STATUS_EXL, 0);
        // default Cp0::new() sets BEV, so general vector is bootstrap-based.
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0380);
        assert_eq!(cpu.fault_pending, 1);
    }

    #[test]
    fn epc_not_overwritten_when_exl_already_set() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let status = cpu.cp0.get_reg(CP0_STATUS) | STATUS_EXL;
        cpu.cp0.set_reg(CP0_STATUS, status, || {});
        cpu.cp0.set_reg(CP0_EPC, 0x5000, || {});
        cpu.pc = 0x9000;
        deliver_exception(&mut cpu, ExcCode::Breakpoint, false);
        assert_eq!(cpu.cp0.get_reg(CP0_EPC), 0x5000, "EPC must not move once EXL was set");
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0380);
    }

    #[test]
    fn tlb_load_uses_refill_vector_when_exl_was_clear() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.pc = 0x2000;
        deliver_exception(&mut cpu, ExcCode::TlbLoad, false);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0200, "refill vector has offset 0");
    }

    #[test]
    fn tlb_mod_never_uses_refill_vector() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.pc = 0x2000;
        deliver_exception(&mut cpu, ExcCode::TlbMod, false);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0380);
    }

    #[test]
    fn general_vector_uses_kernel_base_when_bev_clear() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let status = cpu.cp0.get_reg(CP0_STATUS) & !STATUS_BEV;
        cpu.cp0.set_reg(CP0_STATUS, status, || {});
        cpu.pc = 0x2000;
        deliver_exception(&mut cpu, ExcCode::Syscall, false);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn eret_restores_pc_and_clears_exl() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.pc = 0x1000;
        deliver_exception(&mut cpu, ExcCode::Syscall, false);
        assert_ne!(cpu.cp0.get_reg(CP0_STATUS) & STATUS_EXL, 0);
        cpu.ll_bit = 1;
        exec_eret(&mut cpu);
        assert_eq!(cpu.pc, 0x1000);
        assert_eq!(cpu.cp0.get_reg(CP0_STATUS) & STATUS_EXL, 0);
        assert_eq!(cpu.ll_bit, 0);
    }

    #[test]
    fn eret_uses_error_epc_when_erl_set() {
        let mut cpu = MipsCpu::new(0, 0, 0); // Cp0::new sets ERL by default
        cpu.cp0.set_reg(CP0_ERR_EPC, 0xBFC0_0000, || {});
        exec_eret(&mut cpu);
        assert_eq!(cpu.pc, 0xBFC0_0000);
        assert_eq!(cpu.cp0.get_reg(CP0_STATUS) & STATUS_ERL, 0);
    }

    #[test]
    fn poll_irq_redirects_pc_when_line_raised_and_enabled() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let status = (cpu.cp0.get_reg(CP0_STATUS) & !(STATUS_ERL | STATUS_EXL))
            | STATUS_IE
            | ((1u64 << 2) << 8); // Status.IM[2] = 1
        cpu.cp0.set_reg(CP0_STATUS, status, || {});
        cpu.pc = 0x4000;

        cpu.raise_irq(2);
        poll_irq(&mut cpu);

        assert_eq!(cpu.cp0.get_reg(CP0_EPC), 0x4000);
        assert_eq!(
            cpu.cp0.get_reg(CP0_CAUSE) & CAUSE_IMASK,
            1 << (2 + CAUSE_ISHIFT)
        );
        assert_eq!(cpu.fault_pending, 1);
    }

    #[test]
    fn poll_irq_does_nothing_when_masked_out() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let status = (cpu.cp0.get_reg(CP0_STATUS) & !(STATUS_ERL | STATUS_EXL | STATUS_IMASK))
            | STATUS_IE;
        cpu.cp0.set_reg(CP0_STATUS, status, || {});
        cpu.pc = 0x4000;

        cpu.raise_irq(2); // not in Status.IM
        poll_irq(&mut cpu);

        assert_eq!(cpu.pc, 0x4000, "no unmasked line pending, must not redirect");
        assert_eq!(cpu.fault_pending, 0);
    }
}
