//! Text-format CPU state save/restore.
//!
//! One `name: hex64` pair per line: GPRs by architectural name, HI/LO/PC,
//! CP0 registers by name, FPU placeholders (`fpu<N>`, always zero — no
//! floating-point register file exists in this core), and TLB entries as
//! `tlb<N>_mask`/`tlb<N>_hi`/`tlb<N>_lo0`/`tlb<N>_lo1`. Restore ignores any
//! line it doesn't recognize, so a file saved by a newer/older build still
//! loads. Grounded in `mips64_save_state`/`mips64_restore_state` (`mips64.c`)
//! and the register-name tables in `cp0.c`/`mips64.c`.

use std::io::{self, Read, Write};

use crate::cp0::{TlbEntry, CP0_REG_COUNT, TLB_ENTRIES};
use crate::mips_cpu::{MipsCpu, NUM_GPRS};

/// Number of FPU registers saved as placeholders, matching
/// `MIPS64_CP1_REG_NR` in the donor core.
const FPU_REG_COUNT: usize = 32;

const GPR_NAMES: [&str; NUM_GPRS] = [
    "zr", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

const CP0_REG_NAMES: [&str; CP0_REG_COUNT] = [
    "index",
    "random",
    "entry_lo0",
    "entry_lo1",
    "context",
    "pagemask",
    "wired",
    "cp0_undef_7",
    "badvaddr",
    "count",
    "entry_hi",
    "compare",
    "status",
    "cause",
    "epc",
    "prid",
    "config",
    "ll_addr",
    "watch_lo",
    "watch_hi",
    "xcontext",
    "cp0_undef_21",
    "cp0_undef_22",
    "cp0_undef_23",
    "cp0_undef_24",
    "cp0_undef_25",
    "ecc",
    "cache_err",
    "tag_lo",
    "tag_hi",
    "err_epc",
    "cp0_undef_31",
];

fn gpr_index(name: &str) -> Option<usize> {
    GPR_NAMES.iter().position(|&n| n == name)
}

fn cp0_index(name: &str) -> Option<usize> {
    CP0_REG_NAMES.iter().position(|&n| n == name)
}

/// Writes `cpu`'s architectural state in the `name: hex64` text format.
pub fn write_state(cpu: &MipsCpu, w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "pc: {:016x}", cpu.pc)?;
    writeln!(w, "lo: {:016x}", cpu.lo)?;
    writeln!(w, "hi: {:016x}", cpu.hi)?;

    for (i, name) in GPR_NAMES.iter().enumerate() {
        writeln!(w, "{name}: {:016x}", cpu.gpr[i])?;
    }

    for (i, name) in CP0_REG_NAMES.iter().enumerate() {
        writeln!(w, "{name}: {:016x}", cpu.cp0.reg[i])?;
    }

    for i in 0..FPU_REG_COUNT {
        writeln!(w, "fpu{i}: {:016x}", 0u64)?;
    }

    for (i, entry) in cpu.cp0.tlb.iter().enumerate() {
        writeln!(w, "tlb{i}_mask: {:016x}", entry.mask)?;
        writeln!(w, "tlb{i}_hi: {:016x}", entry.hi)?;
        writeln!(w, "tlb{i}_lo0: {:016x}", entry.lo0)?;
        writeln!(w, "tlb{i}_lo1: {:016x}", entry.lo1)?;
    }

    Ok(())
}

/// Leniently parses a hex value the way `mips64_hex_u64` does: any
/// character that isn't a hex digit simply contributes nothing, rather
/// than aborting the whole restore over one malformed line.
fn parse_hex64(value: &str) -> u64 {
    let mut res: u64 = 0;
    for c in value.trim().chars() {
        if let Some(d) = c.to_digit(16) {
            res = (res << 4) | d as u64;
        }
    }
    res
}

/// Parses a TLB field suffix (`mask`/`hi`/`lo0`/`lo1`) out of a
/// `tlb<N>_<field>` line name, e.g. `tlb3_lo1` -> `(3, "lo1")`.
fn tlb_field(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("tlb")?;
    let (idx, field) = rest.split_once('_')?;
    let idx: usize = idx.parse().ok()?;
    Some((idx, field))
}

/// Restores `cpu`'s architectural state from the `name: hex64` text
/// format, then rebuilds the MTS cache from the restored TLB. Unknown
/// lines (any name not matched below) are ignored so the format can
/// gain fields without breaking older saves.
pub fn read_state(cpu: &mut MipsCpu, r: &mut impl Read) -> io::Result<()> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;

    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let val = parse_hex64(value);

        if name == "pc" {
            cpu.pc = val;
            continue;
        }
        if name == "lo" {
            cpu.lo = val;
            continue;
        }
        if name == "hi" {
            cpu.hi = val;
            continue;
        }
        if let Some(i) = gpr_index(name) {
            cpu.gpr[i] = val;
            continue;
        }
        if let Some(i) = cp0_index(name) {
            cpu.cp0.reg[i] = val;
            continue;
        }
        if name.starts_with("fpu") {
            continue; // no FPU register file to restore into
        }
        if let Some((idx, field)) = tlb_field(name) {
            if idx >= TLB_ENTRIES {
                continue;
            }
            let entry: &mut TlbEntry = &mut cpu.cp0.tlb[idx];
            match field {
                "mask" => entry.mask = val,
                "hi" => entry.hi = val,
                "lo0" => entry.lo0 = val,
                "lo1" => entry.lo1 = val,
                _ => {}
            }
            continue;
        }
        // anything else (stray blank lines, future fields) is ignored.
    }

    cpu.mts.flush_all();
    tracing::debug!(cpu = cpu.id, pc = cpu.pc, "restored CPU state");
    Ok(())
}

/// Saves `cpu`'s state to `path`, matching `mips64_save_state`.
pub fn cpu_save_state(cpu: &MipsCpu, path: &std::path::Path) -> io::Result<()> {
    let mut f = std::fs::File::create(path)?;
    write_state(cpu, &mut f)
}

/// Restores `cpu`'s state from `path`, matching `mips64_restore_state`.
pub fn cpu_restore_state(cpu: &mut MipsCpu, path: &std::path::Path) -> io::Result<()> {
    let mut f = std::fs::File::open(path)?;
    read_state(cpu, &mut f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_gprs_cp0_and_tlb() {
        let mut cpu = MipsCpu::new(0, 0x0640_0000, 0x00c08ff0);
        cpu.pc = 0xFFFF_FFFF_8000_1000;
        cpu.gpr[4] = 0x1122_3344_5566_7788;
        cpu.gpr[31] = 0xDEAD_BEEF;
        cpu.hi = 7;
        cpu.lo = 9;
        cpu.cp0.reg[crate::cp0::CP0_STATUS] = 0x1234;
        cpu.cp0.tlb[2].mask = 0x1e000;
        cpu.cp0.tlb[2].hi = 0xABCD_0000;
        cpu.cp0.tlb[2].lo0 = 0x3;
        cpu.cp0.tlb[2].lo1 = 0x7;

        let mut buf = Vec::new();
        write_state(&cpu, &mut buf).unwrap();

        let mut restored = MipsCpu::new(0, 0, 0);
        read_state(&mut restored, &mut buf.as_slice()).unwrap();

        assert_eq!(restored.pc, cpu.pc);
        assert_eq!(restored.gpr[4], cpu.gpr[4]);
        assert_eq!(restored.gpr[31], cpu.gpr[31]);
        assert_eq!(restored.hi, cpu.hi);
        assert_eq!(restored.lo, cpu.lo);
        assert_eq!(restored.cp0.reg[crate::cp0::CP0_STATUS], cpu.cp0.reg[crate::cp0::CP0_STATUS]);
        assert_eq!(restored.cp0.tlb[2].mask, cpu.cp0.tlb[2].mask);
        assert_eq!(restored.cp0.tlb[2].hi, cpu.cp0.tlb[2].hi);
        assert_eq!(restored.cp0.tlb[2].lo0, cpu.cp0.tlb[2].lo0);
        assert_eq!(restored.cp0.tlb[2].lo1, cpu.cp0.tlb[2].lo1);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let text = "pc: 0000000000001000\nsome_future_field: ffffffffffffffff\nbogus line with no colon\n";
        read_state(&mut cpu, &mut text.as_bytes()).unwrap();
        assert_eq!(cpu.pc, 0x1000);
    }

    #[test]
    fn gpr_zero_round_trips_as_zero_name() {
        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut buf = Vec::new();
        write_state(&cpu, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().any(|l| l.starts_with("zr: ")));
        assert!(text.lines().any(|l| l.starts_with("ra: ")));
    }
}
