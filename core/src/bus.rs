//! Production `interp::Bus` implementation wired to a live `MipsCpu`.
//!
//! `Interp::step` takes `cpu: &mut MipsCpu` and `bus: &mut impl Bus` as
//! separate arguments so the interpreter can deliver exceptions on a
//! fault while the bus stays a pure byte-access abstraction (see
//! `interp::Bus`'s doc comment). A real bus still needs the same
//! `cp0`/`mts` state the passed-in `cpu` reference already borrows, so
//! `MipsBus` holds a raw pointer to it instead of a second `&mut`
//! borrow — the same convention `jit_helpers`'s `env: *mut MipsCpu`
//! uses for JIT-called helpers, applied here to the interpreter path.

use crate::error::{CoreError, CoreResult, GuestFaultKind};
use crate::interp::Bus;
use crate::jit_helpers::{extend_for_load, mem_resolve, mem_resolve_fetch, note_write, read_be, write_be};
use crate::mips_cpu::MipsCpu;
use crate::mts::MemOpKind;

pub struct MipsBus {
    cpu: *mut MipsCpu,
}

impl MipsBus {
    /// # Safety
    /// `cpu` must point to a live `MipsCpu` that outlives this `MipsBus`
    /// and is not otherwise mutably aliased while its `Bus` methods run.
    pub unsafe fn new(cpu: *mut MipsCpu) -> Self {
        Self { cpu }
    }
}

impl Bus for MipsBus {
    fn fetch(&mut self, pc: u64) -> CoreResult<u32> {
        let cpu = unsafe { &mut *self.cpu };
        let ptr = mem_resolve_fetch(cpu, pc).map_err(|kind| CoreError::GuestFault { pc, kind })?;
        Ok(unsafe { read_be(ptr, 4) as u32 })
    }

    fn load(&mut self, vaddr: u64, op: MemOpKind) -> Result<u64, GuestFaultKind> {
        let cpu = unsafe { &mut *self.cpu };
        let ptr = mem_resolve(cpu, vaddr, false)?;
        let raw = unsafe { read_be(ptr, op.size().max(1) as usize) };
        Ok(extend_for_load(op, raw))
    }

    fn store(&mut self, vaddr: u64, op: MemOpKind, val: u64) -> Result<(), GuestFaultKind> {
        let cpu = unsafe { &mut *self.cpu };
        let ptr = mem_resolve(cpu, vaddr, true)?;
        unsafe { write_be(ptr, op.size() as usize, val) };
        note_write(cpu, vaddr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mts::MtsBacking;

    #[test]
    fn bus_round_trips_a_store_through_a_load() {
        let mut ram = vec![0u8; 4096];
        let mut cpu = MipsCpu::new(0, 0, 0);
        cpu.bind_ram(ram.as_mut_ptr(), ram.len() as u64);
        cpu.mts.insert(
            0,
            MtsBacking::Ram {
                host_base: ram.as_mut_ptr(),
                writable: true,
            },
        );
        let mut bus = unsafe { MipsBus::new(&mut cpu) };
        bus.store(0x10, MemOpKind::Sw, 0xdead_beef).unwrap();
        let v = bus.load(0x10, MemOpKind::Lw).unwrap();
        assert_eq!(v as u32, 0xdead_beef);
    }
}
