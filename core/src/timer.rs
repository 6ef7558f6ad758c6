//! Background timer-IRQ thread.
//!
//! Ticks `MipsCpu::timer_irq_pending` at `timer_irq_freq` Hz so a guest
//! that never executes an instruction (stuck in a host-side wait, or
//! simply not scheduled yet) still accumulates virtual-count ticks; the
//! interpreter/JIT dispatch loop drains the counter into `Cp0::tick` on
//! its next iteration. Grounded in `mips64_timer_irq_run` (`mips64.c`):
//! same `interval`/`threshold` arithmetic and the same "stop counting,
//! bump drift" behavior when consumption falls too far behind.
//!
//! `mips64_timer_irq_run` also gates each tick on `cpu->state ==
//! MIPS_CPU_RUNNING` and `!cpu->irq_disable`, both read unguarded from
//! the timer thread. `MipsCpu::state` isn't atomic here, so instead of
//! reading it cross-thread this thread is gated purely by `running`
//! (set false, then joined, by `TimerHandle::drop`) — the dispatch loop
//! is expected to drop/stop the handle around any span where the CPU
//! isn't actually running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::mips_cpu::MipsCpu;

struct SendPtr(*const MipsCpu);
unsafe impl Send for SendPtr {}

/// Owns a running timer thread for one `MipsCpu`; dropping it stops and
/// joins the thread.
pub struct TimerHandle {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Spawns the timer thread for `cpu` at `freq_hz`. `cpu` must outlive
    /// the returned handle.
    pub fn spawn(cpu: &MipsCpu, freq_hz: u32) -> TimerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let ptr = SendPtr(cpu as *const MipsCpu);
        let interval = Duration::from_micros(1_000_000 / freq_hz.max(1) as u64);
        let threshold = freq_hz * 10;

        let join = std::thread::spawn(move || {
            let ptr = ptr;
            while running_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if !running_thread.load(Ordering::Acquire) {
                    break;
                }
                // SAFETY: `running` stays true only while the handle (and
                // therefore `cpu`) is alive; dropping the handle flips it
                // false and joins this thread before `cpu` can be freed.
                let cpu = unsafe { &*ptr.0 };
                let pending = cpu.timer_irq_pending.fetch_add(1, Ordering::AcqRel) + 1;
                if pending > threshold {
                    cpu.timer_irq_pending.store(0, Ordering::Release);
                    cpu.timer_drift.fetch_add(1, Ordering::Release);
                    tracing::warn!(cpu = cpu.id, "timer IRQ not accurate, pending tick count overran threshold");
                }
            }
        });

        TimerHandle { running, join: Some(join) }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering as O;

    #[test]
    fn timer_thread_advances_pending_count() {
        let cpu = MipsCpu::new(0, 0, 0);
        let handle = TimerHandle::spawn(&cpu, 1000); // 1ms interval
        std::thread::sleep(Duration::from_millis(50));
        drop(handle);
        assert!(cpu.timer_irq_pending.load(O::Acquire) > 0 || cpu.timer_drift.load(O::Acquire) > 0);
    }

    #[test]
    fn drop_stops_the_thread_promptly() {
        let cpu = MipsCpu::new(0, 0, 0);
        let handle = TimerHandle::spawn(&cpu, 100_000);
        drop(handle);
        // if the thread weren't actually joined, this read would race;
        // the join in Drop is what makes it safe to read cpu here at all.
        let _ = cpu.timer_irq_pending.load(O::Acquire);
    }
}
