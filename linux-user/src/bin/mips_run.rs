//! `mips-run` — loads a ROM/ELF boot image and runs it on the MIPS64
//! core, JIT-compiling TBs through the same lookup/translate/execute
//! dispatch loop as any other `tcg_exec::ExecEnv` consumer, aimed at
//! system-mode boot: no syscalls, no argv/envp/auxv stack, just a
//! reset vector and flat physical RAM.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;

use tcg_backend::X86_64CodeGen;
use tcg_core::context::Context;
use tcg_core::error::GuestFaultKind;
use tcg_core::jit_helpers::{fault_kind_tag, mem_resolve_fetch};
use tcg_core::mips_cpu::{MipsCpu, NUM_GPRS};
use tcg_core::{CoreConfig, TempIdx, Type};
use tcg_exec::exec_loop::{cpu_exec_loop, flush_and_retry, ExitReason};
use tcg_exec::{ExecEnv, GuestCpu};
use tcg_frontend::mips64::{MipsDisasContext, MipsTranslator, TranslateError};
use tcg_frontend::{DisasJumpType, TranslatorOps};
use tcg_linux_user::mips_loader::load_boot_image;

/// Loads a MIPS64 boot image (raw ROM or ELF) and runs it.
#[derive(Parser, Debug)]
#[command(name = "mips-run", about = "Run a MIPS64 boot image on the TCG core")]
struct Args {
    /// Path to a TOML config file (see `tcg_core::config::CoreConfig`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Boot image path; overrides `rom_path` from the config file.
    image: Option<PathBuf>,

    /// CPU identifier (for multi-core logging; execution itself is
    /// single-threaded here).
    #[arg(long, default_value_t = 0)]
    cpu_id: u32,

    /// CP0 PRid register value.
    #[arg(long, default_value_t = 0)]
    prid: u64,

    /// Stop after this many dispatch-loop iterations. Absent means run
    /// until killed, the normal mode for a boot image that never halts.
    #[arg(long)]
    max_iters: Option<u64>,

    /// Print execution statistics on exit.
    #[arg(long)]
    stats: bool,
}

/// Wraps `MipsCpu` with the `GuestCpu` glue the dispatch loop needs:
/// per-TB host-pointer resolution through the MTS (MIPS has no flat
/// linear guest address space the way RISC-V user-mode does), plus
/// self-modifying-code and idle-loop hooks.
struct MipsGuestCpu {
    cpu: MipsCpu,
    idle_pc: Option<u64>,
}

/// Binds `ctx`'s global temps either by running the real
/// `init_disas_context` (first TB ever, `ir` has no globals yet) or by
/// reconstructing the `TempIdx`s it would have assigned (every later
/// TB): `ir_ctx` is reused across the whole run, and re-registering
/// globals on a non-empty `Context` trips its own invariant assertion.
fn bind_globals(ir: &mut Context, pc: u64, guest_base: *const u8, max_insns: u32) -> MipsDisasContext {
    let mut d = MipsDisasContext::new(pc, guest_base);
    d.base.max_insns = max_insns;
    if ir.nb_globals() == 0 {
        MipsTranslator::init_disas_context(&mut d, ir);
    } else {
        d.env = TempIdx(0);
        for i in 0..NUM_GPRS {
            d.gpr[i] = TempIdx(1 + i as u32);
        }
        let base = 1 + NUM_GPRS as u32;
        d.hi = TempIdx(base);
        d.lo = TempIdx(base + 1);
        d.pc = TempIdx(base + 2);
        d.ll_bit = TempIdx(base + 3);
        d.fault_pending = TempIdx(base + 4);
    }
    d
}

/// Appends "set pc to `fail_pc`, raise `kind`, exit" to `ir`, using
/// `d`'s already-bound `env`/`pc` globals. Used both for a TB whose
/// very first instruction can't even be fetched and for a TB whose
/// translation failed partway through — in the latter case the valid
/// prefix already emitted stays in `ir`, so this is appended, not a
/// fresh block.
fn append_fault_tail(d: &MipsDisasContext, ir: &mut Context, fail_pc: u64, kind: GuestFaultKind) {
    let pc_const = ir.new_const(Type::I64, fail_pc);
    ir.gen_mov(Type::I64, d.pc, pc_const);
    let tag = ir.new_const(Type::I64, fault_kind_tag(kind));
    let dst = ir.new_temp(Type::I64);
    ir.gen_call(dst, tcg_core::jit_helpers::jit_helper_raise_fault as u64, &[d.env, tag]);
    ir.gen_discard(Type::I64, dst);
    ir.gen_exit_tb(0);
}

impl GuestCpu for MipsGuestCpu {
    fn get_pc(&self) -> u64 {
        self.cpu.pc
    }

    fn get_flags(&self) -> u32 {
        0
    }

    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32 {
        let guest_base = match mem_resolve_fetch(&mut self.cpu, pc) {
            Ok(ptr) => ptr,
            Err(kind) => {
                let d = bind_globals(ir, pc, std::ptr::null(), 1);
                append_fault_tail(&d, ir, pc, kind);
                return 4;
            }
        };

        let mut d = bind_globals(ir, pc, guest_base, max_insns);
        MipsTranslator::tb_start(&mut d, ir);
        loop {
            MipsTranslator::insn_start(&mut d, ir);
            MipsTranslator::translate_insn(&mut d, ir);
            if d.base.is_jmp != DisasJumpType::Next {
                break;
            }
            if d.base.num_insns >= d.base.max_insns {
                d.base.is_jmp = DisasJumpType::TooMany;
                break;
            }
        }
        MipsTranslator::tb_stop(&mut d, ir);

        if let Some(fail) = d.fail {
            let fail_pc = match fail {
                TranslateError::UnknownOpcode { pc, .. } => pc,
                TranslateError::InvalidDelaySlot { pc } => pc,
            };
            append_fault_tail(&d, ir, fail_pc, GuestFaultKind::ReservedInstruction);
        }
        d.base.num_insns * 4
    }

    fn env_ptr(&mut self) -> *mut u8 {
        &mut self.cpu as *mut MipsCpu as *mut u8
    }

    fn mark_code_page(&mut self, phys_pc: u64) {
        self.cpu.code_pages.insert(phys_pc);
    }

    fn take_smc_hit(&mut self) -> Option<u64> {
        self.cpu.smc_hit.take()
    }

    fn idle_pc(&self) -> Option<u64> {
        self.idle_pc
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            CoreConfig::from_toml_str(&s).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };
    if let Some(image) = &args.image {
        cfg.rom_path = Some(image.to_string_lossy().into_owned());
    }
    cfg.validate().context("invalid configuration")?;

    let image_path = cfg
        .rom_path
        .as_ref()
        .context("no boot image: pass one positionally or set rom_path in --config")?;

    let mut cpu = MipsCpu::new(args.cpu_id, args.prid, 0);
    let mut ram = Vec::new();
    let boot = load_boot_image(
        std::path::Path::new(image_path),
        cfg.ram_size,
        cfg.entry_pc,
        &mut cpu,
        &mut ram,
    )
    .with_context(|| format!("loading boot image {image_path}"))?;
    cpu.pc = boot.entry_pc;

    tracing::info!(
        entry_pc = cpu.pc,
        ram_size = cfg.ram_size,
        jit_enabled = cfg.jit_enabled,
        "booting"
    );

    let mut guest = MipsGuestCpu { cpu, idle_pc: cfg.idle_pc };
    let _timer = tcg_core::timer::TimerHandle::spawn(&guest.cpu, cfg.timer_freq_hz);

    if !cfg.jit_enabled {
        return run_interpreted(&mut guest, args.max_iters);
    }

    let mut env = ExecEnv::with_capacity(X86_64CodeGen::new(), Some(cfg.exec_arena_size));
    let mut iters: u64 = 0;
    loop {
        if let Some(max) = args.max_iters {
            if iters >= max {
                break;
            }
        }
        match unsafe { cpu_exec_loop(&mut env, &mut guest) } {
            ExitReason::BufferFull => {
                flush_and_retry(&mut env);
            }
            ExitReason::Exit(v) => {
                tracing::warn!(exit = v, pc = guest.get_pc(), "unexpected TB exit");
                break;
            }
        }
        iters += 1;
    }

    if args.stats {
        eprint!("{}", env.stats);
    }
    Ok(())
}

/// Runs without the JIT: every instruction goes through `Interp::step`.
/// Used when `jit_enabled = false`, e.g. for difftest parity checks
/// against the JIT path.
fn run_interpreted(guest: &mut MipsGuestCpu, max_iters: Option<u64>) -> anyhow::Result<()> {
    let mut bus = unsafe { tcg_core::bus::MipsBus::new(&mut guest.cpu as *mut MipsCpu) };
    let mut iters: u64 = 0;
    loop {
        if let Some(max) = max_iters {
            if iters >= max {
                break;
            }
        }
        if let Err(e) = tcg_core::interp::Interp::step(&mut guest.cpu, &mut bus) {
            tracing::error!(pc = guest.cpu.pc, %e, "interpreter halted");
            anyhow::bail!("interpreter halted: {e}");
        }
        iters += 1;
    }
    Ok(())
}
