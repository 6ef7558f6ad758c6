pub mod context;
pub mod dump;
pub mod ir_builder;
pub mod label;
pub mod op;
pub mod opcode;
pub mod tb;
pub mod temp;
pub mod types;

pub mod bus;
pub mod config;
pub mod cp0;
pub mod error;
pub mod exception;
pub mod ilt;
pub mod interp;
pub mod jit_helpers;
pub mod mips_cpu;
pub mod mts;
pub mod save_state;
pub mod timer;

pub use context::Context;
pub use label::{Label, LabelUse, RelocKind};
pub use op::{LifeData, Op, OpIdx, MAX_OP_ARGS};
pub use opcode::{OpDef, OpFlags, Opcode, OPCODE_DEFS};
pub use tb::{JumpCache, TranslationBlock, TB_HASH_SIZE, TB_JMP_CACHE_SIZE};
pub use temp::{Temp, TempIdx, TempKind};
pub use types::{Cond, MemOp, RegSet, TempVal, Type};

pub use config::CoreConfig;
pub use cp0::Cp0;
pub use error::{CoreError, CoreResult, GuestFaultKind};
pub use exception::deliver_exception;
pub use ilt::{decode as ilt_decode, decode_fields, Fields, IltEntry, OpKind};
pub use interp::{Bus, Interp, StepOutcome};
pub use mips_cpu::{CpuState, ExecStats, MipsCpu};
pub use mts::Mts;
pub use save_state::{cpu_restore_state, cpu_save_state};
pub use timer::TimerHandle;
