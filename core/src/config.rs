//! Runtime configuration for a MIPS64 CPU instance.
//!
//! Deserialized from a TOML file (or built programmatically) the way a
//! router's `.conf`/platform descriptor configures a Cisco IOS image:
//! RAM size, boot ROM, entry point, and JIT tuning knobs all live here
//! instead of scattered constants.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default clock divisor applied to the virtual Count register
/// (dynamips default: every 4th cycle increments Count).
pub const DEFAULT_CLOCK_DIVISOR: u32 = 4;

/// Default timer IRQ frequency in Hz.
pub const DEFAULT_TIMER_FREQ_HZ: u32 = 250;

/// Default size of the JIT executable code arena, in bytes.
pub const DEFAULT_EXEC_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Default number of translated blocks a physical page may own before
/// the TCB manager forces a flush of that page's bucket.
pub const DEFAULT_MAX_TCB_PER_PAGE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    /// Guest RAM size in bytes.
    pub ram_size: u64,
    /// Path to a ROM image loaded at the reset vector, if any.
    pub rom_path: Option<String>,
    /// Initial PC on reset.
    pub entry_pc: u64,
    /// PC of the platform idle loop, used for idle-skip CPU throttling.
    pub idle_pc: Option<u64>,
    /// Enable the JIT; when false, every TB is interpreted.
    pub jit_enabled: bool,
    /// Cycles per Count-register tick.
    pub clock_divisor: u32,
    /// Timer interrupt frequency, in Hz.
    pub timer_freq_hz: u32,
    /// Size of the executable code arena, in bytes.
    pub exec_arena_size: usize,
    /// Max TCBs per physical page before a forced page flush.
    pub max_tcb_per_page: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ram_size: 256 * 1024 * 1024,
            rom_path: None,
            entry_pc: 0xFFFF_FFFF_BFC0_0000, // MIPS64 reset vector
            idle_pc: None,
            jit_enabled: true,
            clock_divisor: DEFAULT_CLOCK_DIVISOR,
            timer_freq_hz: DEFAULT_TIMER_FREQ_HZ,
            exec_arena_size: DEFAULT_EXEC_ARENA_SIZE,
            max_tcb_per_page: DEFAULT_MAX_TCB_PER_PAGE,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        toml::from_str(s).map_err(|e| CoreError::BadConfig(e.to_string()))
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.ram_size == 0 {
            return Err(CoreError::BadConfig("ram_size must be non-zero".into()));
        }
        if self.clock_divisor == 0 {
            return Err(CoreError::BadConfig(
                "clock_divisor must be non-zero".into(),
            ));
        }
        if self.exec_arena_size < 4096 {
            return Err(CoreError::BadConfig(
                "exec_arena_size too small".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = CoreConfig::from_toml_str(
            r#"
            ram_size = 134217728
            entry_pc = 0xbfc00000
            jit_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ram_size, 128 * 1024 * 1024);
        assert!(!cfg.jit_enabled);
        assert_eq!(cfg.clock_divisor, DEFAULT_CLOCK_DIVISOR);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = CoreConfig::from_toml_str("bogus_field = 1").unwrap_err();
        assert!(matches!(err, CoreError::BadConfig(_)));
    }
}
