// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Machine capacities and the knobs shared by the front ends.

use crate::{EmuError, EmuResult};
use std::str::FromStr;

/// Instruction-set profile. One decoder serves both; the level is consulted
/// where behavior diverges (IT blocks, CBZ/CBNZ, the 32-bit Thumb-2
/// families, unaligned memory access).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsaLevel {
    /// ARMv6-M: base Thumb plus BL.
    CortexM0,
    /// ARMv7E-M subset: IT blocks, CBZ/CBNZ, 32-bit Thumb-2, unaligned
    /// loads/stores to ordinary memory.
    #[default]
    CortexM4,
}

impl IsaLevel {
    pub fn allows_unaligned(self) -> bool {
        matches!(self, IsaLevel::CortexM4)
    }

    pub fn has_thumb2(self) -> bool {
        matches!(self, IsaLevel::CortexM4)
    }
}

impl FromStr for IsaLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cortex-m0" | "m0" | "nrf51" => Ok(Self::CortexM0),
            "cortex-m4" | "m4" | "nrf52" => Ok(Self::CortexM4),
            _ => Err(format!(
                "unsupported CPU '{}'; supported: cortex-m0, cortex-m4",
                value
            )),
        }
    }
}

/// Domain log levels, ordered; each level enables everything below it.
///
/// These gate the call/instruction traces the machine emits, independently
/// of whatever filtering the host's tracing subscriber applies. The level is
/// mutable at runtime through the magic BKPT hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Error,
    Warn,
    /// Branch/call/stack instructions, indented by call depth.
    Calls,
    /// Calls plus a register snapshot whenever SP moved.
    CallsSp,
    /// Register snapshot before every instruction.
    Instrs,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warn),
            "calls" => Ok(Self::Calls),
            "calls-sp" | "calls_sp" => Ok(Self::CallsSp),
            "instrs" => Ok(Self::Instrs),
            _ => Err(format!(
                "unsupported log level '{}'; supported: error, warning, calls, calls-sp, instrs",
                value
            )),
        }
    }
}

/// Capacities and profile a machine is created with.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Flash size in bytes.
    pub flash_size: usize,
    /// Flash erase granularity in bytes; must be a power of two.
    pub pagesize: usize,
    /// SRAM size in bytes.
    pub ram_size: usize,
    pub isa: IsaLevel,
    pub loglevel: LogLevel,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            flash_size: 256 * 1024,
            pagesize: 1024,
            ram_size: 32 * 1024,
            isa: IsaLevel::default(),
            loglevel: LogLevel::default(),
        }
    }
}

impl MachineConfig {
    /// At minimum the flash must hold the vector table.
    pub const MIN_FLASH: usize = 64;

    pub fn validate(&self) -> EmuResult<()> {
        if self.flash_size < Self::MIN_FLASH {
            return Err(EmuError::Config(format!(
                "flash size {} is below the {}-byte minimum",
                self.flash_size,
                Self::MIN_FLASH
            )));
        }
        if self.pagesize == 0 || !self.pagesize.is_power_of_two() {
            return Err(EmuError::Config(format!(
                "flash page size {} is not a power of two",
                self.pagesize
            )));
        }
        if self.pagesize > self.flash_size {
            return Err(EmuError::Config(format!(
                "flash page size {} exceeds the flash size {}",
                self.pagesize, self.flash_size
            )));
        }
        if self.ram_size == 0 {
            return Err(EmuError::Config("RAM size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MachineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_flash() {
        let config = MachineConfig {
            flash_size: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_pagesize() {
        let config = MachineConfig {
            pagesize: 768,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Calls);
        assert!(LogLevel::Calls < LogLevel::CallsSp);
        assert!(LogLevel::CallsSp < LogLevel::Instrs);
    }

    #[test]
    fn parses_isa_names() {
        assert_eq!("nrf51".parse::<IsaLevel>().unwrap(), IsaLevel::CortexM0);
        assert_eq!("cortex-m4".parse::<IsaLevel>().unwrap(), IsaLevel::CortexM4);
        assert!("cortex-m7".parse::<IsaLevel>().is_err());
    }
}
