// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Instruction-level emulator core for Cortex-M class microcontrollers.
//!
//! Models a Nordic nRF51/nRF52-style device: a NOR flash region at
//! `0x0000_0000`, SRAM at `0x2000_0000`, and a minimal set of memory-mapped
//! peripherals (UART, RNG, NVMC, NVIC priority registers). Firmware is a raw
//! binary blob whose first two words are the initial stack pointer and the
//! reset vector. Execution runs until the program branches to the exit
//! sentinel, hits a breakpoint, executes an undefined encoding, or faults on
//! a memory access.
//!
//! The crate exposes a debugger-shaped control surface on [`Machine`]:
//! halt/step/run, four hardware breakpoints, and register/memory inspection.
//! Wire protocols (GDB RSP and the like) and the command-line front end sit
//! on top of that surface in other crates.

pub mod alu;
pub mod bus;
pub mod config;
pub mod cpu;
pub mod decoder;
mod exec;
pub mod machine;
pub mod memory;
pub mod peripherals;

pub use config::{IsaLevel, LogLevel, MachineConfig};
pub use machine::{HaltHandle, Machine};

use std::fmt;

/// The value placed in LR at reset. A branch here means the top-level
/// function returned and the emulation is over.
pub const EXIT_ADDRESS: u32 = 0xdead_beef;

/// Upper bound on recorded backtrace frames. Deeper call chains keep
/// executing, they just stop being recorded.
pub const BACKTRACE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Load => f.write_str("load"),
            Access::Store => f.write_str("store"),
        }
    }
}

/// Transfer width on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Half => 0xffff,
            Width::Word => 0xffff_ffff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmuError {
    #[error("invalid {access} address {addr:#010x}")]
    Unmapped { access: Access, addr: u32 },
    #[error("unaligned {access} address {addr:#010x}")]
    Unaligned { access: Access, addr: u32 },
    #[error("flash store rejected at {addr:#010x}: {reason}")]
    FlashStore { addr: u32, reason: &'static str },
    #[error("invalid flash erase target {value:#010x}")]
    ErasePage { value: u32 },
    #[error("PC address out of range or misaligned: {pc:#010x}")]
    InvalidPc { pc: u32 },
    #[error("undefined instruction {opcode:#06x} at {pc:#x}")]
    Undefined { opcode: u32, pc: u32 },
    #[error("division by zero at {pc:#x}")]
    DivideByZero { pc: u32 },
    #[error("invalid machine configuration: {0}")]
    Config(String),
}

pub type EmuResult<T> = Result<T, EmuError>;

/// Why `step`/`run` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// One instruction executed; nothing noteworthy.
    Step,
    /// PC reached the exit sentinel.
    Exit,
    /// The halt flag was observed at the top of the run loop.
    Halt,
    /// A hardware breakpoint address or a BKPT instruction was hit.
    Break,
}

/// Byte-oriented host console behind the emulated UART.
///
/// `getc` may block on the host; it returns `None` at end of input, which
/// firmware observes as `0xffff_ffff` in the RXD register.
pub trait Console: Send {
    fn getc(&mut self) -> Option<u8>;
    fn putc(&mut self, byte: u8);
}

/// A console that reads nothing and discards output.
#[derive(Debug, Default)]
pub struct NullConsole;

impl Console for NullConsole {
    fn getc(&mut self) -> Option<u8> {
        None
    }

    fn putc(&mut self, _byte: u8) {}
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Scripted console for tests and embedders: input comes from a fixed byte
/// sequence, output is captured into a shared buffer.
#[derive(Debug)]
pub struct BufferConsole {
    input: VecDeque<u8>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl BufferConsole {
    pub fn new(input: &[u8]) -> Self {
        Self {
            input: input.iter().copied().collect(),
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto the captured output, valid after the console has been
    /// handed to a machine.
    pub fn output_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        self.output.clone()
    }
}

impl Console for BufferConsole {
    fn getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn putc(&mut self, byte: u8) {
        if let Ok(mut guard) = self.output.lock() {
            guard.push(byte);
        }
    }
}
