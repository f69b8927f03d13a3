// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Machine controller: lifecycle, the run loop, the halt flag, hardware
//! breakpoints, and the inspection surface a debugger drives.

use crate::bus::SystemBus;
use crate::config::{LogLevel, MachineConfig};
use crate::cpu::{Cpu, Frame, Psr};
use crate::{Access, Console, EmuResult, IsaLevel, StopReason, Width, EXIT_ADDRESS};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const HW_BREAKPOINTS: usize = 4;

/// Clonable handle for requesting a halt from another thread while `run` is
/// executing. The run loop polls the flag at every instruction boundary.
#[derive(Debug, Clone)]
pub struct HaltHandle(Arc<AtomicBool>);

impl HaltHandle {
    pub fn halt(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// One emulated microcontroller.
#[derive(Debug)]
pub struct Machine {
    pub(crate) cpu: Cpu,
    pub(crate) bus: SystemBus,
    pub(crate) hwbreak: [u32; HW_BREAKPOINTS],
    pub(crate) halt: Arc<AtomicBool>,
    pub(crate) loglevel: LogLevel,
    pub(crate) isa: IsaLevel,
    pub(crate) last_sp: u32,
}

impl Machine {
    pub fn new(config: &MachineConfig, console: Box<dyn Console>) -> EmuResult<Self> {
        config.validate()?;
        Ok(Self {
            cpu: Cpu::new(),
            bus: SystemBus::new(config, console),
            hwbreak: [0; HW_BREAKPOINTS],
            halt: Arc::new(AtomicBool::new(false)),
            loglevel: config.loglevel,
            isa: config.isa,
            last_sp: 0,
        })
    }

    /// Copy a firmware blob into the start of flash. Bytes beyond the flash
    /// capacity are dropped; the tail keeps its previous (erased) content.
    pub fn load(&mut self, image: &[u8]) {
        self.bus.flash.load(image);
    }

    /// Reset per the vector table: SP from word 0, PC from word 1 (its low
    /// bit is the Thumb bit and stays set), LR to the exit sentinel.
    pub fn reset(&mut self) {
        let sp = self.bus.flash.read(0, Width::Word);
        let pc = self.bus.flash.read(4, Width::Word);
        self.cpu = Cpu::new();
        self.cpu.set_sp(sp);
        self.cpu.set_pc(pc | 1);
        self.cpu.set_lr(EXIT_ADDRESS);
        self.cpu.backtrace.reset(pc & !1, sp);
        self.last_sp = 0;
        if self.loglevel >= LogLevel::Calls {
            tracing::info!("RESET {:5x} (sp: {:x})", pc & !1, sp);
        }
    }

    /// Run until something interesting happens. `Break` pauses for an
    /// attached debugger; without one the caller treats it as fatal. On a
    /// fatal error the register state and backtrace are dumped before the
    /// error is returned.
    pub fn run(&mut self) -> EmuResult<StopReason> {
        loop {
            if self.halt.swap(false, Ordering::AcqRel) {
                return Ok(StopReason::Halt);
            }
            if self.loglevel >= LogLevel::Instrs
                || (self.loglevel >= LogLevel::CallsSp && self.cpu.sp() != self.last_sp)
            {
                self.last_sp = self.cpu.sp();
                self.log_registers();
            }
            match self.step() {
                Ok(StopReason::Step) => {}
                Ok(stop) => return Ok(stop),
                Err(err) => {
                    tracing::error!("{err}");
                    if self.loglevel < LogLevel::Instrs {
                        self.log_registers();
                    }
                    self.cpu
                        .backtrace
                        .mark(self.cpu.pc().wrapping_sub(1), self.cpu.sp());
                    self.dump_backtrace();
                    return Err(err);
                }
            }
        }
    }

    /// Request the run loop to stop at the next instruction boundary.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle(self.halt.clone())
    }

    /// Program one of the four hardware breakpoint slots; address 0
    /// disables the slot. Returns false for an out-of-range slot.
    pub fn set_breakpoint(&mut self, slot: usize, addr: u32) -> bool {
        match self.hwbreak.get_mut(slot) {
            Some(entry) => {
                *entry = addr;
                true
            }
            None => false,
        }
    }

    /// Read one register; out-of-range indices read as zero.
    pub fn read_register(&self, index: usize) -> u32 {
        if index < 16 {
            self.cpu.reg(index)
        } else {
            0
        }
    }

    /// Read the first `count` registers as little-endian bytes. The count
    /// is clamped to the number of registers.
    pub fn read_registers(&self, count: usize) -> Vec<u8> {
        let count = count.min(16);
        let mut buf = Vec::with_capacity(count * 4);
        for i in 0..count {
            buf.extend_from_slice(&self.cpu.reg(i).to_le_bytes());
        }
        buf
    }

    /// Read guest memory through the router, so peripheral side effects are
    /// observable. Word transfers are used when both the address and length
    /// are word-aligned, byte transfers otherwise.
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> EmuResult<()> {
        if addr & 3 == 0 && buf.len() % 4 == 0 {
            for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
                let word = self
                    .bus
                    .load(addr + 4 * i as u32, Width::Word, false)?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
        } else {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = self.bus.load(addr + i as u32, Width::Byte, false)? as u8;
            }
        }
        Ok(())
    }

    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> EmuResult<()> {
        for (i, byte) in data.iter().enumerate() {
            self.bus
                .store(addr + i as u32, *byte as u32, Width::Byte)?;
        }
        Ok(())
    }

    pub fn psr(&self) -> Psr {
        self.cpu.psr
    }

    pub fn backtrace(&self) -> &[Frame] {
        self.cpu.backtrace.frames()
    }

    pub fn loglevel(&self) -> LogLevel {
        self.loglevel
    }

    pub fn isa(&self) -> IsaLevel {
        self.isa
    }

    /// Direct router access for embedders and tests.
    pub fn bus_transfer(
        &mut self,
        addr: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        self.bus.transfer(addr, access, value, width, sign_extend)
    }

    /// Print the register snapshot and backtrace, as done for fatal stops.
    pub fn dump_diagnostics(&self) {
        self.log_registers();
        self.dump_backtrace();
    }

    pub(crate) fn log_registers(&self) {
        let mut line = String::from("[ ");
        for i in 0..8 {
            let _ = write!(line, "{:8x} ", self.cpu.reg(i));
        }
        let _ = write!(
            line,
            ".. {:8x} {:8x} {:8x} {} ]",
            self.cpu.sp(),
            self.cpu.lr().wrapping_sub(1),
            self.cpu.pc().wrapping_sub(1),
            self.cpu.psr,
        );
        tracing::info!("{line}");
    }

    pub(crate) fn dump_backtrace(&self) {
        tracing::error!("Backtrace:");
        for (i, frame) in self.cpu.backtrace.frames().iter().enumerate() {
            tracing::error!(" {:3}. {:8x} (sp: {:x})", i + 1, frame.pc, frame.sp);
        }
        if self.cpu.backtrace.depth() > self.cpu.backtrace.frames().len() {
            tracing::error!(" ... (too much recursion)");
        }
    }

    pub(crate) fn trace_call(&self, message: std::fmt::Arguments<'_>) {
        if self.loglevel >= LogLevel::Calls {
            let indent = self.cpu.backtrace.depth().min(40) * 2;
            tracing::info!("{}{}", " ".repeat(indent), message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferConsole;

    fn machine() -> Machine {
        Machine::new(
            &MachineConfig::default(),
            Box::new(BufferConsole::new(b"")),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_bad_configs() {
        let config = MachineConfig {
            flash_size: 16,
            ..Default::default()
        };
        assert!(Machine::new(&config, Box::new(BufferConsole::new(b""))).is_err());
    }

    #[test]
    fn reset_reads_the_vector_table() {
        let mut m = machine();
        let mut image = Vec::new();
        image.extend_from_slice(&0x2000_8000u32.to_le_bytes());
        image.extend_from_slice(&0x0000_0009u32.to_le_bytes());
        m.load(&image);
        m.reset();
        assert_eq!(m.read_register(13), 0x2000_8000);
        assert_eq!(m.read_register(15), 0x09);
        assert_eq!(m.read_register(14), crate::EXIT_ADDRESS);
        assert_eq!(m.backtrace().len(), 1);
    }

    #[test]
    fn breakpoint_slots_validate_their_index() {
        let mut m = machine();
        assert!(m.set_breakpoint(0, 0x100));
        assert!(m.set_breakpoint(3, 0x200));
        assert!(!m.set_breakpoint(4, 0x300));
    }

    #[test]
    fn read_registers_clamps_the_count() {
        let m = machine();
        assert_eq!(m.read_registers(64).len(), 16 * 4);
        assert_eq!(m.read_registers(2).len(), 8);
        assert_eq!(m.read_register(99), 0);
    }

    #[test]
    fn read_registers_is_stable_across_reads() {
        let mut m = machine();
        let mut image = Vec::new();
        image.extend_from_slice(&0x2000_8000u32.to_le_bytes());
        image.extend_from_slice(&0x0000_0009u32.to_le_bytes());
        m.load(&image);
        m.reset();
        let first = m.read_registers(16);
        let second = m.read_registers(16);
        assert_eq!(first, second);
    }

    #[test]
    fn read_memory_uses_the_router() {
        let console = BufferConsole::new(b"Q");
        let mut m = Machine::new(&MachineConfig::default(), Box::new(console)).unwrap();
        let mut buf = [0u8; 4];
        // A word-aligned read of the UART RXD register consumes host input.
        m.read_memory(0x4000_2518, &mut buf).unwrap();
        assert_eq!(buf, [0x51, 0, 0, 0]);
        // Unaligned reads fall back to byte transfers.
        let mut ram = [0u8; 3];
        m.write_memory(0x2000_0001, &[1, 2, 3]).unwrap();
        m.read_memory(0x2000_0001, &mut ram).unwrap();
        assert_eq!(ram, [1, 2, 3]);
    }
}
