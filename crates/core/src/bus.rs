// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Address-Space Router.
//!
//! One entry point, [`SystemBus::transfer`], maps a 32-bit guest address to
//! flash, SRAM, a peripheral handler, or the private peripheral bus, and
//! enforces alignment and writability on the way. The region is the top
//! three address bits:
//!
//! | bits  | range                       | target |
//! |-------|-----------------------------|--------|
//! | `000` | 0x0000_0000 - 0x1fff_ffff   | flash  |
//! | `001` | 0x2000_0000 - 0x3fff_ffff   | SRAM   |
//! | `010` | 0x4000_0000 - 0x5fff_ffff   | peripherals |
//! | `111` | 0xe000_0000 - 0xffff_ffff   | private peripheral bus |
//!
//! Everything else faults. Rejections are logged here with their cause;
//! callers only see the error value.

use crate::config::{IsaLevel, MachineConfig};
use crate::memory::{Flash, Ram};
use crate::peripherals::{Nvic, Rng, Uart};
use crate::{Access, Console, EmuError, EmuResult, Width};

const REGION_SHIFT: u32 = 29;
const REGION_MASK: u32 = (1 << REGION_SHIFT) - 1;

const UART_BASE: u32 = 0x4000_2000;
const RNG_BASE: u32 = 0x4000_d000;
const NVMC_BASE: u32 = 0x4001_e000;

const NVMC_READY: u32 = 0x400;
const NVMC_CONFIG: u32 = 0x504;
const NVMC_ERASEPAGE: u32 = 0x508;

const NVIC_ISER: u32 = 0xe000_e100;
const NVIC_ICER: u32 = 0xe000_e180;
const NVIC_IP_FIRST: u32 = 0xe000_e400;
const NVIC_IP_LAST: u32 = 0xe000_e41f;
const DEVICE_ID_FIRST: u32 = 0xf000_0fe0;
const DEVICE_ID_LAST: u32 = 0xf000_0fef;

pub struct SystemBus {
    pub flash: Flash,
    pub ram: Ram,
    pub uart: Uart,
    pub rng: Rng,
    pub nvic: Nvic,
    isa: IsaLevel,
}

impl std::fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemBus")
            .field("flash", &self.flash.len())
            .field("ram", &self.ram.len())
            .field("isa", &self.isa)
            .finish_non_exhaustive()
    }
}

impl SystemBus {
    pub fn new(config: &MachineConfig, console: Box<dyn Console>) -> Self {
        Self {
            flash: Flash::new(config.flash_size, config.pagesize),
            ram: Ram::new(config.ram_size),
            uart: Uart::new(console),
            rng: Rng::new(),
            nvic: Nvic::new(),
            isa: config.isa,
        }
    }

    /// Route one transfer. On a load the result lands in `*value`,
    /// sign-extended from `width` when `sign_extend` is set; on a store the
    /// low `width` bits of `*value` are written.
    pub fn transfer(
        &mut self,
        addr: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        let region = addr >> REGION_SHIFT;
        let offset = addr & REGION_MASK;
        match region {
            0b000 => self.flash_transfer(addr, offset, access, value, width, sign_extend),
            0b001 => self.ram_transfer(addr, offset, access, value, width, sign_extend),
            0b010 => self.peripheral_transfer(addr, access, value, width, sign_extend),
            0b111 => self.ppb_transfer(addr, access, value, width, sign_extend),
            _ => Err(self.reject(EmuError::Unmapped { access, addr })),
        }
    }

    pub fn load(&mut self, addr: u32, width: Width, sign_extend: bool) -> EmuResult<u32> {
        let mut value = 0;
        self.transfer(addr, Access::Load, &mut value, width, sign_extend)?;
        Ok(value)
    }

    pub fn load_word(&mut self, addr: u32) -> EmuResult<u32> {
        self.load(addr, Width::Word, false)
    }

    pub fn store(&mut self, addr: u32, value: u32, width: Width) -> EmuResult<()> {
        let mut value = value;
        self.transfer(addr, Access::Store, &mut value, width, false)
    }

    pub fn store_word(&mut self, addr: u32, value: u32) -> EmuResult<()> {
        self.store(addr, value, Width::Word)
    }

    fn reject(&self, err: EmuError) -> EmuError {
        tracing::error!("{err}");
        err
    }

    /// Alignment for ordinary memory. The extended profile reads and writes
    /// RAM and flash at any alignment; the base profile faults.
    fn check_memory_alignment(&self, addr: u32, access: Access, width: Width) -> EmuResult<()> {
        if self.isa.allows_unaligned() {
            return Ok(());
        }
        let misaligned = match width {
            Width::Byte => false,
            Width::Half => addr & 1 != 0,
            Width::Word => addr & 3 != 0,
        };
        if misaligned {
            Err(self.reject(EmuError::Unaligned { access, addr }))
        } else {
            Ok(())
        }
    }

    fn extend(value: u32, width: Width, sign_extend: bool) -> u32 {
        let value = value & width.mask();
        if !sign_extend {
            return value;
        }
        match width {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Half => value as u16 as i16 as i32 as u32,
            Width::Word => value,
        }
    }

    fn flash_transfer(
        &mut self,
        addr: u32,
        offset: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        if offset as usize + width.bytes() as usize > self.flash.len() {
            return Err(self.reject(EmuError::Unmapped { access, addr }));
        }
        match access {
            Access::Load => {
                self.check_memory_alignment(addr, access, width)?;
                *value = Self::extend(self.flash.read(offset as usize, width), width, sign_extend);
                Ok(())
            }
            Access::Store => {
                // NOR flash programming: enabled by NVMC.CONFIG, whole words
                // only, and stores can only clear bits.
                if !self.flash.is_writable() {
                    return Err(self.reject(EmuError::FlashStore {
                        addr,
                        reason: "flash is write-protected",
                    }));
                }
                if width != Width::Word {
                    return Err(self.reject(EmuError::FlashStore {
                        addr,
                        reason: "only word-wide programming is supported",
                    }));
                }
                if addr & 3 != 0 {
                    return Err(self.reject(EmuError::FlashStore {
                        addr,
                        reason: "store is not word-aligned",
                    }));
                }
                self.flash.program_word(offset as usize, *value);
                Ok(())
            }
        }
    }

    fn ram_transfer(
        &mut self,
        addr: u32,
        offset: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        if offset as usize + width.bytes() as usize > self.ram.len() {
            return Err(self.reject(EmuError::Unmapped { access, addr }));
        }
        self.check_memory_alignment(addr, access, width)?;
        match access {
            Access::Load => {
                *value = Self::extend(self.ram.read(offset as usize, width), width, sign_extend);
            }
            Access::Store => self.ram.write(offset as usize, *value, width),
        }
        Ok(())
    }

    fn peripheral_transfer(
        &mut self,
        addr: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        if addr & 3 != 0 {
            return Err(self.reject(EmuError::Unaligned { access, addr }));
        }
        let block = addr & 0xffff_f000;
        let offset = addr & 0xfff;
        let handled = match (block, access) {
            (UART_BASE, Access::Load) => self.uart.load(offset).map(|v| *value = v),
            (UART_BASE, Access::Store) => self.uart.store(offset, *value),
            (RNG_BASE, Access::Load) => self.rng.load(offset).map(|v| *value = v),
            (NVMC_BASE, _) => self.nvmc_transfer(offset, access, value)?,
            _ => None,
        };
        if handled.is_none() {
            // Unknown peripheral registers are tolerated: loads read zero,
            // stores are dropped.
            tracing::warn!(
                "unknown {access} peripheral address {addr:#010x} (value {:#x})",
                *value
            );
            if access == Access::Load {
                *value = 0;
            }
        }
        if access == Access::Load {
            *value = Self::extend(*value, width, sign_extend);
        }
        Ok(())
    }

    /// NVMC lives next to the flash array it controls.
    fn nvmc_transfer(
        &mut self,
        offset: u32,
        access: Access,
        value: &mut u32,
    ) -> EmuResult<Option<()>> {
        match (offset, access) {
            (NVMC_READY, Access::Load) => {
                *value = 1;
                Ok(Some(()))
            }
            (NVMC_CONFIG, Access::Store) => {
                self.flash.set_writable(*value != 0);
                Ok(Some(()))
            }
            (NVMC_ERASEPAGE, Access::Store) => {
                let target = *value;
                let pagesize = self.flash.pagesize() as u32;
                if target % pagesize != 0 || target as usize >= self.flash.len() {
                    return Err(self.reject(EmuError::ErasePage { value: target }));
                }
                tracing::debug!("erasing flash page at {target:#x}");
                self.flash.erase_page(target as usize);
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    /// Private peripheral bus plus the device-identification window. Only
    /// specific addresses exist; anything else faults.
    fn ppb_transfer(
        &mut self,
        addr: u32,
        access: Access,
        value: &mut u32,
        width: Width,
        sign_extend: bool,
    ) -> EmuResult<()> {
        if addr & 3 != 0 {
            return Err(self.reject(EmuError::Unaligned { access, addr }));
        }
        match (addr, access) {
            (NVIC_ISER, Access::Store) => {
                tracing::debug!("NVIC set-enable write: {:#010x}", *value);
                Ok(())
            }
            (NVIC_ICER, Access::Store) => {
                tracing::debug!("NVIC clear-enable write: {:#010x}", *value);
                Ok(())
            }
            (NVIC_IP_FIRST..=NVIC_IP_LAST, Access::Load) => {
                *value = Self::extend(self.nvic.ip_load(addr), width, sign_extend);
                Ok(())
            }
            (NVIC_IP_FIRST..=NVIC_IP_LAST, Access::Store) => {
                let current = self.nvic.ip_load(addr);
                let merged = (current & !width.mask()) | (*value & width.mask());
                self.nvic.ip_store(addr, merged);
                Ok(())
            }
            (DEVICE_ID_FIRST..=DEVICE_ID_LAST, Access::Load) => {
                // Device-identification probe; reads as zero.
                *value = 0;
                Ok(())
            }
            _ => Err(self.reject(EmuError::Unmapped { access, addr })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferConsole;

    fn bus_with(config: MachineConfig, console: BufferConsole) -> SystemBus {
        SystemBus::new(&config, Box::new(console))
    }

    fn bus() -> SystemBus {
        bus_with(MachineConfig::default(), BufferConsole::new(b""))
    }

    #[test]
    fn routes_by_region() {
        let mut bus = bus();
        assert!(bus.load_word(0x0000_0000).is_ok());
        assert!(bus.store_word(0x2000_0000, 5).is_ok());
        assert!(bus.load_word(0x4000_d100).is_ok());
        assert!(matches!(
            bus.load_word(0x6000_0000),
            Err(EmuError::Unmapped { .. })
        ));
        assert!(matches!(
            bus.load_word(0x8000_0000),
            Err(EmuError::Unmapped { .. })
        ));
    }

    #[test]
    fn protected_flash_rejects_stores_and_stays_intact() {
        let mut bus = bus();
        let before: Vec<u8> = bus.flash.bytes().to_vec();
        assert!(matches!(
            bus.store_word(0x100, 0),
            Err(EmuError::FlashStore { .. })
        ));
        assert_eq!(bus.flash.bytes(), &before[..]);
    }

    #[test]
    fn nvmc_config_gates_programming() {
        let mut bus = bus();
        bus.store_word(0x4001_e504, 1).unwrap();
        bus.store_word(0x100, 0x1234_5678).unwrap();
        assert_eq!(bus.load_word(0x100).unwrap(), 0x1234_5678);
        // Programming is AND-only.
        bus.store_word(0x100, 0xff00_ffff).unwrap();
        assert_eq!(bus.load_word(0x100).unwrap(), 0x1200_5678);
        // Closing the latch protects the array again.
        bus.store_word(0x4001_e504, 0).unwrap();
        assert!(bus.store_word(0x100, 0).is_err());
    }

    #[test]
    fn flash_stores_must_be_whole_aligned_words() {
        let mut bus = bus();
        bus.store_word(0x4001_e504, 1).unwrap();
        assert!(matches!(
            bus.store(0x100, 0, Width::Half),
            Err(EmuError::FlashStore { .. })
        ));
        assert!(matches!(
            bus.store_word(0x102, 0),
            Err(EmuError::FlashStore { .. })
        ));
    }

    #[test]
    fn erasepage_validates_and_erases_one_page() {
        let mut bus = bus();
        bus.store_word(0x4001_e504, 1).unwrap();
        bus.store_word(0x400, 0).unwrap();
        bus.store_word(0x7fc, 0).unwrap();
        bus.store_word(0x800, 0).unwrap();
        bus.store_word(0x4001_e508, 0x400).unwrap();
        assert_eq!(bus.load_word(0x400).unwrap(), 0xffff_ffff);
        assert_eq!(bus.load_word(0x7fc).unwrap(), 0xffff_ffff);
        assert_eq!(bus.load_word(0x800).unwrap(), 0);
        // Misaligned or out-of-range targets are rejected.
        assert!(bus.store_word(0x4001_e508, 0x401).is_err());
        assert!(bus.store_word(0x4001_e508, 0x4000_0000).is_err());
    }

    #[test]
    fn base_profile_faults_on_unaligned_ram() {
        let config = MachineConfig {
            isa: IsaLevel::CortexM0,
            ..Default::default()
        };
        let mut bus = bus_with(config, BufferConsole::new(b""));
        assert!(matches!(
            bus.load(0x2000_0001, Width::Half, false),
            Err(EmuError::Unaligned { .. })
        ));
        assert!(matches!(
            bus.store_word(0x2000_0002, 1),
            Err(EmuError::Unaligned { .. })
        ));
    }

    #[test]
    fn extended_profile_permits_unaligned_memory() {
        let mut bus = bus();
        bus.store_word(0x2000_0000, 0x1122_3344).unwrap();
        bus.store_word(0x2000_0004, 0x5566_7788).unwrap();
        assert_eq!(bus.load(0x2000_0002, Width::Word, false).unwrap(), 0x7788_1122);
        bus.store(0x2000_0001, 0xaa, Width::Byte).unwrap();
        assert_eq!(bus.load_word(0x2000_0000).unwrap(), 0x1122_aa44);
    }

    #[test]
    fn sign_extension_happens_in_the_router() {
        let mut bus = bus();
        bus.store(0x2000_0000, 0x80, Width::Byte).unwrap();
        assert_eq!(
            bus.load(0x2000_0000, Width::Byte, true).unwrap(),
            0xffff_ff80
        );
        bus.store(0x2000_0010, 0x8001, Width::Half).unwrap();
        assert_eq!(
            bus.load(0x2000_0010, Width::Half, true).unwrap(),
            0xffff_8001
        );
        assert_eq!(bus.load(0x2000_0010, Width::Half, false).unwrap(), 0x8001);
    }

    #[test]
    fn uart_registers_reach_the_console() {
        let console = BufferConsole::new(b"Z");
        let output = console.output_handle();
        let mut bus = bus_with(MachineConfig::default(), console);
        assert_eq!(bus.load_word(0x4000_2518).unwrap(), 0x5a);
        assert_eq!(bus.load_word(0x4000_2518).unwrap(), u32::MAX);
        bus.store_word(0x4000_251c, 0x5a).unwrap();
        assert_eq!(*output.lock().unwrap(), vec![0x5a]);
        // Task registers acknowledge silently.
        bus.store_word(0x4000_2000, 1).unwrap();
        assert_eq!(bus.load_word(0x4000_2108).unwrap(), 1);
    }

    #[test]
    fn unknown_peripheral_addresses_are_tolerated() {
        let mut bus = bus();
        assert_eq!(bus.load_word(0x4000_1000).unwrap(), 0);
        bus.store_word(0x4000_1000, 0xdead).unwrap();
    }

    #[test]
    fn peripheral_region_requires_word_alignment() {
        let mut bus = bus();
        assert!(matches!(
            bus.load_word(0x4000_2002),
            Err(EmuError::Unaligned { .. })
        ));
    }

    #[test]
    fn rng_is_always_ready() {
        let mut bus = bus();
        assert_eq!(bus.load_word(0x4000_d100).unwrap(), 1);
        assert!(bus.load_word(0x4000_d508).unwrap() <= 0xff);
    }

    #[test]
    fn ppb_handles_only_known_addresses() {
        let mut bus = bus();
        bus.store_word(0xe000_e100, 0xffff_ffff).unwrap();
        bus.store_word(0xe000_e180, 0xffff_ffff).unwrap();
        // The enable registers are write-only here.
        assert!(bus.load_word(0xe000_e100).is_err());
        bus.store_word(0xe000_e404, 0x40).unwrap();
        assert_eq!(bus.load_word(0xe000_e404).unwrap(), 0x40);
        assert_eq!(bus.load_word(0xf000_0fe0).unwrap(), 0);
        assert_eq!(bus.load_word(0xf000_0fec).unwrap(), 0);
        assert!(bus.load_word(0xf000_0fd0).is_err());
        assert!(bus.load_word(0xe000_0000).is_err());
    }
}
