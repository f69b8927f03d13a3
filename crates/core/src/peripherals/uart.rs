// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! nRF51-style UART register block bridged to the host console.

use crate::Console;

// Register offsets from the 0x4000_2000 base.
const TASK_STARTRX: u32 = 0x000;
const TASK_STOPRX: u32 = 0x004;
const TASK_STARTTX: u32 = 0x008;
const TASK_STOPTX: u32 = 0x00c;
const EVENT_RXDRDY: u32 = 0x108;
const EVENT_TXDRDY: u32 = 0x11c;
const EVENT_ERROR: u32 = 0x124;
const EVENT_RXTO: u32 = 0x144;
const RXD: u32 = 0x518;
const TXD: u32 = 0x51c;

/// The UART is always ready: RXDRDY/TXDRDY read as 1, the task registers
/// acknowledge without keeping state, and RXD/TXD go straight to the host
/// byte source/sink.
pub struct Uart {
    console: Box<dyn Console>,
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart").finish_non_exhaustive()
    }
}

impl Uart {
    pub fn new(console: Box<dyn Console>) -> Self {
        Self { console }
    }

    /// `None` means the offset is not a readable UART register.
    pub fn load(&mut self, offset: u32) -> Option<u32> {
        match offset {
            EVENT_RXDRDY | EVENT_TXDRDY => Some(1),
            EVENT_ERROR | EVENT_RXTO => Some(0),
            // Blocks on the host; end of input reads as -1.
            RXD => Some(self.console.getc().map_or(u32::MAX, u32::from)),
            _ => None,
        }
    }

    /// `None` means the offset is not a writable UART register.
    pub fn store(&mut self, offset: u32, value: u32) -> Option<()> {
        match offset {
            TASK_STARTRX | TASK_STOPRX | TASK_STARTTX | TASK_STOPTX => Some(()),
            // Event registers accept writes (firmware clears them).
            EVENT_RXDRDY | EVENT_TXDRDY | EVENT_ERROR | EVENT_RXTO => Some(()),
            TXD => {
                self.console.putc(value as u8);
                Some(())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferConsole;

    #[test]
    fn rxd_drains_the_console_then_reads_minus_one() {
        let console = BufferConsole::new(b"A");
        let mut uart = Uart::new(Box::new(console));
        assert_eq!(uart.load(RXD), Some(0x41));
        assert_eq!(uart.load(RXD), Some(u32::MAX));
    }

    #[test]
    fn txd_reaches_the_sink_once() {
        let console = BufferConsole::new(b"");
        let output = console.output_handle();
        let mut uart = Uart::new(Box::new(console));
        uart.store(TXD, 0x141).unwrap(); // only the low byte goes out
        assert_eq!(*output.lock().unwrap(), vec![0x41]);
    }

    #[test]
    fn status_events_read_ready() {
        let mut uart = Uart::new(Box::new(BufferConsole::new(b"")));
        assert_eq!(uart.load(EVENT_RXDRDY), Some(1));
        assert_eq!(uart.load(EVENT_TXDRDY), Some(1));
        assert_eq!(uart.load(EVENT_ERROR), Some(0));
        assert_eq!(uart.load(0x700), None);
    }
}
