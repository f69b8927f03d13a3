// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Memory-mapped peripheral models.
//!
//! Only what simple firmware needs: UART character I/O, an RNG byte source,
//! and the NVIC priority registers as plain storage. The NVMC lives in the
//! bus because it mutates the flash array directly.

pub mod nvic;
pub mod rng;
pub mod uart;

pub use nvic::Nvic;
pub use rng::Rng;
pub use uart::Uart;
