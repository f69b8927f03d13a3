// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! RNG peripheral: a value-ready flag that is always ready and a register
//! that produces one pseudo-random byte per read.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

const EVENT_VALRDY: u32 = 0x100;
const VALUE: u32 = 0x508;

#[derive(Debug)]
pub struct Rng {
    generator: StdRng,
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng {
    pub fn new() -> Self {
        Self {
            generator: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for reproducible runs and tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            generator: StdRng::seed_from_u64(seed),
        }
    }

    pub fn load(&mut self, offset: u32) -> Option<u32> {
        match offset {
            EVENT_VALRDY => Some(1),
            VALUE => Some(self.generator.gen::<u8>() as u32),
            _ => None,
        }
    }
}
