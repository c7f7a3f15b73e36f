//! Deterministic pseudo-random numbers.
//!
//! Test data, block choices and command handles all come from a 48-bit linear
//! congruential generator (the `drand48` family) seeded with a fixed value, so a
//! data-corruption failure reproduces identically on the next run. It is not
//! cryptographically secure and must not be used where that matters.
//!
//! Each consumer owns its own generator; nothing is shared between sessions.

use rand::RngCore;

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const INCREMENT: u64 = 0xB;
const MASK: u64 = (1 << 48) - 1;

/// Seed used when no explicit seed is given.
pub const DEFAULT_SEED: u32 = 1;

/// 48-bit LCG compatible with `srand48`/`lrand48`/`drand48`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lrand48 {
    state: u64,
}

impl Default for Lrand48 {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl Lrand48 {
    /// Seeds the generator the way `srand48(seed)` does.
    pub fn new(seed: u32) -> Self {
        Self {
            state: ((seed as u64) << 16) | 0x330E,
        }
    }

    fn step(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT) & MASK;
        self.state
    }

    /// Non-negative 31-bit value.
    pub fn lrand48(&mut self) -> u32 {
        (self.step() >> 17) as u32
    }

    /// Uniform value in `[0, 1)`.
    pub fn drand48(&mut self) -> f64 {
        self.step() as f64 / (1u64 << 48) as f64
    }

    /// Block number in `[0, n_blocks)`, built from two draws.
    ///
    /// # Panics
    /// If `n_blocks` is zero.
    pub fn block_index(&mut self, n_blocks: u64) -> u64 {
        let high = (self.lrand48() as u64) << 32;
        let value = high | self.lrand48() as u64;
        value % n_blocks
    }

    /// A fresh command handle: eight draws, one byte each.
    pub fn handle(&mut self) -> [u8; 8] {
        let mut handle = [0u8; 8];
        for byte in handle.iter_mut() {
            *byte = self.lrand48() as u8;
        }
        handle
    }
}

impl RngCore for Lrand48 {
    fn next_u32(&mut self) -> u32 {
        // mrand48: the top 32 bits of the state
        (self.step() >> 16) as u32
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
