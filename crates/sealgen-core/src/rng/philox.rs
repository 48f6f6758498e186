//! Philox 2x64-10 counter-based block function.
//!
//! One block maps a 128-bit counter and a 64-bit key to two 64-bit lanes.
//! For a fixed key the map is a bijection on counters, so distinct counters
//! never produce correlated blocks.

use serde::{Deserialize, Serialize};

pub const PHILOX_M2X64: u64 = 0xD2B7_4407_B1CE_6E93;
pub const PHILOX_W64: u64 = 0x9E37_79B9_7F4A_7C15;
pub const PHILOX_ROUNDS: usize = 10;

/// 128-bit block counter, split as `(hi, lo)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Counter {
    pub hi: u64,
    pub lo: u64,
}

impl Counter {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub fn from_u128(v: u128) -> Self {
        Self {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }

    pub fn as_u128(self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    /// Advance by `blocks`, `None` on 128-bit overflow.
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.as_u128().checked_add(blocks as u128).map(Self::from_u128)
    }

    /// Number of blocks between `self` and a later counter.
    pub fn blocks_until(self, later: Counter) -> Option<u128> {
        later.as_u128().checked_sub(self.as_u128())
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}:{:016x}", self.hi, self.lo)
    }
}

#[inline]
fn mulhilo(a: u64, b: u64) -> (u64, u64) {
    let product = (a as u128) * (b as u128);
    ((product >> 64) as u64, product as u64)
}

/// Compute one Philox 2x64-10 block.
pub fn philox2x64_10(counter: Counter, key: u64) -> [u64; 2] {
    let mut x0 = counter.lo;
    let mut x1 = counter.hi;
    let mut k = key;
    for _ in 0..PHILOX_ROUNDS {
        let (hi, lo) = mulhilo(PHILOX_M2X64, x0);
        x0 = hi ^ k ^ x1;
        x1 = lo;
        k = k.wrapping_add(PHILOX_W64);
    }
    [x0, x1]
}
