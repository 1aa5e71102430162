//! The random number generators used across the fuzzer.

use serde::{Deserialize, Serialize};

use crate::bolts::current_nanos;

/// The standard rand implementation to use
pub type StdRand = RomuDuoJrRand;

/// Ways to get random around here
pub trait Rand {
    /// Sets the seed of this rand
    fn set_seed(&mut self, seed: u64);

    /// Gets the next 64 bit value
    fn next(&mut self) -> u64;

    /// Gets a value below the given 64 bit val (exclusive)
    fn below(&mut self, upper_bound_excl: u64) -> u64 {
        if upper_bound_excl <= 1 {
            return 0;
        }

        /*
        Modulo is biased - we don't want our fuzzing to be biased so let's do it
        right. See
        https://stackoverflow.com/questions/10984974/why-do-people-say-there-is-modulo-bias-when-using-a-random-number-generator
        */
        let mut unbiased_rnd: u64;
        loop {
            unbiased_rnd = self.next();
            if unbiased_rnd < (u64::MAX - (u64::MAX % upper_bound_excl)) {
                break;
            }
        }

        unbiased_rnd % upper_bound_excl
    }

    /// Gets a value between the given lower bound (inclusive) and upper bound (inclusive)
    fn between(&mut self, lower_bound_incl: u64, upper_bound_incl: u64) -> u64 {
        debug_assert!(lower_bound_incl <= upper_bound_incl);
        lower_bound_incl + self.below(upper_bound_incl - lower_bound_incl + 1)
    }

    /// Choose an item from the given slice
    fn choose<'a, T>(&mut self, from: &'a [T]) -> &'a T {
        &from[self.below(from.len() as u64) as usize]
    }

    /// Gets a "true" with the given probability out of two
    fn coinflip(&mut self) -> bool {
        self.next() & 1 == 0
    }
}

/// Expand an arbitrary seed into well-mixed PRNG state words.
/// (splitmix64, the usual way to bootstrap small-state generators)
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// RomuDuoJr, the fastest of the Romu family with a 128 bit state.
/// See <https://www.romu-random.org/>
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct RomuDuoJrRand {
    x_state: u64,
    y_state: u64,
}

impl RomuDuoJrRand {
    /// Creates a new rand with the given seed
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        let mut rand = Self::default();
        rand.set_seed(seed);
        rand
    }

    /// Creates a new rand, seeded from the clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(current_nanos())
    }
}

impl Rand for RomuDuoJrRand {
    fn set_seed(&mut self, seed: u64) {
        let mut state = seed;
        self.x_state = splitmix64(&mut state);
        self.y_state = splitmix64(&mut state);
        // A zero state would stay zero forever.
        if self.y_state == 0 {
            self.y_state = 0x9e37_79b9_7f4a_7c15;
        }
    }

    #[inline]
    fn next(&mut self) -> u64 {
        let xp = self.x_state;
        self.x_state = 15_241_094_284_759_029_579_u64.wrapping_mul(self.y_state);
        self.y_state = self.y_state.wrapping_sub(xp).rotate_left(27);
        xp
    }
}

/// A fixed-sequence rand for tests: replays the given values, then wraps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FixedRand {
    values: Vec<u64>,
    idx: usize,
}

impl FixedRand {
    /// Replay the given raw `next()` values
    #[must_use]
    pub fn new(values: Vec<u64>) -> Self {
        Self { values, idx: 0 }
    }
}

impl Rand for FixedRand {
    fn set_seed(&mut self, _seed: u64) {
        self.idx = 0;
    }

    fn next(&mut self) -> u64 {
        let val = self.values[self.idx % self.values.len()];
        self.idx += 1;
        val
    }

    // The replayed values are taken at face value, no rejection sampling.
    fn below(&mut self, upper_bound_excl: u64) -> u64 {
        if upper_bound_excl <= 1 {
            return 0;
        }
        self.next() % upper_bound_excl
    }
}
