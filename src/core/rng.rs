//! Heartbeat Token Generator
//!
//! Xorshift128+ generator used to mint heartbeat challenge tokens.
//! Tokens only need to be unpredictable enough that a stale echo does not
//! match a fresh challenge; they are not a security boundary.

use std::time::{SystemTime, UNIX_EPOCH};

/// Xorshift128+ PRNG.
///
/// Seeded explicitly in tests (so heartbeat sequences are reproducible) and
/// from the wall clock in production.
///
/// # Example
///
/// ```
/// use ghost_server::core::rng::TokenRng;
///
/// let mut a = TokenRng::new(12345);
/// let mut b = TokenRng::new(12345);
/// assert_eq!(a.next_token(), b.next_token());
/// ```
#[derive(Clone, Debug)]
pub struct TokenRng {
    state: [u64; 2],
}

impl Default for TokenRng {
    fn default() -> Self {
        Self::from_clock()
    }
}

impl TokenRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG seeded from the system clock.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self::new(nanos as u64 ^ (nanos >> 64) as u64)
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a heartbeat token.
    ///
    /// Never returns 0: the UDP keep-alive carries token 0, and a real
    /// challenge must not be satisfiable by echoing one.
    pub fn next_token(&mut self) -> u32 {
        loop {
            let token = (self.next_u64() >> 32) as u32;
            if token != 0 {
                return token;
            }
        }
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// =============================================================================
// TESTS
// =============================================================================
