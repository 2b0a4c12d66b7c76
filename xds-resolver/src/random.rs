//! The randomness seam shared by route matching, weighted-cluster picks,
//! fault injection and the hash fallback.

use rand::Rng;

/// A source of uniform random values, callable from any thread.
///
/// Kept as a trait so deterministic tests can stub the draws.
pub trait ThreadSafeRandom: Send + Sync {
    /// Returns a uniform value in `[0, bound)`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is zero.
    fn next_below(&self, bound: u32) -> u32;

    /// Returns a uniform 64-bit value.
    fn next_u64(&self) -> u64;
}

/// [`ThreadSafeRandom`] backed by the thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRandom;

impl ThreadSafeRandom for SystemRandom {
    fn next_below(&self, bound: u32) -> u32 {
        rand::thread_rng().gen_range(0..bound)
    }

    fn next_u64(&self) -> u64 {
        rand::thread_rng().gen()
    }
}
