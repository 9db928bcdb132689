//! Random draws (error rate, delay jitter, queue ids) are an injectable
//! capability so tests can seed them; a non-cryptographic PRNG is
//! sufficient for fault injection.

use std::time::Duration;

use rand::{Rng as _, SeedableRng};

/// Capability trait wrapping every random draw the core needs.
pub trait Rng: Send + Sync {
    /// A uniform draw in `[0, 1)`, compared against an error rate.
    fn uniform(&self) -> f64;

    /// A signed jitter offset in nanoseconds, within `[-variation,
    /// +variation]`.
    fn jitter_nanos(&self, variation: Duration) -> i64;

    /// A random, non-zero nfqueue id.
    fn queue_id(&self) -> u16;

    /// A random, non-zero reject mark, distinct per run so concurrent
    /// agents cannot collide.
    fn reject_mark(&self) -> u32;
}

/// `average ± jitter(variation)`, clamped so it never goes negative.
pub fn delayed(average: Duration, variation: Duration, rng: &dyn Rng) -> Duration {
    let offset = rng.jitter_nanos(variation);
    let average_nanos = average.as_nanos().min(i64::MAX as u128) as i64;

    let total_nanos = average_nanos.saturating_add(offset).max(0);
    Duration::from_nanos(total_nanos as u64)
}

/// Default implementation backed by `rand`'s thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRng;

impl Rng for ThreadRng {
    fn uniform(&self) -> f64 {
        rand::rng().random::<f64>()
    }

    fn jitter_nanos(&self, variation: Duration) -> i64 {
        signed_jitter(variation, &mut rand::rng())
    }

    fn queue_id(&self) -> u16 {
        nonzero_u16(&mut rand::rng())
    }

    fn reject_mark(&self) -> u32 {
        nonzero_u32(&mut rand::rng())
    }
}

/// Seeded implementation for deterministic tests.
#[derive(Debug)]
pub struct SeededRng {
    inner: std::sync::Mutex<rand::rngs::StdRng>,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: std::sync::Mutex::new(rand::rngs::StdRng::seed_from_u64(seed)),
        }
    }
}

impl Rng for SeededRng {
    fn uniform(&self) -> f64 {
        self.inner.lock().unwrap().random::<f64>()
    }

    fn jitter_nanos(&self, variation: Duration) -> i64 {
        signed_jitter(variation, &mut *self.inner.lock().unwrap())
    }

    fn queue_id(&self) -> u16 {
        nonzero_u16(&mut *self.inner.lock().unwrap())
    }

    fn reject_mark(&self) -> u32 {
        nonzero_u32(&mut *self.inner.lock().unwrap())
    }
}

fn signed_jitter(variation: Duration, rng: &mut impl rand::RngCore) -> i64 {
    if variation.is_zero() {
        return 0;
    }

    let bound = variation.as_nanos().min(i64::MAX as u128) as i64;
    rng.random_range(-bound..=bound)
}

fn nonzero_u16(rng: &mut impl rand::RngCore) -> u16 {
    loop {
        let value = rng.random::<u16>();
        if value != 0 {
            return value;
        }
    }
}

fn nonzero_u32(rng: &mut impl rand::RngCore) -> u32 {
    loop {
        let value = rng.random::<u32>();
        if value != 0 {
            return value;
        }
    }
}
