//! Deterministic random number generation for synthetic source data.
//!
//! RULE: Nothing in the crate may call any platform RNG.
//! All randomness flows through SynthRng streams derived from a single
//! master seed.
//!
//! Each source table gets its own stream, seeded from
//! (master_seed XOR slot_index * golden), so:
//!   - Adding a new table never changes the existing tables' data.
//!   - Each table is reproducible in isolation.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for one synthetic table.
pub struct SynthRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl SynthRng {
    pub fn new(master_seed: u64, slot_index: u64) -> Self {
        let derived_seed = master_seed ^ (slot_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n). `n == 0` yields 0.
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Uniform float in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Standard normal draw (Box-Muller).
    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        mean + std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Pick one element uniformly. None for an empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.get(self.next_u64_below(items.len() as u64) as usize)
    }
}

pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn for_stream(&self, slot: StreamSlot) -> SynthRng {
        SynthRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable stream slot assignments.
/// NEVER reorder or remove entries, only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Profiles = 0,
    Contracts = 1,
    Consumption = 2,
    Prices = 3,
    Billing = 4,
    Interactions = 5,
    Labels = 6,
}

impl StreamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Contracts => "contracts",
            Self::Consumption => "consumption",
            Self::Prices => "prices",
            Self::Billing => "billing",
            Self::Interactions => "interactions",
            Self::Labels => "labels",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_are_reproducible_and_independent() {
        let bank = RngBank::new(42);
        let mut a = bank.for_stream(StreamSlot::Contracts);
        let mut b = RngBank::new(42).for_stream(StreamSlot::Contracts);
        let mut c = bank.for_stream(StreamSlot::Billing);
        let xs: Vec<f64> = (0..8).map(|_| a.next_f64()).collect();
        let ys: Vec<f64> = (0..8).map(|_| b.next_f64()).collect();
        let zs: Vec<f64> = (0..8).map(|_| c.next_f64()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs, zs);
        assert!(xs.iter().all(|x| (0.0..1.0).contains(x)));
    }
}
