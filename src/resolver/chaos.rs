//! Chaos settings and the randomness behind them.
//!
//! Every random decision the engine makes goes through a [`RandomSource`],
//! so a run can be made reproducible ([`SeededRandom`]) or fully scripted
//! ([`FixedRandom`], [`SequenceRandom`]).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ERROR_PROBABILITY, DEFAULT_SEQUENTIAL_PROBABILITY};

/// Probabilities driving chaos mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Chance that a task's lookups run one after another.
    pub sequential_probability: f64,
    /// Chance that any single lookup is replaced by a synthetic failure.
    pub error_probability: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            sequential_probability: DEFAULT_SEQUENTIAL_PROBABILITY,
            error_probability: DEFAULT_ERROR_PROBABILITY,
        }
    }
}

impl ChaosConfig {
    /// Chaos disabled: always concurrent, never injects failures.
    pub fn disabled() -> Self {
        Self {
            sequential_probability: 0.0,
            error_probability: 0.0,
        }
    }
}

/// Returns `true` if `p` is a usable probability.
pub fn is_valid_probability(p: f64) -> bool {
    p.is_finite() && (0.0..=1.0).contains(&p)
}

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    /// Returns the next draw.
    fn next_f64(&self) -> f64;
}

/// Draws from the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Reproducible draws from a seeded [`StdRng`].
pub struct SeededRandom {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Creates a generator from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The seed this generator started from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl fmt::Debug for SeededRandom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededRandom")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}

/// Always returns the same draw.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Returns scripted draws in order, then keeps repeating the last one.
/// An empty script always draws `0.0`.
#[derive(Debug)]
pub struct SequenceRandom {
    draws: Mutex<VecDeque<f64>>,
}

impl SequenceRandom {
    /// Creates a source that replays `draws`.
    pub fn new(draws: impl IntoIterator<Item = f64>) -> Self {
        Self {
            draws: Mutex::new(draws.into_iter().collect()),
        }
    }

    /// Number of scripted draws not yet consumed.
    pub fn remaining(&self) -> usize {
        self.draws.lock().len()
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        let mut draws = self.draws.lock();
        if draws.len() > 1 {
            draws.pop_front().unwrap_or_default()
        } else {
            draws.front().copied().unwrap_or_default()
        }
    }
}

/// Seeded source when `seed` is set, thread-local otherwise.
pub fn random_source(seed: Option<u64>) -> Arc<dyn RandomSource> {
    match seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    }
}
