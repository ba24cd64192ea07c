//! Delays: the sleep seam and randomized pacing.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DelayBounds;

/// Blocking delay on the single execution path.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn total(&self) -> Duration {
        self.slept().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        let mut slept = self
            .slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slept.push(duration);
    }
}

/// Draws uniformly random delays within configured bounds.
#[derive(Debug)]
pub struct Pacer {
    rng: StdRng,
}

impl Pacer {
    /// Seeded pacers are reproducible; unseeded ones draw from entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn next_delay(&mut self, bounds: &DelayBounds) -> Duration {
        if bounds.min_ms >= bounds.max_ms {
            return bounds.min();
        }
        Duration::from_millis(self.rng.gen_range(bounds.min_ms..=bounds.max_ms))
    }

    /// Uniform index below `len`. `None` for an empty range.
    pub fn pick(&mut self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.rng.gen_range(0..len))
    }
}
