// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff with jitter.

use std::{num::Saturating, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Exponentially spaced delays.
///
/// Use [`next_delay()`][Self::next_delay] to get the values or [`wait()`][Self::wait] to
/// asynchronously pause for the expected delay. When constructed with a maximum number of
/// retries, the iterator ends after that many delays.
#[derive(Debug)]
pub struct ExponentialBackoff<R> {
    min_backoff: Duration,
    max_backoff: Duration,
    max_retries: Option<u32>,
    sequence_index: u32,
    rng: R,
}

impl ExponentialBackoff<StdRng> {
    /// Creates a new backoff whose jitter is drawn from an RNG seeded with `seed`.
    pub fn new_with_seed(
        min_backoff: Duration,
        max_backoff: Duration,
        max_retries: Option<u32>,
        seed: u64,
    ) -> Self {
        Self::new_with_rng(
            min_backoff,
            max_backoff,
            max_retries,
            StdRng::seed_from_u64(seed),
        )
    }
}

impl<R> ExponentialBackoff<R> {
    /// Upper bound, in milliseconds, of the random offset added to each delay.
    pub const MAX_RAND_OFFSET_MS: u64 = 250;
}

impl<R: Rng> ExponentialBackoff<R> {
    /// Creates a new backoff drawing its jitter from `rng`.
    pub fn new_with_rng(
        min_backoff: Duration,
        max_backoff: Duration,
        max_retries: Option<u32>,
        rng: R,
    ) -> Self {
        Self {
            min_backoff,
            max_backoff,
            max_retries,
            sequence_index: 0,
            rng,
        }
    }

    /// Returns the next delay and advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let next_delay_value = self
            .min_backoff
            .saturating_mul(Saturating(2u32).pow(self.sequence_index).0)
            .min(self.max_backoff);

        self.sequence_index = self.sequence_index.saturating_add(1);

        // Jitter only while below the ceiling.
        if next_delay_value < self.max_backoff {
            next_delay_value
                .saturating_add(self.random_offset())
                .min(self.max_backoff)
        } else {
            next_delay_value
        }
    }

    /// Waits for the amount of time returned by [`next_delay()`][Self::next_delay].
    pub async fn wait(&mut self) {
        let wait = self.next_delay();
        tracing::debug!(?wait, "exponentially backing off");
        tokio::time::sleep(wait).await
    }

    fn random_offset(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(0..=Self::MAX_RAND_OFFSET_MS))
    }
}

impl<R: Rng> Iterator for ExponentialBackoff<R> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .max_retries
            .is_some_and(|max_retries| self.sequence_index >= max_retries)
        {
            return None;
        }
        Some(self.next_delay())
    }
}
