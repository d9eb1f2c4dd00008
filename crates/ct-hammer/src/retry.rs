// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! How a worker reacts to failed rounds.

use std::{future::Future, time::Duration};

use ct_hammer_utils::backoff::ExponentialBackoff;
use rand::rngs::StdRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Smallest delay between two attempts of a round.
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);
/// Largest delay between two attempts of a round.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// The error policy of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// Whether failing rounds are retried.
    pub ignore_errors: bool,
    /// How long a round is retried, measured from its first attempt.
    pub max_retry: Duration,
}

impl ErrorPolicy {
    /// The first failure terminates the worker.
    pub fn fail_fast() -> Self {
        Self {
            ignore_errors: false,
            max_retry: Duration::ZERO,
        }
    }

    /// Failures are retried for up to `max_retry`.
    pub fn retry_for(max_retry: Duration) -> Self {
        Self {
            ignore_errors: true,
            max_retry,
        }
    }

    /// Runs `attempt` until it succeeds or the policy gives up.
    ///
    /// `on_retry` is called with every error that is retried and the delay before the next
    /// attempt. Cancellation is observed both while an attempt is in flight and while backing
    /// off.
    pub async fn run<T, F, Fut>(
        &self,
        backoff_seed: u64,
        cancel: &CancellationToken,
        mut attempt: F,
        mut on_retry: impl FnMut(&anyhow::Error, Duration),
    ) -> Result<T, RoundError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut backoff: ExponentialBackoff<StdRng> =
            ExponentialBackoff::new_with_seed(MIN_BACKOFF, MAX_BACKOFF, None, backoff_seed);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RoundError::Cancelled),
                result = attempt() => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.ignore_errors {
                return Err(RoundError::Failed(error));
            }
            let elapsed = started.elapsed();
            if elapsed >= self.max_retry {
                return Err(RoundError::Failed(error.context(format!(
                    "giving up after {attempts} attempts in {elapsed:?}"
                ))));
            }

            let delay = backoff.next_delay().min(self.max_retry - elapsed);
            on_retry(&error, delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RoundError::Cancelled),
                _ = tokio::time::sleep(delay) => (),
            }
        }
    }
}

/// Why a round did not complete.
#[derive(Debug)]
pub enum RoundError {
    /// The worker was cancelled.
    Cancelled,
    /// The round failed and the policy gave up on it.
    Failed(anyhow::Error),
}
