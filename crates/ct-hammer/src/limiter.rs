// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Per-log request rate limiting.

use std::{num::NonZeroU32, time::Duration};

use tokio::{
    sync::Mutex,
    time::{Interval, MissedTickBehavior},
};

/// Spaces requests evenly so that at most `rate` requests per second are issued.
///
/// Waiting callers are suspended on a timer; the limiter never polls.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Mutex<Interval>,
}

impl RateLimiter {
    /// Creates a limiter allowing `rate` requests per second.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(rate: NonZeroU32) -> Self {
        let period = (Duration::from_secs(1) / rate.get()).max(Duration::from_nanos(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Mutex::new(interval),
        }
    }

    /// Creates a limiter if `rate` is non-zero.
    pub fn from_rate(rate: u32) -> Option<Self> {
        NonZeroU32::new(rate).map(Self::new)
    }

    /// Waits until the next request may be issued.
    pub async fn acquire(&self) {
        self.interval.lock().await.tick().await;
    }
}
