// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-host rate limiting for diagnostics a device can trigger at will.

use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    period: Duration,
    last: Option<Instant>,
    missed: u64,
}

/// The event should not be logged.
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    /// Allows one event per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                period,
                last: None,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed_events)` if this event should be logged.
    ///
    /// Never blocks: a concurrent caller holding the limiter counts as having
    /// logged.
    pub fn event(&self) -> Result<u64, RateLimited> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Result<u64, RateLimited> {
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        if let Some(last) = state.last {
            if now.saturating_duration_since(last) <= state.period {
                state.missed += 1;
                return Err(RateLimited);
            }
        }
        state.last = Some(now);
        Ok(std::mem::take(&mut state.missed))
    }
}
