// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconnect backoff with Fibonacci growth.
//
// delay(n) = min(delay(n-1) + delay(n-2), max_delay), both seeds = initial.
// With the defaults that is 3, 3, 6, 9, 15, 24, 30, 30, ... seconds.

use std::time::Duration;

use labwerk_core::config::BackoffSettings;
use tracing::debug;

/// Backoff state for the session's reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            next: initial,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.initial_delay(), settings.max_delay())
    }

    /// Delay before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.next;
        self.next = delay.saturating_add(self.next).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "backoff advanced"
        );
        delay
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.next = self.initial;
        self.attempt = 0;
    }

    /// Failed or dropped attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
