// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Retry policy shared by the producer flush loop and the viewer reconnect loop
//
// I/O completions are reported as a `FlushOutcome`; the policy alone decides
// whether to continue, wait, or escalate.

use crate::broker::BrokerError;
use std::time::{Duration, Instant};

/// Result of one I/O attempt (a producer flush, a consumer commit)
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

impl FlushOutcome {
    pub fn from_broker<T>(result: &Result<T, BrokerError>) -> Self {
        match result {
            Ok(_) => FlushOutcome::Success,
            Err(e) if e.is_retryable() => FlushOutcome::Retryable(e.to_string()),
            Err(e) => FlushOutcome::Fatal(e.to_string()),
        }
    }
}

/// What the caller should do next
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Continue,
    RetryAfter(Duration),
    Escalate(String),
}

/// Capped exponential backoff: base, 2*base, 4*base, ... up to max
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Tracks consecutive failures and gates the next attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            attempts: 0,
            retry_at: None,
        }
    }

    /// Feed the outcome of an attempt and get the next step
    pub fn record(&mut self, outcome: &FlushOutcome) -> RetryDecision {
        match outcome {
            FlushOutcome::Success => {
                self.reset();
                RetryDecision::Continue
            }
            FlushOutcome::Retryable(_) => {
                let delay = self.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                RetryDecision::RetryAfter(delay)
            }
            FlushOutcome::Fatal(reason) => RetryDecision::Escalate(reason.clone()),
        }
    }

    /// Delay for the next consecutive failure; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Whether a gated retry may run now
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.map(|at| now >= at).unwrap_or(true)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.retry_at = None;
    }
}
