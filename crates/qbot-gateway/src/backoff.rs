//! Deterministic exponential backoff for session reconnects:
//! `delay = min(1000 · 2^attempts, 30000)` ms.

use std::time::Duration;

const BASE_MS: u64 = 1000;
const CAP_MS: u64 = 30_000;

/// Reconnect policy state owned by the supervisor.
#[derive(Debug)]
pub(crate) struct ReconnectPolicy {
    attempts: u32,
}

impl ReconnectPolicy {
    pub(crate) fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Record a failed connect or unexpected close and return the delay
    /// before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let exp = BASE_MS.saturating_mul(1u64.checked_shl(self.attempts).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(CAP_MS))
    }

    /// Reset after a successful transition into an active session.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
