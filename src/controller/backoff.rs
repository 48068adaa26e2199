//! Retry policy
//!
//! Exponential backoff capped at a ceiling, plus per-request counters of
//! consecutive transient failures.

use crate::models::AssetId;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = (self.base.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.ceiling)
    }
}

/// Consecutive transient failures observed by one request's reconciles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Ticks in a row where the decision snapshot could not be completed
    pub decision_failures: u32,
    /// Ticks in a row each deployed asset was polled unhealthy
    pub unhealthy_polls: BTreeMap<AssetId, u32>,
}

impl RetryState {
    pub fn note_decision_failure(&mut self) -> u32 {
        self.decision_failures = self.decision_failures.saturating_add(1);
        self.decision_failures
    }

    pub fn decisions_recovered(&mut self) {
        self.decision_failures = 0;
    }

    pub fn note_unhealthy(&mut self, asset_id: &AssetId) -> u32 {
        let polls = self.unhealthy_polls.entry(asset_id.clone()).or_insert(0);
        *polls = polls.saturating_add(1);
        *polls
    }

    pub fn note_healthy(&mut self, asset_id: &AssetId) {
        self.unhealthy_polls.remove(asset_id);
    }

    /// Highest unhealthy streak among all assets, drives the requeue delay
    pub fn worst_streak(&self) -> u32 {
        self.unhealthy_polls.values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_counters() {
        let mut state = RetryState::default();
        let a = AssetId::new("c/a");
        assert_eq!(state.note_decision_failure(), 1);
        assert_eq!(state.note_decision_failure(), 2);
        state.decisions_recovered();
        assert_eq!(state.decision_failures, 0);

        state.note_unhealthy(&a);
        assert_eq!(state.note_unhealthy(&a), 2);
        assert_eq!(state.worst_streak(), 2);
        state.note_healthy(&a);
        assert_eq!(state.worst_streak(), 0);
    }
}
