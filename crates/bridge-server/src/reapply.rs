//! Exponential backoff for re-applying activation side effects.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Backoff schedule of one activation kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReapplyPolicy {
    pub initial_delay: Duration,
    pub maximum_delay: Duration,
    pub factor: f64,
}

impl ReapplyPolicy {
    /// A zero initial delay turns re-application off
    pub fn enabled(&self) -> bool {
        !self.initial_delay.is_zero()
    }

    /// Number of iterations after which the delay saturates at the maximum
    pub fn max_iterations(&self) -> u32 {
        if self.factor <= 1.0 || self.initial_delay.is_zero() {
            return 1;
        }
        let ratio = self.maximum_delay.as_secs_f64() / self.initial_delay.as_secs_f64();
        let iterations = (ratio.ln() / self.factor.ln()).ceil();
        if iterations < 1.0 { 1 } else { iterations as u32 }
    }

    /// Delay before re-application number `iteration + 1`
    pub fn delay_on_iteration(&self, iteration: u32) -> Duration {
        if iteration >= self.max_iterations() {
            return self.maximum_delay;
        }
        let delay = self.initial_delay.mul_f64(self.factor.powi(iteration as i32));
        delay.min(self.maximum_delay)
    }
}

/// Armed state of one reapply timer
#[derive(Debug, Clone)]
pub struct Reapply {
    policy: ReapplyPolicy,
    count: u32,
    next: Option<DateTime<Utc>>,
}

impl Reapply {
    pub fn new(policy: ReapplyPolicy) -> Self {
        Self {
            policy,
            count: 0,
            next: None,
        }
    }

    /// Number of re-applications done since the last arming
    pub fn count(&self) -> u32 {
        self.count
    }

    /// When the timer fires next; `None` when disarmed
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    /// Start over after a fresh activation at `now`
    pub fn arm(&mut self, now: DateTime<Utc>) {
        self.count = 0;
        self.next = after(now, self.policy.initial_delay);
    }

    pub fn disarm(&mut self) {
        self.next = None;
    }

    /// Schedule the next firing after a re-application at `now`
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        self.next = after(now, self.policy.delay_on_iteration(self.count));
    }

    /// Disarm and return the iteration number if the timer is due at `now`
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Option<u32> {
        match self.next {
            Some(next) if next <= now => {
                self.next = None;
                Some(self.count)
            }
            _ => None,
        }
    }
}

/// `None` when `now + delay` is not representable
fn after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
}

/// Reapply timers of a bridge; `None` where the policy is disabled
#[derive(Debug, Clone, Default)]
pub struct ReapplyState {
    pub bridge: Option<Reapply>,
    pub interface: Option<Reapply>,
}

impl ReapplyState {
    pub fn new(bridge: ReapplyPolicy, interface: ReapplyPolicy) -> Self {
        Self {
            bridge: bridge.enabled().then(|| Reapply::new(bridge)),
            interface: interface.enabled().then(|| Reapply::new(interface)),
        }
    }
}
