//! Rolling velocity windows over a fixed duration.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::amount::UsdcAmount;

#[derive(Debug, Clone, Copy)]
struct SpendEvent {
    amount: UsdcAmount,
    at: DateTime<Utc>,
}

/// A fixed-duration rolling window holding an ordered sequence of spend
/// events and a running sum. `total()` is kept in sync with the events
/// currently inside the window as of the last `evict`.
#[derive(Debug, Clone)]
pub struct VelocityWindow {
    duration: Duration,
    events: VecDeque<SpendEvent>,
    total: UsdcAmount,
}

impl VelocityWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            events: VecDeque::new(),
            total: UsdcAmount::ZERO,
        }
    }

    /// Drop all prefix events older than `now - duration`, decrementing the
    /// running sum accordingly. Events are appended in increasing `at` order
    /// so eviction only ever needs to look at the front of the deque.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.duration).unwrap_or_default();
        while let Some(front) = self.events.front() {
            if front.at < cutoff {
                self.total = self.total.saturating_sub(&front.amount);
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn add(&mut self, amount: UsdcAmount, at: DateTime<Utc>) {
        self.events.push_back(SpendEvent { amount, at });
        self.total = self.total.checked_add(&amount).unwrap_or(self.total);
    }

    /// Recompute the filtered sum as of `now` without mutating stored events.
    /// Used by read-only callers that must not pay for eviction bookkeeping.
    pub fn snapshot(&self, now: DateTime<Utc>) -> UsdcAmount {
        let cutoff = now - chrono::Duration::from_std(self.duration).unwrap_or_default();
        let mut sum = UsdcAmount::ZERO;
        for event in &self.events {
            if event.at >= cutoff {
                sum = sum.checked_add(&event.amount).unwrap_or(sum);
            }
        }
        sum
    }

    pub fn total(&self) -> UsdcAmount {
        self.total
    }
}
