//! Per-agent rolling state: velocity windows, reservation counters, lifetime spend.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::amount::UsdcAmount;
use crate::graph::window::VelocityWindow;

pub const WINDOW_1_MIN: usize = 0;
pub const WINDOW_5_MIN: usize = 1;
pub const WINDOW_1_HOUR: usize = 2;

const WINDOW_DURATIONS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(3600),
];

/// Per-agent state. Created lazily on first observation, never destroyed.
#[derive(Debug, Clone)]
pub struct AgentNode {
    windows: [VelocityWindow; 3],
    active_holds: u32,
    active_escrows: u32,
    total_spent: UsdcAmount,
}

impl AgentNode {
    pub fn new() -> Self {
        Self {
            windows: WINDOW_DURATIONS.map(VelocityWindow::new),
            active_holds: 0,
            active_escrows: 0,
            total_spent: UsdcAmount::ZERO,
        }
    }

    pub fn record_spend(&mut self, amount: UsdcAmount, now: DateTime<Utc>) {
        for window in &mut self.windows {
            window.evict(now);
            window.add(amount, now);
        }
        self.total_spent = self.total_spent.checked_add(&amount).unwrap_or(self.total_spent);
    }

    pub fn window_total(&self, index: usize, now: DateTime<Utc>) -> UsdcAmount {
        self.windows[index].snapshot(now)
    }

    pub fn active_holds(&self) -> u32 {
        self.active_holds
    }

    pub fn active_escrows(&self) -> u32 {
        self.active_escrows
    }

    pub fn total_spent(&self) -> UsdcAmount {
        self.total_spent
    }

    fn active_slots(&self) -> u32 {
        self.active_holds + self.active_escrows
    }

    /// All-or-nothing check-and-increment against `limit`. Returns false and
    /// leaves counters unchanged if the ceiling would be exceeded.
    pub fn try_acquire_hold(&mut self, limit: u32) -> bool {
        if self.active_slots() >= limit {
            return false;
        }
        self.active_holds += 1;
        true
    }

    pub fn try_acquire_escrow(&mut self, limit: u32) -> bool {
        if self.active_slots() >= limit {
            return false;
        }
        self.active_escrows += 1;
        true
    }

    /// Returns false (an underflow signal) iff the counter was already zero.
    pub fn release_active_hold(&mut self) -> bool {
        if self.active_holds == 0 {
            return false;
        }
        self.active_holds -= 1;
        true
    }

    pub fn release_active_escrow(&mut self) -> bool {
        if self.active_escrows == 0 {
            return false;
        }
        self.active_escrows -= 1;
        true
    }
}

impl Default for AgentNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Defensive, read-only copy of an agent node's observable state.
#[derive(Debug, Clone, Copy)]
pub struct AgentNodeSnapshot {
    pub window_1min: UsdcAmount,
    pub window_5min: UsdcAmount,
    pub window_1hour: UsdcAmount,
    pub active_holds: u32,
    pub active_escrows: u32,
    pub total_spent: UsdcAmount,
}

impl AgentNodeSnapshot {
    pub fn from_node(node: &AgentNode, now: DateTime<Utc>) -> Self {
        Self {
            window_1min: node.window_total(WINDOW_1_MIN, now),
            window_5min: node.window_total(WINDOW_5_MIN, now),
            window_1hour: node.window_total(WINDOW_1_HOUR, now),
            active_holds: node.active_holds(),
            active_escrows: node.active_escrows(),
            total_spent: node.total_spent(),
        }
    }
}
