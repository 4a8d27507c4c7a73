//! Bilateral directed flow edges between agents.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::amount::UsdcAmount;

pub const EDGE_EVENT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct EdgeEvent {
    amount: UsdcAmount,
    at: DateTime<Utc>,
}

/// Cumulative directed edge `from -> to`, capped to the last hour of events.
#[derive(Debug, Clone)]
pub struct FlowEdge {
    volume: UsdcAmount,
    last_event: DateTime<Utc>,
    events: VecDeque<EdgeEvent>,
}

impl FlowEdge {
    pub fn new(amount: UsdcAmount, at: DateTime<Utc>) -> Self {
        let mut edge = Self {
            volume: UsdcAmount::ZERO,
            last_event: at,
            events: VecDeque::new(),
        };
        edge.update(amount, at);
        edge
    }

    pub fn update(&mut self, amount: UsdcAmount, at: DateTime<Utc>) {
        self.events.push_back(EdgeEvent { amount, at });
        self.volume = self.volume.checked_add(&amount).unwrap_or(self.volume);
        if at > self.last_event {
            self.last_event = at;
        }
        self.evict_old(at);
    }

    pub fn evict_old(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(EDGE_EVENT_RETENTION).unwrap_or_default();
        while let Some(front) = self.events.front() {
            if front.at < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn volume(&self) -> UsdcAmount {
        self.volume
    }

    pub fn last_event(&self) -> DateTime<Utc> {
        self.last_event
    }

    /// True if any retained event is newer than `now - window`.
    pub fn has_recent_event(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        self.events.iter().any(|e| e.at >= cutoff)
    }
}

/// Defensive copy of an edge's aggregate fields. Per-event history is not
/// copied out — callers query `has_recent_event` through the graph instead.
#[derive(Debug, Clone, Copy)]
pub struct FlowEdgeSnapshot {
    pub volume: UsdcAmount,
    pub last_event: DateTime<Utc>,
}

impl From<&FlowEdge> for FlowEdgeSnapshot {
    fn from(edge: &FlowEdge) -> Self {
        Self {
            volume: edge.volume,
            last_event: edge.last_event,
        }
    }
}

/// Lower-case both sides of an edge key so `(A, b)` and `(a, B)` collide.
pub fn edge_key(from: &str, to: &str) -> (String, String) {
    (from.to_lowercase(), to.to_lowercase())
}
