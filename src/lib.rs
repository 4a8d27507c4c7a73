//! Agent Ledger Supervisor
//!
//! A decorating layer in front of an agent-facing payment ledger that
//! enforces per-tier velocity ceilings, concurrency limits, learned spend
//! baselines, and flow-graph anomaly detection before delegating to the
//! inner ledger implementation.

pub mod amount;
pub mod baseline_timer;
pub mod config;
pub mod error;
pub mod event_writer;
pub mod graph;
pub mod ledger;
pub mod rules;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod tier;

pub use amount::{AmountError, UsdcAmount};
pub use error::SupervisorError;
pub use ledger::{HistoryEntry, Ledger, ReputationProvider};
pub use supervisor::Supervisor;
pub use tier::{Tier, TierLimits};
