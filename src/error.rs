//! The supervisor's closed error taxonomy.
//!
//! `SupervisorError::Denied` is the one sentinel callers are expected to
//! match on; everything else is either returned unchanged from the inner
//! ledger or never leaves the supervisor at all.

use thiserror::Error;

use crate::amount::AmountError;
use crate::rules::Verdict;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    /// Authoritative denial: either a rule returned `Deny` or the
    /// concurrency ceiling was reached. Carries the verdict that produced it
    /// so callers can inspect `rule_name` / `reason` without re-parsing text.
    #[error("denied: {}", .0.reason)]
    Denied(Verdict),

    #[error("inner ledger error: {0}")]
    InnerLedger(#[source] anyhow::Error),
}

impl SupervisorError {
    pub fn is_denied(&self) -> bool {
        matches!(self, SupervisorError::Denied(_))
    }

    pub fn denial_verdict(&self) -> Option<&Verdict> {
        match self {
            SupervisorError::Denied(verdict) => Some(verdict),
            _ => None,
        }
    }
}

/// Internal-only faults that are logged but never surfaced to callers: a
/// release on an already-zero counter (a programming bug elsewhere) or a
/// failure reaching the baseline/event store (the control path must survive
/// a dead store).
#[derive(Debug, Error)]
pub enum InternalFault {
    #[error("slot underflow releasing {kind} for agent {agent}")]
    SlotUnderflow { agent: String, kind: &'static str },

    #[error("persistence failure in {context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
