//! The upstream ledger contract the supervisor decorates. The reconciliation
//! engine, webhooks, and the actual balance/escrow bookkeeping live in an
//! external collaborator; this crate only depends on the trait shape.

use async_trait::async_trait;

use crate::amount::UsdcAmount;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub op_type: String,
    pub counterparty: String,
    pub amount: UsdcAmount,
}

/// Every mutating operation takes an opaque reference string identifying the
/// agent the call concerns; errors are propagated unchanged to the caller
/// after any reserved concurrency slot is rolled back.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn deposit(&self, agent: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn hold(&self, agent: &str, amount: UsdcAmount) -> anyhow::Result<String>;
    async fn confirm_hold(&self, agent: &str, hold_id: &str) -> anyhow::Result<()>;
    async fn release_hold(&self, agent: &str, hold_id: &str) -> anyhow::Result<()>;
    async fn settle_hold(&self, agent: &str, hold_id: &str, counterparty: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn spend(&self, agent: &str, counterparty: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn transfer(&self, agent: &str, counterparty: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn withdraw(&self, agent: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn escrow_lock(&self, agent: &str, counterparty: &str, amount: UsdcAmount) -> anyhow::Result<String>;
    async fn release_escrow(&self, agent: &str, escrow_id: &str) -> anyhow::Result<()>;
    async fn refund_escrow(&self, agent: &str, escrow_id: &str) -> anyhow::Result<()>;
    async fn partial_escrow_settle(&self, agent: &str, escrow_id: &str, counterparty: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn refund(&self, agent: &str, amount: UsdcAmount) -> anyhow::Result<()>;
    async fn get_balance(&self, agent: &str) -> anyhow::Result<UsdcAmount>;
    async fn can_spend(&self, agent: &str, amount: UsdcAmount) -> anyhow::Result<bool>;
    async fn get_history(&self, agent: &str) -> anyhow::Result<Vec<HistoryEntry>>;
}

/// Reputation provider contract. `score` returns a raw tier string, one of
/// `{"new", "emerging", "established", "trusted", "elite"}`, empty, or an
/// error; the supervisor owns the fail-closed normalization (`Tier::from_provider_result`).
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    async fn score(&self, agent: &str) -> anyhow::Result<(f64, String)>;
}
