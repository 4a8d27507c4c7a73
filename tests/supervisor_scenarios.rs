//! End-to-end scenarios against `Supervisor` wired with the in-memory
//! baseline store, mirroring the six scenarios named in the design notes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Barrier;

use agent_ledger_supervisor::config::SupervisorConfig;
use agent_ledger_supervisor::ledger::HistoryEntry;
use agent_ledger_supervisor::store::{AgentBaseline, BaselineStore, InMemoryBaselineStore};
use agent_ledger_supervisor::supervisor::Supervisor;
use agent_ledger_supervisor::{Ledger, UsdcAmount};

#[derive(Default)]
struct RecordingLedger {
    slow: bool,
    next_id: std::sync::atomic::AtomicU64,
}

impl RecordingLedger {
    fn slow() -> Self {
        Self {
            slow: true,
            ..Default::default()
        }
    }

    async fn maybe_slow(&self) {
        if self.slow {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn deposit(&self, _agent: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn hold(&self, _agent: &str, _amount: UsdcAmount) -> anyhow::Result<String> {
        self.maybe_slow().await;
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("hold-{id}"))
    }
    async fn confirm_hold(&self, _agent: &str, _hold_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn release_hold(&self, _agent: &str, _hold_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn settle_hold(&self, _agent: &str, _hold_id: &str, _counterparty: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn spend(&self, _agent: &str, _counterparty: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn transfer(&self, _agent: &str, _counterparty: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn withdraw(&self, _agent: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn escrow_lock(&self, _agent: &str, _counterparty: &str, _amount: UsdcAmount) -> anyhow::Result<String> {
        Ok("escrow-0".to_string())
    }
    async fn release_escrow(&self, _agent: &str, _escrow_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn refund_escrow(&self, _agent: &str, _escrow_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn partial_escrow_settle(&self, _agent: &str, _escrow_id: &str, _counterparty: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn refund(&self, _agent: &str, _amount: UsdcAmount) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_balance(&self, _agent: &str) -> anyhow::Result<UsdcAmount> {
        Ok(UsdcAmount::ZERO)
    }
    async fn can_spend(&self, _agent: &str, _amount: UsdcAmount) -> anyhow::Result<bool> {
        Ok(true)
    }
    async fn get_history(&self, _agent: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn new_agent_per_tx_cap_then_velocity_ceiling() {
    let supervisor = Supervisor::new(Arc::new(RecordingLedger::default()), SupervisorConfig::default());

    let denied = supervisor.hold("agent-1", UsdcAmount::dollars("6.00")).await.unwrap_err();
    assert!(denied.is_denied());
    assert!(denied.denial_verdict().unwrap().reason.contains("$5"));

    for _ in 0..10 {
        let hold_id = supervisor.hold("agent-1", UsdcAmount::dollars("5.00")).await.unwrap();
        supervisor.release_hold("agent-1", &hold_id).await.unwrap();
    }

    let node = supervisor.graph().get_node("agent-1", Utc::now()).unwrap();
    assert_eq!(node.window_1hour, UsdcAmount::dollars("50"));

    let denied = supervisor.hold("agent-1", UsdcAmount::dollars("5.00")).await.unwrap_err();
    assert_eq!(denied.denial_verdict().unwrap().rule_name, "velocity");
}

#[tokio::test]
async fn concurrency_acquire_is_toctou_free_under_load() {
    let supervisor = Arc::new(Supervisor::new(Arc::new(RecordingLedger::slow()), SupervisorConfig::default()));
    let barrier = Arc::new(Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let supervisor = Arc::clone(&supervisor);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            supervisor.hold("agent-2", UsdcAmount::dollars("1.00")).await
        }));
    }

    let mut successes = 0;
    let mut concurrency_denials = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(err) if err.is_denied() => {
                if err.denial_verdict().unwrap().reason.contains("concurrency limit") {
                    concurrency_denials += 1;
                }
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 3);
    assert_eq!(concurrency_denials, 1);
}

#[tokio::test]
async fn baseline_anomaly_denies_with_floor_protection() {
    let store: Arc<dyn BaselineStore> = Arc::new(InMemoryBaselineStore::new());
    store
        .save_baseline_batch(&[AgentBaseline {
            agent_addr: "agent-3".to_string(),
            hourly_mean: UsdcAmount::dollars("20"),
            hourly_stddev: UsdcAmount::dollars("1"),
            sample_hours: 48,
            last_updated: Utc::now(),
        }])
        .await
        .unwrap();

    let supervisor = Supervisor::new(Arc::new(RecordingLedger::default()), SupervisorConfig::default());
    supervisor.wire_baseline_store(Arc::clone(&store));
    supervisor.baseline_cache().merge(store.get_all_baselines().await.unwrap());

    for _ in 0..8 {
        let hold_id = supervisor.hold("agent-3", UsdcAmount::dollars("4.00")).await.unwrap();
        supervisor.release_hold("agent-3", &hold_id).await.unwrap();
    }

    let denied = supervisor.hold("agent-3", UsdcAmount::dollars("4.00")).await.unwrap_err();
    assert_eq!(denied.denial_verdict().unwrap().rule_name, "baseline_anomaly");
}

#[tokio::test]
async fn idempotent_settlement_path_records_once() {
    let supervisor = Supervisor::new(Arc::new(RecordingLedger::default()), SupervisorConfig::default());

    let hold_id = supervisor.hold("agent-4", UsdcAmount::dollars("10.00")).await.unwrap();
    supervisor.confirm_hold("agent-4", &hold_id).await.unwrap();

    let hold_id = supervisor.hold("agent-4", UsdcAmount::dollars("10.00")).await.unwrap();
    supervisor
        .settle_hold("agent-4", &hold_id, "merchant", UsdcAmount::dollars("10.00"))
        .await
        .unwrap();

    let node = supervisor.graph().get_node("agent-4", Utc::now()).unwrap();
    assert_eq!(node.window_1hour, UsdcAmount::dollars("20"));
    let edge = supervisor.graph().get_edge("agent-4", "merchant").unwrap();
    assert_eq!(edge.volume, UsdcAmount::dollars("10"));
}

#[tokio::test]
async fn circular_flow_flags_without_blocking_the_closing_transfer() {
    let supervisor = Supervisor::new(Arc::new(RecordingLedger::default()), SupervisorConfig::default());

    supervisor.transfer("x", "y", UsdcAmount::dollars("10")).await.unwrap();
    supervisor.transfer("y", "z", UsdcAmount::dollars("10")).await.unwrap();
    supervisor.transfer("z", "x", UsdcAmount::dollars("10")).await.unwrap();

    supervisor.transfer("x", "y", UsdcAmount::dollars("10")).await.unwrap();

    let cycle = supervisor.graph().has_cyclic_flow("x", Duration::from_secs(3600), Utc::now());
    assert!(cycle.is_some());
}
