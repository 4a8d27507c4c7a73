//! Hourly background worker: warms the spend graph on boot, then on every
//! tick prunes stale spend events and recomputes per-agent baselines.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::amount::UsdcAmount;
use crate::graph::SpendGraph;
use crate::store::{AgentBaseline, BaselineCache, BaselineStore, BASELINE_SAMPLE_WINDOW, SPEND_EVENT_RETENTION};

pub const TICK_PERIOD: Duration = Duration::from_secs(3600);
const MIN_HOURLY_BUCKETS: usize = 24;

pub struct BaselineTimerHandle {
    pub join: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

impl BaselineTimerHandle {
    /// Idempotent, non-blocking stop signal: a capacity-1 channel that drops
    /// silently if a stop is already pending.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

pub struct BaselineTimer;

impl BaselineTimer {
    /// Warm up (load baselines, replay the last hour of events into the
    /// graph) and then spawn the hourly recompute loop.
    pub async fn start(store: Arc<dyn BaselineStore>, cache: Arc<BaselineCache>, graph: Arc<SpendGraph>) -> BaselineTimerHandle {
        Self::warm_up(&store, &cache, &graph).await;

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_PERIOD);
            ticker.tick().await; // first tick fires immediately; skip it, warm_up already ran.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_tick_guarded(&store, &cache).await;
                    }
                    _ = stop_rx.recv() => {
                        info!("baseline timer received stop signal");
                        break;
                    }
                }
            }
        });

        BaselineTimerHandle { join, stop_tx }
    }

    async fn warm_up(store: &Arc<dyn BaselineStore>, cache: &Arc<BaselineCache>, graph: &Arc<SpendGraph>) {
        match store.get_all_baselines().await {
            Ok(baselines) => cache.merge(baselines),
            Err(err) => warn!(error = %err, "failed to load baselines on startup"),
        }

        let since = Utc::now() - ChronoDuration::hours(1);
        match store.get_recent_spend_events(since).await {
            Ok(events) => {
                for event in events {
                    graph.record_event(&event.agent_addr, &event.counterparty, event.amount, event.created_at);
                }
            }
            Err(err) => warn!(error = %err, "failed to replay recent spend events on startup"),
        }
    }

    async fn run_tick_guarded(store: &Arc<dyn BaselineStore>, cache: &Arc<BaselineCache>) {
        let result = AssertUnwindSafe(Self::run_tick(store, cache)).catch_unwind().await;
        if result.is_err() {
            error!("panic during baseline timer tick; continuing to next period");
        }
    }

    async fn run_tick(store: &Arc<dyn BaselineStore>, cache: &Arc<BaselineCache>) {
        let now = Utc::now();

        let prune_before = now - SPEND_EVENT_RETENTION;
        match store.prune_old_events(prune_before).await {
            Ok(deleted) => info!(deleted, "pruned old spend events"),
            Err(err) => {
                warn!(error = %err, "failed to prune old spend events");
                return;
            }
        }

        let sample_since = now - BASELINE_SAMPLE_WINDOW;
        let agents = match store.get_all_agents_with_events(sample_since).await {
            Ok(agents) => agents,
            Err(err) => {
                warn!(error = %err, "failed to list agents with recent events");
                return;
            }
        };

        let mut fresh = Vec::new();
        for agent in agents {
            match store.get_hourly_totals(&agent, sample_since).await {
                Ok(totals) if totals.len() >= MIN_HOURLY_BUCKETS => {
                    let values: Vec<i128> = totals.values().map(UsdcAmount::minor_units).collect();
                    let (mean, stddev) = compute_mean_and_stddev(&values);
                    fresh.push(AgentBaseline {
                        agent_addr: agent,
                        hourly_mean: UsdcAmount::from_minor_units(mean),
                        hourly_stddev: UsdcAmount::from_minor_units(stddev),
                        sample_hours: totals.len() as u32,
                        last_updated: now,
                    });
                }
                Ok(_) => {} // fewer than 24 hourly buckets: skip, let VelocityRule govern
                Err(err) => warn!(error = %err, agent, "failed to fetch hourly totals"),
            }
        }

        if fresh.is_empty() {
            return;
        }

        match store.save_baseline_batch(&fresh).await {
            Ok(()) => cache.merge(fresh),
            Err(err) => warn!(error = %err, "failed to persist recomputed baselines"),
        }
    }
}

/// Population mean and stddev over big-integer minor-unit sums, with a
/// final sqrt in double precision. Safe for behavioral thresholds since an
/// agent's hourly spend is bounded well below 2^53 minor units.
fn compute_mean_and_stddev(values: &[i128]) -> (i128, i128) {
    if values.is_empty() {
        return (0, 0);
    }
    let n = values.len() as i128;
    let sum: i128 = values.iter().sum();
    let mean = sum / n;
    let variance_sum: i128 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    let variance = variance_sum / n;
    let stddev = (variance as f64).sqrt() as i128;
    (mean, stddev)
}
